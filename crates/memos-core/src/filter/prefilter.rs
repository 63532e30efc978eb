//! Static derivation of the SQL-pushable prefilter.
//!
//! The derived prefilter must admit every memo the exact filter matches; it
//! may admit more. Anything the derivation does not recognise contributes
//! no constraint.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::models::{Memo, MemoState, Visibility};

use super::ast::{ComprehensionKind, Expr, Func, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMatchKind {
    Exact,
    Prefix,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TagMatchOption {
    pub kind: TagMatchKind,
    pub value: String,
}

impl TagMatchOption {
    pub fn exact(value: impl Into<String>) -> Self {
        Self {
            kind: TagMatchKind::Exact,
            value: value.into(),
        }
    }

    pub fn prefix(value: impl Into<String>) -> Self {
        Self {
            kind: TagMatchKind::Prefix,
            value: value.into(),
        }
    }

    pub fn matches(&self, tag: &str) -> bool {
        match self.kind {
            TagMatchKind::Exact => tag == self.value,
            TagMatchKind::Prefix => tag.starts_with(&self.value),
        }
    }
}

/// Any one option matching any one tag satisfies the group.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TagMatchGroup {
    pub options: Vec<TagMatchOption>,
}

impl TagMatchGroup {
    fn new(options: impl IntoIterator<Item = TagMatchOption>) -> Self {
        let options: BTreeSet<_> = options.into_iter().collect();
        Self {
            options: options.into_iter().collect(),
        }
    }

    pub fn matches_any(&self, tags: &[String]) -> bool {
        tags.iter()
            .any(|tag| self.options.iter().any(|o| o.matches(tag)))
    }
}

/// Coarse constraints pushed down to storage.
///
/// Empty vectors and `None` mean "unconstrained". Tag groups AND together;
/// exclude groups forbid every listed option.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoSqlPrefilter {
    pub creator_ids: Vec<i64>,
    pub visibility_in: Vec<Visibility>,
    pub state_in: Vec<MemoState>,
    pub pinned: Option<bool>,
    pub has_link: Option<bool>,
    pub has_task_list: Option<bool>,
    pub has_code: Option<bool>,
    pub has_incomplete_tasks: Option<bool>,
    pub tag_groups: Vec<TagMatchGroup>,
    pub exclude_tag_groups: Vec<TagMatchGroup>,
    pub unsatisfiable: bool,
}

impl MemoSqlPrefilter {
    pub fn unconstrained() -> Self {
        Self::default()
    }

    pub fn unsatisfiable() -> Self {
        Self {
            unsatisfiable: true,
            ..Self::default()
        }
    }

    pub fn is_unconstrained(&self) -> bool {
        *self == Self::default()
    }

    /// Whether `memo` passes every constraint, read as a predicate.
    pub fn admits(&self, memo: &Memo) -> bool {
        if self.unsatisfiable {
            return false;
        }
        let bool_ok = |want: Option<bool>, have: bool| want.map_or(true, |w| w == have);

        (self.creator_ids.is_empty() || self.creator_ids.contains(&memo.creator_id))
            && (self.visibility_in.is_empty() || self.visibility_in.contains(&memo.visibility))
            && (self.state_in.is_empty() || self.state_in.contains(&memo.state))
            && bool_ok(self.pinned, memo.pinned)
            && bool_ok(self.has_link, memo.property.has_link)
            && bool_ok(self.has_task_list, memo.property.has_task_list)
            && bool_ok(self.has_code, memo.property.has_code)
            && bool_ok(self.has_incomplete_tasks, memo.property.has_incomplete_tasks)
            && self.tag_groups.iter().all(|g| g.matches_any(&memo.tags))
            && !self
                .exclude_tag_groups
                .iter()
                .any(|g| g.matches_any(&memo.tags))
    }

    fn and(self, other: Self) -> Self {
        if self.unsatisfiable || other.unsatisfiable {
            return Self::unsatisfiable();
        }
        let (Some(creator_ids), Some(visibility_in), Some(state_in)) = (
            intersect(self.creator_ids, other.creator_ids),
            intersect(self.visibility_in, other.visibility_in),
            intersect(self.state_in, other.state_in),
        ) else {
            return Self::unsatisfiable();
        };

        let mut tag_groups = self.tag_groups;
        tag_groups.extend(other.tag_groups);
        let mut exclude_tag_groups = self.exclude_tag_groups;
        exclude_tag_groups.extend(other.exclude_tag_groups);

        Self {
            creator_ids,
            visibility_in,
            state_in,
            pinned: unify(self.pinned, other.pinned),
            has_link: unify(self.has_link, other.has_link),
            has_task_list: unify(self.has_task_list, other.has_task_list),
            has_code: unify(self.has_code, other.has_code),
            has_incomplete_tasks: unify(self.has_incomplete_tasks, other.has_incomplete_tasks),
            tag_groups: dedup_groups(tag_groups),
            exclude_tag_groups: dedup_groups(exclude_tag_groups),
            unsatisfiable: false,
        }
    }

    fn or(self, other: Self) -> Self {
        if self.unsatisfiable {
            return other;
        }
        if other.unsatisfiable {
            return self;
        }
        Self {
            creator_ids: union(self.creator_ids, other.creator_ids),
            visibility_in: union(self.visibility_in, other.visibility_in),
            state_in: union(self.state_in, other.state_in),
            pinned: widen(self.pinned, other.pinned),
            has_link: widen(self.has_link, other.has_link),
            has_task_list: widen(self.has_task_list, other.has_task_list),
            has_code: widen(self.has_code, other.has_code),
            has_incomplete_tasks: widen(self.has_incomplete_tasks, other.has_incomplete_tasks),
            tag_groups: common_groups(self.tag_groups, &other.tag_groups),
            exclude_tag_groups: common_groups(self.exclude_tag_groups, &other.exclude_tag_groups),
            unsatisfiable: false,
        }
    }
}

/// `None` when both sides are constrained and share nothing.
fn intersect<T: Ord + Copy>(a: Vec<T>, b: Vec<T>) -> Option<Vec<T>> {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => Some(b),
        (_, true) => Some(a),
        _ => {
            let out: Vec<T> = a.into_iter().filter(|x| b.contains(x)).collect();
            if out.is_empty() {
                None
            } else {
                Some(out)
            }
        }
    }
}

fn union<T: Ord + Copy>(a: Vec<T>, b: Vec<T>) -> Vec<T> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let set: BTreeSet<T> = a.into_iter().chain(b).collect();
    set.into_iter().collect()
}

fn unify(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (None, x) | (x, None) => x,
        (Some(x), Some(y)) if x == y => Some(x),
        _ => None,
    }
}

fn widen(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(x), Some(y)) if x == y => Some(x),
        _ => None,
    }
}

fn dedup_groups(groups: Vec<TagMatchGroup>) -> Vec<TagMatchGroup> {
    let set: BTreeSet<_> = groups.into_iter().collect();
    set.into_iter().collect()
}

fn common_groups(a: Vec<TagMatchGroup>, b: &[TagMatchGroup]) -> Vec<TagMatchGroup> {
    a.into_iter().filter(|g| b.contains(g)).collect()
}

fn sorted<T: Ord>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    let set: BTreeSet<T> = items.into_iter().collect();
    set.into_iter().collect()
}

/// Derive the prefilter of a checked expression.
pub fn derive(expr: &Expr) -> MemoSqlPrefilter {
    derive_inner(expr, false)
}

/// Prefilter admitting every memo for which `expr` (or `!expr` when
/// `negated`) evaluates to true.
fn derive_inner(expr: &Expr, negated: bool) -> MemoSqlPrefilter {
    match expr {
        Expr::Const(Value::Bool(b)) => {
            if *b != negated {
                MemoSqlPrefilter::unconstrained()
            } else {
                MemoSqlPrefilter::unsatisfiable()
            }
        }
        Expr::Const(_) | Expr::List(_) => MemoSqlPrefilter::unconstrained(),
        Expr::Ident(name) => bool_field(name, !negated),
        Expr::Call {
            func,
            target: None,
            args,
        } => match (func, args.as_slice()) {
            (Func::Not, [x]) => derive_inner(x, !negated),
            (Func::And, [l, r]) if !negated => derive_inner(l, false).and(derive_inner(r, false)),
            (Func::And, [l, r]) => derive_inner(l, true).or(derive_inner(r, true)),
            (Func::Or, [l, r]) if !negated => derive_inner(l, false).or(derive_inner(r, false)),
            (Func::Or, [l, r]) => derive_inner(l, true).and(derive_inner(r, true)),
            (Func::Eq, [l, r]) => equality(l, r, negated),
            (Func::Ne, [l, r]) => equality(l, r, !negated),
            (Func::In, [elem, list]) => membership(elem, list, negated),
            _ => MemoSqlPrefilter::unconstrained(),
        },
        Expr::Call { .. } => MemoSqlPrefilter::unconstrained(),
        Expr::Comprehension {
            kind: ComprehensionKind::Exists,
            var,
            range,
            predicate,
        } if **range == Expr::ident("tags") => match tag_options(var, predicate) {
            Some(options) => tag_group(options, negated),
            None => MemoSqlPrefilter::unconstrained(),
        },
        Expr::Comprehension { .. } => MemoSqlPrefilter::unconstrained(),
    }
}

fn bool_field(name: &str, value: bool) -> MemoSqlPrefilter {
    let mut pf = MemoSqlPrefilter::unconstrained();
    let slot = match name {
        "pinned" => &mut pf.pinned,
        "has_link" => &mut pf.has_link,
        "has_task_list" => &mut pf.has_task_list,
        "has_code" => &mut pf.has_code,
        "has_incomplete_tasks" => &mut pf.has_incomplete_tasks,
        _ => return pf,
    };
    *slot = Some(value);
    pf
}

/// `field == literal` in either operand order; `negated` reads it as `!=`.
fn equality(l: &Expr, r: &Expr, negated: bool) -> MemoSqlPrefilter {
    let (field, value) = match (l, r) {
        (Expr::Ident(f), Expr::Const(v)) | (Expr::Const(v), Expr::Ident(f)) => (f.as_str(), v),
        _ => return MemoSqlPrefilter::unconstrained(),
    };

    match (field, value) {
        ("creator_id", Value::Int(id)) if !negated => MemoSqlPrefilter {
            creator_ids: vec![*id],
            ..Default::default()
        },
        ("visibility", Value::String(s)) => {
            enum_constraint(Visibility::parse(s).into_iter(), &Visibility::ALL, negated, |pf, v| {
                pf.visibility_in = v
            })
        }
        ("state", Value::String(s)) => {
            enum_constraint(MemoState::parse(s).into_iter(), &MemoState::ALL, negated, |pf, v| {
                pf.state_in = v
            })
        }
        (_, Value::Bool(b)) => bool_field(field, *b != negated),
        _ => MemoSqlPrefilter::unconstrained(),
    }
}

/// `field in [literals]` or `"literal" in tags`.
fn membership(elem: &Expr, list: &Expr, negated: bool) -> MemoSqlPrefilter {
    match (elem, list) {
        (Expr::Const(Value::String(tag)), Expr::Ident(range)) if range == "tags" => {
            tag_group(vec![TagMatchOption::exact(tag.clone())], negated)
        }
        (Expr::Ident(field), Expr::List(items)) => {
            let mut literals = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Expr::Const(v) => literals.push(v),
                    _ => return MemoSqlPrefilter::unconstrained(),
                }
            }
            match field.as_str() {
                "creator_id" if !negated => {
                    let ids: Vec<i64> = literals.iter().filter_map(|v| v.as_int()).collect();
                    if ids.is_empty() {
                        MemoSqlPrefilter::unsatisfiable()
                    } else {
                        MemoSqlPrefilter {
                            creator_ids: sorted(ids),
                            ..Default::default()
                        }
                    }
                }
                "visibility" => enum_constraint(
                    literals.iter().filter_map(|v| v.as_str().and_then(Visibility::parse)),
                    &Visibility::ALL,
                    negated,
                    |pf, v| pf.visibility_in = v,
                ),
                "state" => enum_constraint(
                    literals.iter().filter_map(|v| v.as_str().and_then(MemoState::parse)),
                    &MemoState::ALL,
                    negated,
                    |pf, v| pf.state_in = v,
                ),
                _ => MemoSqlPrefilter::unconstrained(),
            }
        }
        _ => MemoSqlPrefilter::unconstrained(),
    }
}

/// Constrain a closed enum to `values`, or to their complement when negated.
fn enum_constraint<T: Ord + Copy>(
    values: impl Iterator<Item = T>,
    all: &[T],
    negated: bool,
    assign: impl FnOnce(&mut MemoSqlPrefilter, Vec<T>),
) -> MemoSqlPrefilter {
    let values: BTreeSet<T> = values.collect();
    let allowed: Vec<T> = if negated {
        all.iter().copied().filter(|v| !values.contains(v)).collect()
    } else {
        values.into_iter().collect()
    };

    if allowed.is_empty() {
        return MemoSqlPrefilter::unsatisfiable();
    }
    let mut pf = MemoSqlPrefilter::unconstrained();
    if allowed.len() < all.len() {
        assign(&mut pf, allowed);
    }
    pf
}

fn tag_group(options: Vec<TagMatchOption>, negated: bool) -> MemoSqlPrefilter {
    match (options.is_empty(), negated) {
        (true, false) => MemoSqlPrefilter::unsatisfiable(),
        (true, true) => MemoSqlPrefilter::unconstrained(),
        (false, false) => MemoSqlPrefilter {
            tag_groups: vec![TagMatchGroup::new(options)],
            ..Default::default()
        },
        (false, true) => MemoSqlPrefilter {
            exclude_tag_groups: vec![TagMatchGroup::new(options)],
            ..Default::default()
        },
    }
}

/// Options of a `tags.exists(v, ...)` predicate built only from
/// `v == "x"`, `"x" == v`, `v.startsWith("x")` joined by `||`.
fn tag_options(var: &str, predicate: &Expr) -> Option<Vec<TagMatchOption>> {
    let is_var = |e: &Expr| matches!(e, Expr::Ident(name) if name == var);
    match predicate {
        Expr::Const(Value::Bool(false)) => Some(Vec::new()),
        Expr::Call {
            func: Func::Or,
            target: None,
            args,
        } => match args.as_slice() {
            [l, r] => {
                let mut options = tag_options(var, l)?;
                options.extend(tag_options(var, r)?);
                Some(options)
            }
            _ => None,
        },
        Expr::Call {
            func: Func::Eq,
            target: None,
            args,
        } => match args.as_slice() {
            [v, Expr::Const(Value::String(s))] | [Expr::Const(Value::String(s)), v] if is_var(v) => {
                Some(vec![TagMatchOption::exact(s.clone())])
            }
            _ => None,
        },
        Expr::Call {
            func: Func::StartsWith,
            target: Some(target),
            args,
        } if is_var(target) => match args.as_slice() {
            [Expr::Const(Value::String(s))] => Some(vec![TagMatchOption::prefix(s.clone())]),
            _ => None,
        },
        _ => None,
    }
}

