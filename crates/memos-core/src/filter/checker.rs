//! Legacy rewrite and static type checking of filter expressions.

use std::fmt;

use crate::error::{Error, Result};

use super::ast::{ComprehensionKind, Expr, Func, Value};

/// Identifier accepted only on the left of the legacy `tag in [...]` form.
const LEGACY_TAG_IDENT: &str = "tag";
const LEGACY_TAG_VAR: &str = "__tag";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Bool,
    Int,
    String,
    List(Box<Type>),
    /// Element type of an empty list literal.
    Any,
}

impl Type {
    fn list_of(elem: Type) -> Self {
        Type::List(Box::new(elem))
    }

    fn compatible(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Any, _) | (_, Type::Any) => true,
            (Type::List(a), Type::List(b)) => a.compatible(b),
            (a, b) => a == b,
        }
    }

    fn is(&self, want: &Type) -> bool {
        matches!(self, Type::Any) || self == want
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => f.write_str("bool"),
            Type::Int => f.write_str("int"),
            Type::String => f.write_str("string"),
            Type::List(elem) => write!(f, "list({})", elem),
            Type::Any => f.write_str("dyn"),
        }
    }
}

/// Type of a declared memo variable.
pub fn declared_type(name: &str) -> Option<Type> {
    match name {
        "creator_id" | "created_ts" | "updated_ts" => Some(Type::Int),
        "visibility" | "state" | "content" => Some(Type::String),
        "pinned" | "has_link" | "has_task_list" | "has_code" | "has_incomplete_tasks" => {
            Some(Type::Bool)
        }
        "tags" => Some(Type::list_of(Type::String)),
        _ => None,
    }
}

/// Rewrite `tag in ["a", "b"]` into a hierarchical `tags.exists(...)` test.
///
/// `"a"` matches the tag `a` itself or any descendant `a/...`.
pub fn rewrite_legacy(expr: Expr) -> Result<Expr> {
    match expr {
        Expr::Call {
            func: Func::In,
            target: None,
            args,
        } if matches!(args.first(), Some(Expr::Ident(name)) if name == LEGACY_TAG_IDENT) => {
            let Some(list) = args.into_iter().nth(1) else {
                return Err(Error::InvalidFilter("malformed tag membership".into()));
            };
            let Expr::List(items) = list else {
                return Err(Error::InvalidFilter(
                    "tag in [...] requires a literal list of strings".into(),
                ));
            };

            let mut predicate: Option<Expr> = None;
            for item in items {
                let Expr::Const(Value::String(tag)) = item else {
                    return Err(Error::InvalidFilter(
                        "tag in [...] requires a literal list of strings".into(),
                    ));
                };
                let var = Expr::ident(LEGACY_TAG_VAR);
                let option = Expr::call(
                    Func::Or,
                    vec![
                        Expr::call(Func::Eq, vec![var.clone(), Expr::string(tag.clone())]),
                        Expr::method(Func::StartsWith, var, vec![Expr::string(format!("{}/", tag))]),
                    ],
                );
                predicate = Some(match predicate {
                    None => option,
                    Some(prev) => Expr::call(Func::Or, vec![prev, option]),
                });
            }

            Ok(match predicate {
                None => Expr::Const(Value::Bool(false)),
                Some(predicate) => Expr::Comprehension {
                    kind: ComprehensionKind::Exists,
                    var: LEGACY_TAG_VAR.to_string(),
                    range: Box::new(Expr::ident("tags")),
                    predicate: Box::new(predicate),
                },
            })
        }
        Expr::Call { func, target, args } => Ok(Expr::Call {
            func,
            target: match target {
                Some(t) => Some(Box::new(rewrite_legacy(*t)?)),
                None => None,
            },
            args: args.into_iter().map(rewrite_legacy).collect::<Result<_>>()?,
        }),
        Expr::List(items) => Ok(Expr::List(
            items.into_iter().map(rewrite_legacy).collect::<Result<_>>()?,
        )),
        Expr::Comprehension {
            kind,
            var,
            range,
            predicate,
        } => Ok(Expr::Comprehension {
            kind,
            var,
            range: Box::new(rewrite_legacy(*range)?),
            predicate: Box::new(rewrite_legacy(*predicate)?),
        }),
        leaf @ (Expr::Const(_) | Expr::Ident(_)) => Ok(leaf),
    }
}

fn type_error(msg: impl Into<String>) -> Error {
    Error::InvalidFilter(msg.into())
}

struct Checker {
    scope: Vec<(String, Type)>,
}

impl Checker {
    fn lookup(&self, name: &str) -> Option<Type> {
        self.scope
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.clone())
            .or_else(|| declared_type(name))
    }

    fn value_type(value: &Value) -> Type {
        match value {
            Value::Bool(_) => Type::Bool,
            Value::Int(_) => Type::Int,
            Value::String(_) => Type::String,
            Value::List(items) => {
                Type::list_of(items.first().map(Self::value_type).unwrap_or(Type::Any))
            }
        }
    }

    fn check(&mut self, expr: &Expr) -> Result<Type> {
        match expr {
            Expr::Const(v) => Ok(Self::value_type(v)),
            Expr::Ident(name) => self
                .lookup(name)
                .ok_or_else(|| type_error(format!("undeclared reference to '{}'", name))),
            Expr::List(items) => {
                let mut elem = Type::Any;
                for item in items {
                    let t = self.check(item)?;
                    if elem == Type::Any {
                        elem = t;
                    } else if !elem.compatible(&t) {
                        return Err(type_error(format!(
                            "list literal mixes {} and {}",
                            elem, t
                        )));
                    }
                }
                Ok(Type::list_of(elem))
            }
            Expr::Call { func, target, args } => self.check_call(*func, target.as_deref(), args),
            Expr::Comprehension {
                kind,
                var,
                range,
                predicate,
            } => {
                let elem = match self.check(range)? {
                    Type::List(elem) => *elem,
                    Type::Any => Type::Any,
                    other => {
                        return Err(type_error(format!(
                            "{} requires a list receiver, found {}",
                            match kind {
                                ComprehensionKind::Exists => "exists",
                                ComprehensionKind::All => "all",
                            },
                            other
                        )))
                    }
                };
                self.scope.push((var.clone(), elem));
                let predicate_type = self.check(predicate);
                self.scope.pop();
                if !predicate_type?.is(&Type::Bool) {
                    return Err(type_error("comprehension predicate must be bool"));
                }
                Ok(Type::Bool)
            }
        }
    }

    fn check_call(&mut self, func: Func, target: Option<&Expr>, args: &[Expr]) -> Result<Type> {
        let receiver = match target {
            Some(t) => Some(self.check(t)?),
            None => None,
        };
        let arg_types = args
            .iter()
            .map(|a| self.check(a))
            .collect::<Result<Vec<_>>>()?;
        let mismatch = || {
            let shown: Vec<String> = arg_types.iter().map(|t| t.to_string()).collect();
            match &receiver {
                Some(r) => type_error(format!(
                    "no matching overload for {}.{}({})",
                    r,
                    func.name(),
                    shown.join(", ")
                )),
                None => type_error(format!(
                    "no matching overload for '{}' applied to ({})",
                    func.name(),
                    shown.join(", ")
                )),
            }
        };

        match (func, receiver.as_ref(), arg_types.as_slice()) {
            (Func::Or | Func::And, None, [l, r]) if l.is(&Type::Bool) && r.is(&Type::Bool) => {
                Ok(Type::Bool)
            }
            (Func::Not, None, [x]) if x.is(&Type::Bool) => Ok(Type::Bool),
            (Func::Neg, None, [x]) if x.is(&Type::Int) => Ok(Type::Int),
            (Func::Eq | Func::Ne, None, [l, r]) if l.compatible(r) => Ok(Type::Bool),
            (Func::Lt | Func::Le | Func::Gt | Func::Ge, None, [l, r])
                if l.compatible(r) && (l.is(&Type::Int) || l.is(&Type::String)) =>
            {
                Ok(Type::Bool)
            }
            (Func::In, None, [elem, Type::List(inner)]) if elem.compatible(inner) => {
                Ok(Type::Bool)
            }
            (Func::Add, None, [l, r]) if l.compatible(r) && !matches!(l, Type::Bool) => {
                Ok(if *l == Type::Any { r.clone() } else { l.clone() })
            }
            (Func::Sub | Func::Mul | Func::Div | Func::Mod, None, [l, r])
                if l.is(&Type::Int) && r.is(&Type::Int) =>
            {
                Ok(Type::Int)
            }
            (Func::Contains | Func::StartsWith | Func::EndsWith, Some(s), [arg])
                if s.is(&Type::String) && arg.is(&Type::String) =>
            {
                Ok(Type::Bool)
            }
            (Func::Size, Some(x), []) | (Func::Size, None, [x])
                if matches!(x, Type::String | Type::List(_) | Type::Any) =>
            {
                Ok(Type::Int)
            }
            (Func::Now, None, []) => Ok(Type::Int),
            _ => Err(mismatch()),
        }
    }
}

/// Type-check a rewritten expression; the result must be a boolean.
pub fn check(expr: &Expr) -> Result<()> {
    let mut checker = Checker { scope: Vec::new() };
    match checker.check(expr)? {
        Type::Bool => Ok(()),
        other => Err(type_error(format!(
            "filter must evaluate to bool, found {}",
            other
        ))),
    }
}
