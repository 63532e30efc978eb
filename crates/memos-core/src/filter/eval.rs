//! In-process evaluation of checked filter expressions against a memo.

use crate::models::Memo;

use super::ast::{ComprehensionKind, Expr, Func, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EvalError {
    Overflow,
    DivisionByZero,
    NoSuchOverload(&'static str),
    Unbound(String),
}

type EvalResult = std::result::Result<Value, EvalError>;

/// Variable bindings for one evaluation.
pub(crate) struct Activation<'a> {
    memo: &'a Memo,
    now: i64,
    locals: Vec<(String, Value)>,
}

impl<'a> Activation<'a> {
    pub(crate) fn new(memo: &'a Memo, now: i64) -> Self {
        Self {
            memo,
            now,
            locals: Vec::new(),
        }
    }

    fn resolve(&self, name: &str) -> EvalResult {
        if let Some((_, v)) = self.locals.iter().rev().find(|(n, _)| n == name) {
            return Ok(v.clone());
        }
        let memo = self.memo;
        Ok(match name {
            "creator_id" => Value::Int(memo.creator_id),
            "visibility" => Value::String(memo.visibility.as_str().to_string()),
            "state" => Value::String(memo.state.as_str().to_string()),
            "pinned" => Value::Bool(memo.pinned),
            "has_link" => Value::Bool(memo.property.has_link),
            "has_task_list" => Value::Bool(memo.property.has_task_list),
            "has_code" => Value::Bool(memo.property.has_code),
            "has_incomplete_tasks" => Value::Bool(memo.property.has_incomplete_tasks),
            "content" => Value::String(memo.content.clone()),
            "tags" => Value::List(memo.tags.iter().cloned().map(Value::String).collect()),
            "created_ts" => Value::Int(memo.create_time.timestamp()),
            "updated_ts" => Value::Int(memo.update_time.timestamp()),
            other => return Err(EvalError::Unbound(other.to_string())),
        })
    }
}

fn as_bool(r: &EvalResult) -> Option<bool> {
    r.as_ref().ok().and_then(Value::as_bool)
}

fn int_pair(l: Value, r: Value, op: &'static str) -> std::result::Result<(i64, i64), EvalError> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Ok((a, b)),
        _ => Err(EvalError::NoSuchOverload(op)),
    }
}

pub(crate) fn eval(expr: &Expr, act: &mut Activation<'_>) -> EvalResult {
    match expr {
        Expr::Const(v) => Ok(v.clone()),
        Expr::Ident(name) => act.resolve(name),
        Expr::List(items) => Ok(Value::List(
            items
                .iter()
                .map(|item| eval(item, act))
                .collect::<std::result::Result<_, _>>()?,
        )),
        Expr::Call { func, target, args } => eval_call(*func, target.as_deref(), args, act),
        Expr::Comprehension {
            kind,
            var,
            range,
            predicate,
        } => {
            let Value::List(items) = eval(range, act)? else {
                return Err(EvalError::NoSuchOverload("comprehension"));
            };
            // exists: any true wins; all: any false wins. Errors surface only
            // when no element decides the result.
            let decisive = matches!(kind, ComprehensionKind::Exists);
            let mut error = None;
            for item in items {
                act.locals.push((var.clone(), item));
                let result = eval(predicate, act);
                act.locals.pop();
                match result {
                    Ok(Value::Bool(b)) if b == decisive => return Ok(Value::Bool(decisive)),
                    Ok(Value::Bool(_)) => {}
                    Ok(_) => error = Some(EvalError::NoSuchOverload("comprehension")),
                    Err(e) => error = Some(e),
                }
            }
            match error {
                Some(e) => Err(e),
                None => Ok(Value::Bool(!decisive)),
            }
        }
    }
}

fn eval_call(
    func: Func,
    target: Option<&Expr>,
    args: &[Expr],
    act: &mut Activation<'_>,
) -> EvalResult {
    match (func, args) {
        (Func::And, [l, r]) => {
            let lhs = eval(l, act);
            if as_bool(&lhs) == Some(false) {
                return Ok(Value::Bool(false));
            }
            let rhs = eval(r, act);
            return match (as_bool(&lhs), as_bool(&rhs)) {
                (_, Some(false)) => Ok(Value::Bool(false)),
                (Some(true), Some(true)) => Ok(Value::Bool(true)),
                _ => Err(lhs.and(rhs).err().unwrap_or(EvalError::NoSuchOverload("&&"))),
            };
        }
        (Func::Or, [l, r]) => {
            let lhs = eval(l, act);
            if as_bool(&lhs) == Some(true) {
                return Ok(Value::Bool(true));
            }
            let rhs = eval(r, act);
            return match (as_bool(&lhs), as_bool(&rhs)) {
                (_, Some(true)) => Ok(Value::Bool(true)),
                (Some(false), Some(false)) => Ok(Value::Bool(false)),
                _ => Err(lhs.and(rhs).err().unwrap_or(EvalError::NoSuchOverload("||"))),
            };
        }
        _ => {}
    }

    let receiver = match target {
        Some(t) => Some(eval(t, act)?),
        None => None,
    };
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        values.push(eval(arg, act)?);
    }

    match (func, receiver, values.as_slice()) {
        (Func::Not, None, [Value::Bool(b)]) => Ok(Value::Bool(!b)),
        (Func::Neg, None, [Value::Int(n)]) => {
            n.checked_neg().map(Value::Int).ok_or(EvalError::Overflow)
        }
        (Func::Eq, None, [l, r]) => Ok(Value::Bool(l == r)),
        (Func::Ne, None, [l, r]) => Ok(Value::Bool(l != r)),
        (Func::Lt | Func::Le | Func::Gt | Func::Ge, None, [l, r]) => {
            let ordering = match (l, r) {
                (Value::Int(a), Value::Int(b)) => a.cmp(b),
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => return Err(EvalError::NoSuchOverload(func.name())),
            };
            Ok(Value::Bool(match func {
                Func::Lt => ordering.is_lt(),
                Func::Le => ordering.is_le(),
                Func::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        (Func::In, None, [elem, Value::List(items)]) => Ok(Value::Bool(items.contains(elem))),
        (Func::Add, None, [Value::String(a), Value::String(b)]) => {
            Ok(Value::String(format!("{}{}", a, b)))
        }
        (Func::Add, None, [Value::List(a), Value::List(b)]) => {
            Ok(Value::List(a.iter().chain(b.iter()).cloned().collect()))
        }
        (Func::Add | Func::Sub | Func::Mul | Func::Div | Func::Mod, None, [l, r]) => {
            let (a, b) = int_pair(l.clone(), r.clone(), func.name())?;
            let result = match func {
                Func::Add => a.checked_add(b),
                Func::Sub => a.checked_sub(b),
                Func::Mul => a.checked_mul(b),
                Func::Div | Func::Mod if b == 0 => return Err(EvalError::DivisionByZero),
                Func::Div => a.checked_div(b),
                _ => a.checked_rem(b),
            };
            result.map(Value::Int).ok_or(EvalError::Overflow)
        }
        (Func::Contains, Some(Value::String(s)), [Value::String(x)]) => {
            Ok(Value::Bool(s.contains(x.as_str())))
        }
        (Func::StartsWith, Some(Value::String(s)), [Value::String(x)]) => {
            Ok(Value::Bool(s.starts_with(x.as_str())))
        }
        (Func::EndsWith, Some(Value::String(s)), [Value::String(x)]) => {
            Ok(Value::Bool(s.ends_with(x.as_str())))
        }
        (Func::Size, Some(x), []) => size_of(&x),
        (Func::Size, None, [x]) => size_of(x),
        (Func::Now, None, []) => Ok(Value::Int(act.now)),
        _ => Err(EvalError::NoSuchOverload(func.name())),
    }
}

fn size_of(value: &Value) -> EvalResult {
    match value {
        Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
        Value::List(items) => Ok(Value::Int(items.len() as i64)),
        _ => Err(EvalError::NoSuchOverload("size")),
    }
}
