//! Expression tree of compiled memo filters.

use std::fmt;

/// Runtime value of a filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    String(String),
    List(Vec<Value>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Built-in operators and functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Or,
    And,
    Not,
    Neg,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Contains,
    StartsWith,
    EndsWith,
    Size,
    Now,
}

impl Func {
    pub fn name(&self) -> &'static str {
        match self {
            Func::Or => "||",
            Func::And => "&&",
            Func::Not => "!",
            Func::Neg => "-",
            Func::Eq => "==",
            Func::Ne => "!=",
            Func::Lt => "<",
            Func::Le => "<=",
            Func::Gt => ">",
            Func::Ge => ">=",
            Func::In => "in",
            Func::Add => "+",
            Func::Sub => "-",
            Func::Mul => "*",
            Func::Div => "/",
            Func::Mod => "%",
            Func::Contains => "contains",
            Func::StartsWith => "startsWith",
            Func::EndsWith => "endsWith",
            Func::Size => "size",
            Func::Now => "now",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComprehensionKind {
    Exists,
    All,
}

/// Closed expression tree; every pass over it is an exhaustive match.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(Value),
    Ident(String),
    List(Vec<Expr>),
    /// Operator or function application. `target` is the receiver of a
    /// method-style call (`content.contains("x")`).
    Call {
        func: Func,
        target: Option<Box<Expr>>,
        args: Vec<Expr>,
    },
    Comprehension {
        kind: ComprehensionKind,
        var: String,
        range: Box<Expr>,
        predicate: Box<Expr>,
    },
}

impl Expr {
    pub fn call(func: Func, args: Vec<Expr>) -> Self {
        Expr::Call {
            func,
            target: None,
            args,
        }
    }

    pub fn method(func: Func, target: Expr, args: Vec<Expr>) -> Self {
        Expr::Call {
            func,
            target: Some(Box::new(target)),
            args,
        }
    }

    pub fn string(s: impl Into<String>) -> Self {
        Expr::Const(Value::String(s.into()))
    }

    pub fn ident(name: impl Into<String>) -> Self {
        Expr::Ident(name.into())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", s),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(v) => write!(f, "{}", v),
            Expr::Ident(name) => f.write_str(name),
            Expr::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Expr::Call { func, target, args } => match (func, target, args.as_slice()) {
                (_, Some(target), args) => {
                    write!(f, "{}.{}(", target, func.name())?;
                    for (i, arg) in args.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{}", arg)?;
                    }
                    f.write_str(")")
                }
                (Func::Not, None, [x]) => write!(f, "!({})", x),
                (Func::Neg, None, [x]) => write!(f, "-({})", x),
                (Func::Size | Func::Now, None, args) => {
                    write!(f, "{}(", func.name())?;
                    for (i, arg) in args.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{}", arg)?;
                    }
                    f.write_str(")")
                }
                (_, None, [l, r]) => write!(f, "({} {} {})", l, func.name(), r),
                (_, None, _) => write!(f, "{}(..)", func.name()),
            },
            Expr::Comprehension {
                kind,
                var,
                range,
                predicate,
            } => {
                let name = match kind {
                    ComprehensionKind::Exists => "exists",
                    ComprehensionKind::All => "all",
                };
                write!(f, "{}.{}({}, {})", range, name, var, predicate)
            }
        }
    }
}
