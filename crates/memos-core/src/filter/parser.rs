//! Lexer and recursive-descent parser for the CEL subset accepted in memo
//! filters.
//!
//! Precedence, loosest first: `||`, `&&`, relations (`== != < <= > >= in`),
//! additive, multiplicative, unary (`! -`), member access and calls.

use crate::error::{Error, Result};

use super::ast::{ComprehensionKind, Expr, Func, Value};

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Bang,
    AndAnd,
    OrOr,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eof,
}

fn syntax_error(pos: usize, msg: impl std::fmt::Display) -> Error {
    Error::InvalidFilter(format!("{} at offset {}", msg, pos))
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let two = chars.get(i + 1).map(|(_, c)| *c);
        let simple = match (c, two) {
            ('&', Some('&')) => Some((Token::AndAnd, 2)),
            ('|', Some('|')) => Some((Token::OrOr, 2)),
            ('=', Some('=')) => Some((Token::EqEq, 2)),
            ('!', Some('=')) => Some((Token::NotEq, 2)),
            ('<', Some('=')) => Some((Token::Le, 2)),
            ('>', Some('=')) => Some((Token::Ge, 2)),
            ('<', _) => Some((Token::Lt, 1)),
            ('>', _) => Some((Token::Gt, 1)),
            ('!', _) => Some((Token::Bang, 1)),
            ('(', _) => Some((Token::LParen, 1)),
            (')', _) => Some((Token::RParen, 1)),
            ('[', _) => Some((Token::LBracket, 1)),
            (']', _) => Some((Token::RBracket, 1)),
            (',', _) => Some((Token::Comma, 1)),
            ('.', _) => Some((Token::Dot, 1)),
            ('+', _) => Some((Token::Plus, 1)),
            ('-', _) => Some((Token::Minus, 1)),
            ('*', _) => Some((Token::Star, 1)),
            ('/', _) => Some((Token::Slash, 1)),
            ('%', _) => Some((Token::Percent, 1)),
            _ => None,
        };
        if let Some((token, width)) = simple {
            tokens.push((token, pos));
            i += width;
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            loop {
                let Some(&(_, ch)) = chars.get(i) else {
                    return Err(syntax_error(pos, "unterminated string literal"));
                };
                i += 1;
                if ch == quote {
                    break;
                }
                if ch == '\\' {
                    let Some(&(_, esc)) = chars.get(i) else {
                        return Err(syntax_error(pos, "unterminated string literal"));
                    };
                    i += 1;
                    value.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '\\' => '\\',
                        '"' => '"',
                        '\'' => '\'',
                        other => {
                            return Err(syntax_error(pos, format!("invalid escape '\\{}'", other)))
                        }
                    });
                    continue;
                }
                value.push(ch);
            }
            tokens.push((Token::Str(value), pos));
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].1.is_ascii_digit() {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
            let value = text
                .parse::<i64>()
                .map_err(|_| syntax_error(pos, format!("integer literal out of range: {}", text)))?;
            tokens.push((Token::Int(value), pos));
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_') {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
            tokens.push((Token::Ident(text), pos));
            continue;
        }

        return Err(syntax_error(pos, format!("unexpected character '{}'", c)));
    }

    tokens.push((Token::Eof, input.len()));
    Ok(tokens)
}

/// Normalise `property.<camelCase>` selections to the flat declared names.
fn property_field(name: &str) -> Option<&'static str> {
    match name {
        "hasLink" => Some("has_link"),
        "hasTaskList" => Some("has_task_list"),
        "hasCode" => Some("has_code"),
        "hasIncompleteTasks" => Some("has_incomplete_tasks"),
        _ => None,
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos].0
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos].1
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].0.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(syntax_error(
                self.offset(),
                format!("expected {}, found {:?}", what, self.peek()),
            ))
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(syntax_error(self.offset(), "expression nested too deeply"));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr> {
        self.enter()?;
        let mut lhs = self.parse_and()?;
        while *self.peek() == Token::OrOr {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::call(Func::Or, vec![lhs, rhs]);
        }
        self.depth -= 1;
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_relation()?;
        while *self.peek() == Token::AndAnd {
            self.advance();
            let rhs = self.parse_relation()?;
            lhs = Expr::call(Func::And, vec![lhs, rhs]);
        }
        Ok(lhs)
    }

    fn parse_relation(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            let func = match self.peek() {
                Token::EqEq => Func::Eq,
                Token::NotEq => Func::Ne,
                Token::Lt => Func::Lt,
                Token::Le => Func::Le,
                Token::Gt => Func::Gt,
                Token::Ge => Func::Ge,
                Token::Ident(name) if name == "in" => Func::In,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = Expr::call(func, vec![lhs, rhs]);
        }
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let func = match self.peek() {
                Token::Plus => Func::Add,
                Token::Minus => Func::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::call(func, vec![lhs, rhs]);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let func = match self.peek() {
                Token::Star => Func::Mul,
                Token::Slash => Func::Div,
                Token::Percent => Func::Mod,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::call(func, vec![lhs, rhs]);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Token::Bang => {
                self.advance();
                self.enter()?;
                let operand = self.parse_unary()?;
                self.depth -= 1;
                Ok(Expr::call(Func::Not, vec![operand]))
            }
            Token::Minus => {
                self.advance();
                if let Token::Int(n) = *self.peek() {
                    self.advance();
                    let primary = Expr::Const(Value::Int(-n));
                    return self.parse_member_tail(primary);
                }
                self.enter()?;
                let operand = self.parse_unary()?;
                self.depth -= 1;
                Ok(Expr::call(Func::Neg, vec![operand]))
            }
            _ => self.parse_member(),
        }
    }

    fn parse_member(&mut self) -> Result<Expr> {
        let primary = self.parse_primary()?;
        self.parse_member_tail(primary)
    }

    fn parse_member_tail(&mut self, mut expr: Expr) -> Result<Expr> {
        while *self.peek() == Token::Dot {
            self.advance();
            let at = self.offset();
            let name = match self.advance() {
                Token::Ident(name) => name,
                other => return Err(syntax_error(at, format!("expected field name, found {:?}", other))),
            };

            if *self.peek() != Token::LParen {
                expr = match (&expr, property_field(&name)) {
                    (Expr::Ident(base), Some(field)) if base == "property" => Expr::ident(field),
                    _ => {
                        return Err(syntax_error(
                            at,
                            format!("unknown field selection '{}.{}'", expr, name),
                        ))
                    }
                };
                continue;
            }

            self.advance();
            let args = self.parse_args()?;
            expr = match name.as_str() {
                "contains" => Expr::method(Func::Contains, expr, args),
                "startsWith" => Expr::method(Func::StartsWith, expr, args),
                "endsWith" => Expr::method(Func::EndsWith, expr, args),
                "size" => Expr::method(Func::Size, expr, args),
                "exists" | "all" => {
                    let kind = if name == "exists" {
                        ComprehensionKind::Exists
                    } else {
                        ComprehensionKind::All
                    };
                    let mut args = args.into_iter();
                    let (Some(Expr::Ident(var)), Some(predicate), None) =
                        (args.next(), args.next(), args.next())
                    else {
                        return Err(syntax_error(
                            at,
                            format!("{}() expects an identifier and a predicate", name),
                        ));
                    };
                    Expr::Comprehension {
                        kind,
                        var,
                        range: Box::new(expr),
                        predicate: Box::new(predicate),
                    }
                }
                other => return Err(syntax_error(at, format!("undeclared function '{}'", other))),
            };
        }
        Ok(expr)
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if *self.peek() == Token::RParen {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            match self.advance() {
                Token::Comma => continue,
                Token::RParen => return Ok(args),
                other => {
                    return Err(syntax_error(
                        self.offset(),
                        format!("expected ',' or ')', found {:?}", other),
                    ))
                }
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let at = self.offset();
        match self.advance() {
            Token::Int(n) => Ok(Expr::Const(Value::Int(n))),
            Token::Str(s) => Ok(Expr::Const(Value::String(s))),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if *self.peek() == Token::RBracket {
                    self.advance();
                    return Ok(Expr::List(items));
                }
                loop {
                    items.push(self.parse_or()?);
                    match self.advance() {
                        Token::Comma => {
                            if *self.peek() == Token::RBracket {
                                self.advance();
                                return Ok(Expr::List(items));
                            }
                        }
                        Token::RBracket => return Ok(Expr::List(items)),
                        other => {
                            return Err(syntax_error(
                                at,
                                format!("expected ',' or ']' in list, found {:?}", other),
                            ))
                        }
                    }
                }
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Const(Value::Bool(true))),
                "false" => Ok(Expr::Const(Value::Bool(false))),
                "in" => Err(syntax_error(at, "unexpected keyword 'in'")),
                _ if *self.peek() == Token::LParen => {
                    self.advance();
                    let args = self.parse_args()?;
                    match name.as_str() {
                        "size" => Ok(Expr::call(Func::Size, args)),
                        "now" => Ok(Expr::call(Func::Now, args)),
                        other => Err(syntax_error(at, format!("undeclared function '{}'", other))),
                    }
                }
                _ => Ok(Expr::Ident(name)),
            },
            Token::Eof => Err(syntax_error(at, "unexpected end of expression")),
            other => Err(syntax_error(at, format!("unexpected token {:?}", other))),
        }
    }
}

/// Parse a filter expression into its syntax tree.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_or()?;
    if *parser.peek() != Token::Eof {
        return Err(syntax_error(
            parser.offset(),
            format!("unexpected trailing token {:?}", parser.peek()),
        ));
    }
    Ok(expr)
}
