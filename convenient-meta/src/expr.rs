//! Deferred expressions
//!
//! A deferred expression is evaluated on demand against the scope that owns
//! the variable holding it. Two flavours exist: parsed source text in a small
//! expression language (which survives snapshots) and native closures.
//!
//! ```text
//! expr := term ('+' term)*
//! term := STRING | INT | True | False | NAME | NAME '(' args ')'
//!       | '[' args ']' | '(' expr ')'
//! ```

use crate::error::{MetaError, MetaResult};
use crate::eval::Evaluator;
use crate::value::{Kind, Value, split_fields};
use logos::Logos;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum Token {
    #[token("+")]
    Plus,
    #[token(",")]
    Comma,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("True")]
    True,
    #[token("False")]
    False,
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),
    #[regex(r#""([^"\\]|\\.)*""#, |lex| unescape(lex.slice()))]
    #[regex(r#"'([^'\\]|\\.)*'"#, |lex| unescape(lex.slice()))]
    Str(String),
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Name(String),
}

/// Strip the surrounding quotes and resolve backslash escapes.
fn unescape(quoted: &str) -> String {
    let inner = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Parsed deferred expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Str(String),
    Int(i64),
    Bool(bool),
    /// Reference to a scope variable.
    Name(String),
    List(Vec<Expr>),
    Call(String, Vec<Expr>),
    Add(Box<Expr>, Box<Expr>),
}

struct Parser<'t> {
    text: &'t str,
    tokens: Vec<(Token, Range<usize>)>,
    pos: usize,
}

impl<'t> Parser<'t> {
    fn new(text: &'t str) -> MetaResult<Self> {
        let mut lexer = Token::lexer(text);
        let mut tokens = Vec::new();
        while let Some(token) = lexer.next() {
            match token {
                Ok(token) => tokens.push((token, lexer.span())),
                Err(()) => {
                    return Err(MetaError::Syntax {
                        text: text.to_string(),
                        offset: lexer.span().start,
                        message: format!("unexpected input {:?}", lexer.slice()),
                    });
                }
            }
        }
        Ok(Self {
            text,
            tokens,
            pos: 0,
        })
    }

    fn error(&self, message: impl Into<String>) -> MetaError {
        let offset = self
            .tokens
            .get(self.pos)
            .map_or(self.text.len(), |(_, span)| span.start);
        MetaError::Syntax {
            text: self.text.to_string(),
            offset,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(token, _)| token)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(token, _)| token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> MetaResult<()> {
        match self.peek() {
            Some(token) if *token == expected => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(self.error(format!("expected {expected:?}"))),
        }
    }

    fn parse(mut self) -> MetaResult<Expr> {
        let expr = self.expr()?;
        if self.peek().is_some() {
            return Err(self.error("trailing input"));
        }
        Ok(expr)
    }

    fn expr(&mut self) -> MetaResult<Expr> {
        let mut lhs = self.term()?;
        while self.peek() == Some(&Token::Plus) {
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Add(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> MetaResult<Expr> {
        match self.bump() {
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Int(i)) => Ok(Expr::Int(i)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Name(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let args = self.args(Token::RParen)?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Name(name))
                }
            }
            Some(Token::LBracket) => Ok(Expr::List(self.args(Token::RBracket)?)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(_) => {
                self.pos -= 1;
                Err(self.error("expected a term"))
            }
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn args(&mut self, close: Token) -> MetaResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.peek() == Some(&close) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            match self.bump() {
                Some(Token::Comma) => continue,
                Some(token) if token == close => return Ok(args),
                _ => {
                    self.pos = self.pos.saturating_sub(1);
                    return Err(self.error(format!("expected ',' or {close:?}")));
                }
            }
        }
    }
}

impl Expr {
    pub fn parse(text: &str) -> MetaResult<Expr> {
        Parser::new(text)?.parse()
    }

    pub fn evaluate(&self, ev: &mut Evaluator<'_>) -> MetaResult<Value> {
        match self {
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Name(name) => ev.get(name),
            Expr::List(items) => {
                let mut list = Vec::with_capacity(items.len());
                for item in items {
                    match item.evaluate(ev)? {
                        Value::Str(s) => list.push(s),
                        other => {
                            return Err(MetaError::mismatch("list item", Kind::Str, other.kind()));
                        }
                    }
                }
                Ok(Value::List(list))
            }
            Expr::Add(lhs, rhs) => {
                let lhs = lhs.evaluate(ev)?;
                let rhs = rhs.evaluate(ev)?;
                add(lhs, rhs)
            }
            Expr::Call(function, args) => call(ev, function, args),
        }
    }
}

fn add(lhs: Value, rhs: Value) -> MetaResult<Value> {
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
        (Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(b))),
        (a, b) => Err(MetaError::mismatch("'+' operand", a.kind(), b.kind())),
    }
}

fn arity(function: &str, args: &[Expr], expected: usize) -> MetaResult<()> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(MetaError::InvalidCall {
            function: function.to_string(),
            message: format!("expected {expected} argument(s), got {}", args.len()),
        })
    }
}

fn text_of(context: &str, value: &Value) -> MetaResult<String> {
    value
        .to_text()
        .ok_or_else(|| MetaError::mismatch(context, Kind::Str, value.kind()))
}

fn call(ev: &mut Evaluator<'_>, function: &str, args: &[Expr]) -> MetaResult<Value> {
    match function {
        "str" => {
            arity(function, args, 1)?;
            let value = args[0].evaluate(ev)?;
            Ok(Value::Str(text_of("str()", &value)?))
        }
        "int" => {
            arity(function, args, 1)?;
            match args[0].evaluate(ev)? {
                Value::Int(i) => Ok(Value::Int(i)),
                Value::Bool(b) => Ok(Value::Int(i64::from(b))),
                Value::Str(s) => s.trim().parse().map(Value::Int).map_err(|_| {
                    MetaError::InvalidCall {
                        function: function.to_string(),
                        message: format!("not an integer: {s:?}"),
                    }
                }),
                other => Err(MetaError::mismatch("int()", Kind::Int, other.kind())),
            }
        }
        "len" => {
            arity(function, args, 1)?;
            let len = match args[0].evaluate(ev)? {
                Value::Str(s) => s.chars().count(),
                Value::List(l) => l.len(),
                Value::Map(m) => m.len(),
                other => return Err(MetaError::mismatch("len()", Kind::List, other.kind())),
            };
            Ok(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
        }
        "split" => {
            arity(function, args, 1)?;
            match args[0].evaluate(ev)? {
                Value::Str(s) => Ok(Value::List(split_fields(&s, " \t\n"))),
                Value::List(l) => Ok(Value::List(l)),
                other => Err(MetaError::mismatch("split()", Kind::Str, other.kind())),
            }
        }
        "join" => {
            arity(function, args, 2)?;
            let separator = args[0].evaluate(ev)?;
            let separator = separator
                .as_str()
                .ok_or_else(|| MetaError::mismatch("join() separator", Kind::Str, separator.kind()))?
                .to_string();
            match args[1].evaluate(ev)? {
                Value::List(l) => Ok(Value::Str(l.join(&separator))),
                other => Err(MetaError::mismatch("join()", Kind::List, other.kind())),
            }
        }
        "contains" => {
            // Same semantics as bb.utils.contains on a whitespace separated value
            arity(function, args, 2)?;
            let haystack = args[0].evaluate(ev)?;
            let needle = args[1].evaluate(ev)?;
            let needle = text_of("contains() item", &needle)?;
            let found = match haystack {
                Value::List(l) => l.iter().any(|item| *item == needle),
                Value::Str(s) => s.split_whitespace().any(|item| item == needle),
                Value::Map(m) => m.contains_key(&needle),
                other => return Err(MetaError::mismatch("contains()", Kind::List, other.kind())),
            };
            Ok(Value::Bool(found))
        }
        "defined" => {
            arity(function, args, 1)?;
            let name = args[0].evaluate(ev)?;
            let name = name
                .as_str()
                .ok_or_else(|| MetaError::mismatch("defined()", Kind::Str, name.kind()))?
                .to_string();
            Ok(Value::Bool(ev.lookup(&name)?.is_some()))
        }
        _ => Err(MetaError::InvalidCall {
            function: function.to_string(),
            message: "unknown function".to_string(),
        }),
    }
}

type NativeFn = dyn Fn(&mut Evaluator<'_>) -> MetaResult<Value> + Send + Sync;

/// An unevaluated expression, evaluated against a scope on every cache miss.
#[derive(Clone)]
pub enum Deferred {
    Source { text: String, expr: Arc<Expr> },
    Native(Arc<NativeFn>),
}

impl Deferred {
    /// Parse expression source. Syntax errors surface here, not at `get()`.
    pub fn parse(text: impl Into<String>) -> MetaResult<Self> {
        let text = text.into();
        let expr = Expr::parse(&text)?;
        Ok(Deferred::Source {
            text,
            expr: Arc::new(expr),
        })
    }

    pub fn native<F>(f: F) -> Self
    where
        F: Fn(&mut Evaluator<'_>) -> MetaResult<Value> + Send + Sync + 'static,
    {
        Deferred::Native(Arc::new(f))
    }

    /// Source text, if this expression has one.
    pub fn source(&self) -> Option<&str> {
        match self {
            Deferred::Source { text, .. } => Some(text),
            Deferred::Native(_) => None,
        }
    }

    pub fn evaluate(&self, ev: &mut Evaluator<'_>) -> MetaResult<Value> {
        match self {
            Deferred::Source { expr, .. } => expr.evaluate(ev),
            Deferred::Native(f) => f(ev),
        }
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deferred::Source { text, .. } => f.debug_tuple("Deferred").field(text).finish(),
            Deferred::Native(_) => f.write_str("Deferred(<native>)"),
        }
    }
}
