//! Built-in expression evaluator
//!
//! Covers the subset of CEL the engine's own selectors and verification
//! conditions use: member access, `==`/`!=`/`<`/`<=`/`>`/`>=`,
//! `&&`/`||`/`!`, parentheses, and the `startsWith`/`endsWith`/
//! `contains` string methods. Parsed expressions are cached by hash.

use crate::error::ExpressionError;
use crate::expr::{ExpressionContext, ExpressionEvaluator};
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Default [`ExpressionEvaluator`]. Pure and deterministic; safe to
/// share across workspaces.
#[derive(Default)]
pub struct BasicEvaluator {
    cache: DashMap<String, Arc<Expr>>,
}

impl BasicEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn compile(&self, expression: &str) -> Result<Arc<Expr>, ExpressionError> {
        let key = hash_expression(expression);
        if let Some(compiled) = self.cache.get(&key) {
            return Ok(compiled.clone());
        }
        let compiled = Arc::new(Parser::new(expression).parse()?);
        self.cache.insert(key, compiled.clone());
        Ok(compiled)
    }
}

impl ExpressionEvaluator for BasicEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        context: &ExpressionContext,
    ) -> Result<Value, ExpressionError> {
        let compiled = self.compile(expression)?;
        eval(&compiled, context)
    }
}

fn hash_expression(expression: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(expression.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug)]
enum Expr {
    Literal(Value),
    Root(String),
    Member(Box<Expr>, String),
    Call(Box<Expr>, String, Vec<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    Dot,
    LParen,
    RParen,
    Comma,
    Bang,
    AndAnd,
    OrOr,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> Self {
        Self {
            tokens: tokenize(input),
            pos: 0,
        }
    }

    fn parse(mut self) -> Result<Expr, ExpressionError> {
        let expr = self.parse_or()?;
        if self.pos < self.tokens.len() {
            return Err(self.error("trailing input"));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: &str) -> ExpressionError {
        let offset = self
            .tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(o, _)| *o)
            .unwrap_or(0);
        ExpressionError::Parse {
            offset,
            message: message.to_string(),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinOp::Eq,
            Some(Token::NotEq) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_unary()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&Token::Bang) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.parse_primary()?;
        while self.peek() == Some(&Token::Dot) {
            self.advance();
            let name = match self.advance() {
                Some(Token::Ident(name)) => name,
                _ => return Err(self.error("expected member name after `.`")),
            };
            if self.peek() == Some(&Token::LParen) {
                self.advance();
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.parse_or()?);
                        match self.peek() {
                            Some(Token::Comma) => {
                                self.advance();
                            }
                            _ => break,
                        }
                    }
                }
                match self.advance() {
                    Some(Token::RParen) => {}
                    _ => return Err(self.error("expected `)` after arguments")),
                }
                expr = Expr::Call(Box::new(expr), name, args);
            } else {
                expr = Expr::Member(Box::new(expr), name);
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance() {
            Some(Token::Ident(name)) => Ok(Expr::Root(name)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("expected `)`")),
                }
            }
            _ => Err(self.error("expected expression")),
        }
    }
}

fn tokenize(input: &str) -> Vec<(usize, Token)> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '.' => {
                tokens.push((i, Token::Dot));
                i += 1;
            }
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            ',' => {
                tokens.push((i, Token::Comma));
                i += 1;
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((i, Token::NotEq));
                    i += 2;
                } else {
                    tokens.push((i, Token::Bang));
                    i += 1;
                }
            }
            '&' if bytes.get(i + 1) == Some(&b'&') => {
                tokens.push((i, Token::AndAnd));
                i += 2;
            }
            '|' if bytes.get(i + 1) == Some(&b'|') => {
                tokens.push((i, Token::OrOr));
                i += 2;
            }
            '=' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push((i, Token::EqEq));
                i += 2;
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((i, Token::Le));
                    i += 2;
                } else {
                    tokens.push((i, Token::Lt));
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((i, Token::Ge));
                    i += 2;
                } else {
                    tokens.push((i, Token::Gt));
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut s = String::new();
                while i < bytes.len() && bytes[i] as char != quote {
                    s.push(bytes[i] as char);
                    i += 1;
                }
                i += 1; // closing quote
                tokens.push((start, Token::Str(s)));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.')
                {
                    i += 1;
                }
                let num: f64 = input[start..i].parse().unwrap_or(f64::NAN);
                tokens.push((start, Token::Num(num)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                let word = &input[start..i];
                let token = match word {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push((start, token));
            }
            _ => i += 1, // unknown byte: skip; the parser reports the gap
        }
    }
    tokens
}

fn eval(expr: &Expr, context: &ExpressionContext) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Root(name) => context
            .root(name)
            .cloned()
            .ok_or_else(|| ExpressionError::UnknownRoot(name.clone())),
        Expr::Member(target, name) => {
            let target = eval(target, context)?;
            Ok(target.get(name).cloned().unwrap_or(Value::Null))
        }
        Expr::Call(target, name, args) => {
            let target = eval(target, context)?;
            let args = args
                .iter()
                .map(|a| eval(a, context))
                .collect::<Result<Vec<_>, _>>()?;
            call_method(&target, name, &args)
        }
        Expr::Not(inner) => match eval(inner, context)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(ExpressionError::Type(format!(
                "cannot negate {}",
                type_name(&other)
            ))),
        },
        Expr::Binary(op, left, right) => eval_binary(*op, left, right, context),
    }
}

fn eval_binary(
    op: BinOp,
    left: &Expr,
    right: &Expr,
    context: &ExpressionContext,
) -> Result<Value, ExpressionError> {
    match op {
        // Short-circuiting boolean operators
        BinOp::And => {
            let left = as_bool(eval(left, context)?)?;
            if !left {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool(eval(right, context)?)?))
        }
        BinOp::Or => {
            let left = as_bool(eval(left, context)?)?;
            if left {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool(eval(right, context)?)?))
        }
        BinOp::Eq => Ok(Value::Bool(values_equal(
            &eval(left, context)?,
            &eval(right, context)?,
        ))),
        BinOp::Ne => Ok(Value::Bool(!values_equal(
            &eval(left, context)?,
            &eval(right, context)?,
        ))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let left = eval(left, context)?;
            let right = eval(right, context)?;
            let ordering = compare(&left, &right)?;
            let result = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
    }
}

fn call_method(target: &Value, name: &str, args: &[Value]) -> Result<Value, ExpressionError> {
    let subject = match target {
        Value::String(s) => s.as_str(),
        Value::Null => return Ok(Value::Bool(false)),
        other => {
            return Err(ExpressionError::Type(format!(
                "cannot call `{}` on {}",
                name,
                type_name(other)
            )))
        }
    };
    let arg = match args {
        [Value::String(s)] => s.as_str(),
        _ => {
            return Err(ExpressionError::Type(format!(
                "`{name}` expects one string argument"
            )))
        }
    };
    match name {
        "startsWith" => Ok(Value::Bool(subject.starts_with(arg))),
        "endsWith" => Ok(Value::Bool(subject.ends_with(arg))),
        "contains" => Ok(Value::Bool(subject.contains(arg))),
        _ => Err(ExpressionError::UnknownFunction(name.to_string())),
    }
}

fn as_bool(value: Value) -> Result<bool, ExpressionError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(ExpressionError::Type(format!(
            "expected boolean, got {}",
            type_name(&other)
        ))),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, ExpressionError> {
    match (left, right) {
        (Value::String(l), Value::String(r)) => Ok(l.cmp(r)),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(l), Some(r)) => l
                .partial_cmp(&r)
                .ok_or_else(|| ExpressionError::Type("NaN comparison".to_string())),
            _ => Err(ExpressionError::Type(format!(
                "cannot order {} and {}",
                type_name(left),
                type_name(right)
            ))),
        },
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExpressionContext {
        ExpressionContext::new().with_root(
            "resource",
            json!({
                "id": "res-1",
                "name": "prod-cluster",
                "kind": "Kubernetes",
                "metadata": {"region": "us-east-1", "tier": "1"}
            }),
        )
    }

    fn eval_bool(expr: &str) -> bool {
        BasicEvaluator::new().evaluate_bool(expr, &ctx()).unwrap()
    }

    #[test]
    fn test_member_equality() {
        assert!(eval_bool("resource.kind == 'Kubernetes'"));
        assert!(!eval_bool("resource.kind == 'Terraform'"));
        assert!(eval_bool("resource.metadata.region == 'us-east-1'"));
    }

    #[test]
    fn test_string_methods() {
        assert!(eval_bool("resource.name.startsWith('prod')"));
        assert!(eval_bool("resource.name.endsWith('cluster')"));
        assert!(eval_bool("resource.name.contains('-')"));
        assert!(!eval_bool("resource.name.startsWith('staging')"));
    }

    #[test]
    fn test_boolean_operators() {
        assert!(eval_bool(
            "resource.kind == 'Kubernetes' && resource.name.startsWith('prod')"
        ));
        assert!(eval_bool(
            "resource.kind == 'Terraform' || resource.metadata.tier == '1'"
        ));
        assert!(eval_bool("!(resource.kind == 'Terraform')"));
    }

    #[test]
    fn test_missing_member_is_null() {
        assert!(eval_bool("resource.metadata.missing == null"));
        assert!(!eval_bool("resource.metadata.missing == 'x'"));
        // Methods on null are false, not errors
        assert!(!eval_bool("resource.metadata.missing.startsWith('x')"));
    }

    #[test]
    fn test_numeric_comparison() {
        let ctx = ExpressionContext::new().with_root("result", json!({"latency_ms": 42}));
        let evaluator = BasicEvaluator::new();
        assert!(evaluator
            .evaluate_bool("result.latency_ms < 100", &ctx)
            .unwrap());
        assert!(evaluator
            .evaluate_bool("result.latency_ms >= 42", &ctx)
            .unwrap());
    }

    #[test]
    fn test_unknown_root_errors() {
        let err = BasicEvaluator::new()
            .evaluate_bool("nope.name == 'x'", &ctx())
            .unwrap_err();
        assert!(matches!(err, ExpressionError::UnknownRoot(_)));
    }

    #[test]
    fn test_repeated_evaluation_is_deterministic() {
        let evaluator = BasicEvaluator::new();
        for _ in 0..10 {
            assert!(evaluator
                .evaluate_bool("resource.kind == 'Kubernetes'", &ctx())
                .unwrap());
        }
    }
}
