//! Expression language for attribute conditions on rules.
//!
//! Supported syntax:
//! - Comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`
//! - Boolean operators: `&&`, `||`, `!`
//! - Membership: `x in list`, where `list` is a path or an array literal `["a", "b"]`
//! - Dot-path access: `resource.attr.ownerId`, `principal.id`, `request.ip`
//! - Literals: integers, floats (optionally negative), `"strings"`, `true`, `false`
//! - Parentheses for grouping
//!
//! Evaluation never fails once an expression has parsed. Missing paths read
//! as null, ordering comparisons on non-numbers are false and any
//! non-boolean value in a boolean position counts as false.

use crate::authz::errors::AuthzError;
use serde_json::Value;
use std::cmp::Ordering;

// ─── AST ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    List(Vec<Expr>),
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    UnaryNot(Box<Expr>),
    In {
        element: Box<Expr>,
        collection: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
}

impl BinOp {
    /// Operator with its operands swapped: `a > b` is `b < a`.
    pub fn flipped(self) -> Self {
        match self {
            BinOp::Gt => BinOp::Lt,
            BinOp::Lt => BinOp::Gt,
            BinOp::Ge => BinOp::Le,
            BinOp::Le => BinOp::Ge,
            other => other,
        }
    }
}

/// A parsed condition together with the text it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub source: String,
    pub expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, AuthzError> {
        Ok(Self {
            source: source.to_string(),
            expr: parse_condition(source)?,
        })
    }

    pub fn evaluate(&self, context: &Value) -> bool {
        evaluate(&self.expr, context)
    }
}

// ─── Tokenizer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Op(BinOp),
    Not,
    In,
}

fn tokenize(input: &str) -> Result<Vec<Token>, AuthzError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    let next_is = |i: usize, c: char| chars.get(i + 1) == Some(&c);

    while i < chars.len() {
        let c = chars[i];
        let (token, width) = match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
                continue;
            }
            '.' => (Token::Dot, 1),
            ',' => (Token::Comma, 1),
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            '[' => (Token::LBracket, 1),
            ']' => (Token::RBracket, 1),
            '=' if next_is(i, '=') => (Token::Op(BinOp::Eq), 2),
            '!' if next_is(i, '=') => (Token::Op(BinOp::Ne), 2),
            '!' => (Token::Not, 1),
            '>' if next_is(i, '=') => (Token::Op(BinOp::Ge), 2),
            '>' => (Token::Op(BinOp::Gt), 1),
            '<' if next_is(i, '=') => (Token::Op(BinOp::Le), 2),
            '<' => (Token::Op(BinOp::Lt), 1),
            '&' if next_is(i, '&') => (Token::Op(BinOp::And), 2),
            '|' if next_is(i, '|') => (Token::Op(BinOp::Or), 2),
            '"' => {
                let mut s = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        None => {
                            return Err(AuthzError::InvalidCondition(
                                "unterminated string literal".into(),
                            ))
                        }
                        Some('"') => break,
                        Some('\\') => {
                            if let Some(escaped) = chars.get(j + 1) {
                                s.push(*escaped);
                            }
                            j += 2;
                        }
                        Some(other) => {
                            s.push(*other);
                            j += 1;
                        }
                    }
                }
                (Token::Str(s), j + 1 - i)
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) =>
            {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].is_ascii_digit() || chars[j] == '.') {
                    j += 1;
                }
                let num_str: String = chars[i..j].iter().collect();
                let token = if num_str.contains('.') {
                    Token::Float(num_str.parse().map_err(|_| {
                        AuthzError::InvalidCondition(format!("invalid float `{num_str}`"))
                    })?)
                } else {
                    Token::Int(num_str.parse().map_err(|_| {
                        AuthzError::InvalidCondition(format!("invalid integer `{num_str}`"))
                    })?)
                };
                (token, j - i)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut j = i;
                while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                let word: String = chars[i..j].iter().collect();
                let token = match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "in" => Token::In,
                    _ => Token::Ident(word),
                };
                (token, j - i)
            }
            c => {
                return Err(AuthzError::InvalidCondition(format!(
                    "unexpected character `{c}`"
                )));
            }
        };
        tokens.push(token);
        i += width;
    }
    Ok(tokens)
}

// ─── Parser ─────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), AuthzError> {
        if self.advance() != Some(expected) {
            return Err(AuthzError::InvalidCondition(format!("expected {what}")));
        }
        Ok(())
    }

    /// or_expr = and_expr ("||" and_expr)*
    fn parse_or(&mut self) -> Result<Expr, AuthzError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Op(BinOp::Or)) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::BinOp {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    /// and_expr = comparison ("&&" comparison)*
    fn parse_and(&mut self) -> Result<Expr, AuthzError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::Op(BinOp::And)) {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::BinOp {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    /// comparison = unary ((cmp_op | "in") unary)?
    fn parse_comparison(&mut self) -> Result<Expr, AuthzError> {
        let left = self.parse_unary()?;
        match self.peek().cloned() {
            Some(Token::Op(op)) if !matches!(op, BinOp::And | BinOp::Or) => {
                self.advance();
                let right = self.parse_unary()?;
                Ok(Expr::BinOp {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                })
            }
            Some(Token::In) => {
                self.advance();
                let right = self.parse_unary()?;
                Ok(Expr::In {
                    element: Box::new(left),
                    collection: Box::new(right),
                })
            }
            _ => Ok(left),
        }
    }

    /// unary = "!" unary | primary
    fn parse_unary(&mut self) -> Result<Expr, AuthzError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(Expr::UnaryNot(Box::new(expr)));
        }
        self.parse_primary()
    }

    /// primary = literal | path | list | "(" expr ")"
    fn parse_primary(&mut self) -> Result<Expr, AuthzError> {
        match self.advance() {
            Some(Token::Int(n)) => Ok(Expr::Literal(Value::from(n))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::from(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Ident(name)) => {
                let mut path = vec![name];
                while self.peek() == Some(&Token::Dot) {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(seg)) => path.push(seg),
                        _ => {
                            return Err(AuthzError::InvalidCondition(
                                "expected identifier after `.`".into(),
                            ));
                        }
                    }
                }
                Ok(Expr::Path(path))
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.advance();
                    return Ok(Expr::List(items));
                }
                loop {
                    items.push(self.parse_unary()?);
                    match self.advance() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => break,
                        _ => {
                            return Err(AuthzError::InvalidCondition(
                                "expected `,` or `]` in list literal".into(),
                            ))
                        }
                    }
                }
                Ok(Expr::List(items))
            }
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                self.expect(Token::RParen, "closing parenthesis `)`")?;
                Ok(expr)
            }
            other => Err(AuthzError::InvalidCondition(format!(
                "unexpected token: {other:?}"
            ))),
        }
    }
}

/// Parse a condition expression string into an AST.
pub fn parse_condition(input: &str) -> Result<Expr, AuthzError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(AuthzError::InvalidCondition("empty expression".into()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(AuthzError::InvalidCondition(format!(
            "unexpected trailing token: {:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

// ─── Evaluator ──────────────────────────────────────────────────────────

/// Evaluate a parsed expression against a JSON context.
pub fn evaluate(expr: &Expr, context: &Value) -> bool {
    truthy(&eval_value(expr, context))
}

fn eval_value(expr: &Expr, context: &Value) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Path(segments) => lookup_path(context, segments).clone(),
        Expr::List(items) => Value::Array(items.iter().map(|e| eval_value(e, context)).collect()),
        Expr::UnaryNot(inner) => Value::Bool(!evaluate(inner, context)),
        Expr::In {
            element,
            collection,
        } => {
            let elem = eval_value(element, context);
            Value::Bool(contains(&eval_value(collection, context), &elem))
        }
        Expr::BinOp { op, left, right } => {
            let l = eval_value(left, context);
            let r = eval_value(right, context);
            let result = match op {
                BinOp::And => truthy(&l) && truthy(&r),
                BinOp::Or => truthy(&l) || truthy(&r),
                BinOp::Eq => values_equal(&l, &r),
                BinOp::Ne => !values_equal(&l, &r),
                ordering => compare_numbers(*ordering, &l, &r),
            };
            Value::Bool(result)
        }
    }
}

pub(crate) fn lookup_path<'a>(context: &'a Value, segments: &[String]) -> &'a Value {
    let mut current = context;
    for seg in segments {
        current = current.get(seg).unwrap_or(&Value::Null);
    }
    current
}

/// Only a literal `true` is true.
pub fn truthy(value: &Value) -> bool {
    matches!(value, Value::Bool(true))
}

/// Equality with integers and floats compared numerically.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Ordering comparison; false unless both sides are numbers.
pub fn compare_numbers(op: BinOp, a: &Value, b: &Value) -> bool {
    let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
        return false;
    };
    match x.partial_cmp(&y) {
        Some(ord) => match op {
            BinOp::Gt => ord == Ordering::Greater,
            BinOp::Lt => ord == Ordering::Less,
            BinOp::Ge => ord != Ordering::Less,
            BinOp::Le => ord != Ordering::Greater,
            _ => false,
        },
        None => false,
    }
}

/// Membership; false when `collection` is not an array.
pub fn contains(collection: &Value, element: &Value) -> bool {
    match collection {
        Value::Array(items) => items.iter().any(|item| values_equal(item, element)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(src: &str, ctx: &Value) -> bool {
        evaluate(&parse_condition(src).unwrap(), ctx)
    }

    #[test]
    fn test_parse_simple_comparison() {
        let expr = parse_condition("x == 5").unwrap();
        assert_eq!(
            expr,
            Expr::BinOp {
                op: BinOp::Eq,
                left: Box::new(Expr::Path(vec!["x".into()])),
                right: Box::new(Expr::Literal(json!(5))),
            }
        );
    }

    #[test]
    fn test_parse_dot_path() {
        let expr = parse_condition("resource.attr.ownerId == principal.id").unwrap();
        assert_eq!(
            expr,
            Expr::BinOp {
                op: BinOp::Eq,
                left: Box::new(Expr::Path(vec![
                    "resource".into(),
                    "attr".into(),
                    "ownerId".into()
                ])),
                right: Box::new(Expr::Path(vec!["principal".into(), "id".into()])),
            }
        );
    }

    #[test]
    fn test_parse_list_literal_and_negative_numbers() {
        let expr = parse_condition(r#"resource.attr.status in ["open", "won"]"#).unwrap();
        match expr {
            Expr::In { collection, .. } => assert_eq!(
                *collection,
                Expr::List(vec![
                    Expr::Literal(json!("open")),
                    Expr::Literal(json!("won"))
                ])
            ),
            _ => panic!("expected In"),
        }

        let expr = parse_condition("balance > -5").unwrap();
        match expr {
            Expr::BinOp { right, .. } => assert_eq!(*right, Expr::Literal(json!(-5))),
            _ => panic!("expected BinOp"),
        }
    }

    #[test]
    fn test_parse_parentheses() {
        let expr = parse_condition("(a || b) && c").unwrap();
        match expr {
            Expr::BinOp {
                op: BinOp::And,
                left,
                ..
            } => assert!(matches!(*left, Expr::BinOp { op: BinOp::Or, .. })),
            _ => panic!("expected And"),
        }
    }

    #[test]
    fn test_string_escapes() {
        let expr = parse_condition(r#"name == "say \"hi\"""#).unwrap();
        match expr {
            Expr::BinOp { right, .. } => assert_eq!(*right, Expr::Literal(json!("say \"hi\""))),
            _ => panic!("expected BinOp"),
        }
    }

    #[test]
    fn test_evaluate_comparisons() {
        let ctx = json!({ "request": { "time": { "hour": 14 } } });
        assert!(eval("request.time.hour >= 9 && request.time.hour < 17", &ctx));
        assert!(!eval("request.time.hour > 20", &ctx));
        assert!(eval("request.time.hour == 14.0", &ctx));
    }

    #[test]
    fn test_evaluate_in() {
        let ctx = json!({
            "request": { "ip": "10.0.0.1" },
            "context": { "corporate_ips": ["10.0.0.1", "10.0.0.2"] }
        });
        assert!(eval("request.ip in context.corporate_ips", &ctx));
        assert!(eval(r#"request.ip in ["10.0.0.1"]"#, &ctx));
        assert!(!eval(r#"request.ip in ["192.168.1.1"]"#, &ctx));
        // non-array collection
        assert!(!eval("request.ip in request.ip", &ctx));
    }

    #[test]
    fn test_evaluate_is_total() {
        let ctx = json!({ "name": "abc", "n": 3 });
        // ordering on strings and missing paths is false
        assert!(!eval("name > 1", &ctx));
        assert!(!eval("missing < 1", &ctx));
        // non-booleans in boolean position are false
        assert!(!eval("name", &ctx));
        assert!(eval("!name", &ctx));
        assert!(!eval("name && n == 3", &ctx));
        assert!(eval("name || n == 3", &ctx));
        // missing equals null-only
        assert!(!eval(r#"missing == "x""#, &ctx));
        assert!(eval(r#"missing != "x""#, &ctx));
    }

    #[test]
    fn test_evaluate_not() {
        assert!(eval("!disabled", &json!({ "disabled": false })));
        assert!(!eval("!disabled", &json!({ "disabled": true })));
    }

    #[test]
    fn test_condition_keeps_source() {
        let c = Condition::parse("a == 1 || b == 2").unwrap();
        assert_eq!(c.source, "a == 1 || b == 2");
        assert!(c.evaluate(&json!({"a": 0, "b": 2})));
        assert!(!c.evaluate(&json!({"a": 0, "b": 0})));
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(parse_condition("").is_err());
        assert!(parse_condition(r#""hello"#).is_err());
        assert!(parse_condition("a == ").is_err());
        assert!(parse_condition("(a == 1").is_err());
        assert!(parse_condition("[1, 2").is_err());
        assert!(parse_condition("a # b").is_err());
    }
}
