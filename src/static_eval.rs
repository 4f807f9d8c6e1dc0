//! Static Expression Evaluator for the NCL Compiler
//!
//! Template expressions are deliberately small: paths, literals, comparisons,
//! boolean logic and a whitelist of zero-argument methods. They are parsed
//! into `Expr` once and evaluated against any `Bindings` implementation.

use serde_json::{Number, Value};
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════════════
// AST
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Method(Box<Expr>, Method),
    Not(Box<Expr>),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Len,
    IsEmpty,
    ToUppercase,
    ToLowercase,
    Trim,
    First,
    Last,
}

impl Method {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "len" | "length" | "count" => Some(Method::Len),
            "is_empty" | "isEmpty" => Some(Method::IsEmpty),
            "to_uppercase" | "toUpperCase" | "upper" => Some(Method::ToUppercase),
            "to_lowercase" | "toLowerCase" | "lower" => Some(Method::ToLowercase),
            "trim" => Some(Method::Trim),
            "first" => Some(Method::First),
            "last" => Some(Method::Last),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// The root identifier is not bound anywhere.
    Unresolved(String),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Unresolved(name) => write!(f, "`{}` is not defined", name),
        }
    }
}

/// Name lookup used by the evaluator.
pub trait Bindings {
    fn get(&self, name: &str) -> Option<Value>;
}

impl Bindings for serde_json::Map<String, Value> {
    fn get(&self, name: &str) -> Option<Value> {
        serde_json::Map::get(self, name).cloned()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TOKENIZER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Number(Number),
    Str(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Bang,
    Op(BinaryOp),
}

fn tokenize(src: &str) -> Result<Vec<Tok>, ParseError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(match word.as_str() {
                "and" => Tok::Op(BinaryOp::And),
                "or" => Tok::Op(BinaryOp::Or),
                "not" => Tok::Bang,
                _ => Tok::Ident(word),
            });
            continue;
        }
        if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) && starts_operand(&tokens)) {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                // `items.0` style access is not supported; a dot must be followed by a digit
                if chars[i] == '.' && !chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) {
                    break;
                }
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Tok::Number(parse_number(&text).ok_or_else(|| ParseError {
                message: format!("invalid number `{}`", text),
            })?));
            continue;
        }
        if c == '"' || c == '\'' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            let mut closed = false;
            while i < chars.len() {
                match chars[i] {
                    '\\' if i + 1 < chars.len() => {
                        value.push(match chars[i + 1] {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                        i += 2;
                    }
                    ch if ch == quote => {
                        closed = true;
                        i += 1;
                        break;
                    }
                    ch => {
                        value.push(ch);
                        i += 1;
                    }
                }
            }
            if !closed {
                return Err(ParseError {
                    message: "unterminated string literal".to_string(),
                });
            }
            tokens.push(Tok::Str(value));
            continue;
        }

        let next = chars.get(i + 1).copied();
        let (tok, width) = match (c, next) {
            ('=', Some('=')) => (Tok::Op(BinaryOp::Eq), if chars.get(i + 2) == Some(&'=') { 3 } else { 2 }),
            ('!', Some('=')) => (Tok::Op(BinaryOp::Ne), if chars.get(i + 2) == Some(&'=') { 3 } else { 2 }),
            ('<', Some('=')) => (Tok::Op(BinaryOp::Le), 2),
            ('>', Some('=')) => (Tok::Op(BinaryOp::Ge), 2),
            ('&', Some('&')) => (Tok::Op(BinaryOp::And), 2),
            ('|', Some('|')) => (Tok::Op(BinaryOp::Or), 2),
            ('<', _) => (Tok::Op(BinaryOp::Lt), 1),
            ('>', _) => (Tok::Op(BinaryOp::Gt), 1),
            ('!', _) => (Tok::Bang, 1),
            ('.', _) => (Tok::Dot, 1),
            ('[', _) => (Tok::LBracket, 1),
            (']', _) => (Tok::RBracket, 1),
            ('(', _) => (Tok::LParen, 1),
            (')', _) => (Tok::RParen, 1),
            _ => {
                return Err(ParseError {
                    message: format!("unexpected character `{}`", c),
                })
            }
        };
        tokens.push(tok);
        i += width;
    }

    Ok(tokens)
}

/// A leading `-` is a sign only where an operand is expected.
fn starts_operand(tokens: &[Tok]) -> bool {
    matches!(
        tokens.last(),
        None | Some(Tok::Op(_)) | Some(Tok::Bang) | Some(Tok::LParen) | Some(Tok::LBracket)
    )
}

fn parse_number(text: &str) -> Option<Number> {
    if let Ok(int) = text.parse::<i64>() {
        return Some(Number::from(int));
    }
    text.parse::<f64>().ok().and_then(Number::from_f64)
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARSER
// ═══════════════════════════════════════════════════════════════════════════════

struct ExprParser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, expected: Tok, what: &str) -> Result<(), ParseError> {
        match self.next() {
            Some(tok) if tok == expected => Ok(()),
            _ => Err(ParseError {
                message: format!("expected {}", what),
            }),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Tok::Op(BinaryOp::Or)) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Binary(Box::new(left), BinaryOp::Or, Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Tok::Op(BinaryOp::And)) {
            self.pos += 1;
            let right = self.parse_comparison()?;
            left = Expr::Binary(Box::new(left), BinaryOp::And, Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_unary()?;
        match self.peek() {
            Some(Tok::Op(op)) if !matches!(op, BinaryOp::And | BinaryOp::Or) => {
                let op = *op;
                self.pos += 1;
                let right = self.parse_unary()?;
                Ok(Expr::Binary(Box::new(left), op, Box::new(right)))
            }
            _ => Ok(left),
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some(&Tok::Bang) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Tok::Dot) => {
                    self.pos += 1;
                    let name = match self.next() {
                        Some(Tok::Ident(name)) => name,
                        _ => {
                            return Err(ParseError {
                                message: "expected a field name after `.`".to_string(),
                            })
                        }
                    };
                    if self.peek() == Some(&Tok::LParen) {
                        self.pos += 1;
                        self.expect(Tok::RParen, "`)`: methods take no arguments")?;
                        let method = Method::from_name(&name).ok_or_else(|| ParseError {
                            message: format!("method `{}` is not supported", name),
                        })?;
                        expr = Expr::Method(Box::new(expr), method);
                    } else {
                        expr = Expr::Field(Box::new(expr), name);
                    }
                }
                Some(Tok::LBracket) => {
                    self.pos += 1;
                    let index = self.parse_or()?;
                    self.expect(Tok::RBracket, "`]`")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.next() {
            Some(Tok::Ident(name)) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" | "None" | "undefined" => Expr::Literal(Value::Null),
                _ => Expr::Ident(name),
            }),
            Some(Tok::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Tok::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Tok::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Tok::RParen, "`)`")?;
                Ok(inner)
            }
            Some(tok) => Err(ParseError {
                message: format!("unexpected token {:?}", tok),
            }),
            None => Err(ParseError {
                message: "unexpected end of expression".to_string(),
            }),
        }
    }
}

/// Parse a template expression.
pub fn parse_expression(src: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err(ParseError {
            message: "empty expression".to_string(),
        });
    }
    let mut parser = ExprParser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(ParseError {
            message: format!("unexpected trailing input in `{}`", src.trim()),
        });
    }
    Ok(expr)
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVALUATION
// ═══════════════════════════════════════════════════════════════════════════════

impl Expr {
    /// Free identifiers, in order of first appearance.
    pub fn roots(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_roots(&mut out);
        out
    }

    fn collect_roots(&self, out: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ident(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Field(base, _) | Expr::Method(base, _) | Expr::Not(base) => base.collect_roots(out),
            Expr::Index(base, index) => {
                base.collect_roots(out);
                index.collect_roots(out);
            }
            Expr::Binary(left, _, right) => {
                left.collect_roots(out);
                right.collect_roots(out);
            }
        }
    }

    pub fn evaluate(&self, bindings: &dyn Bindings) -> Result<Value, EvalError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name) => bindings
                .get(name)
                .ok_or_else(|| EvalError::Unresolved(name.clone())),
            Expr::Field(base, field) => {
                let base = base.evaluate(bindings)?;
                Ok(field_of(&base, field))
            }
            Expr::Index(base, index) => {
                let base = base.evaluate(bindings)?;
                let index = index.evaluate(bindings)?;
                Ok(match (&base, &index) {
                    (Value::Array(items), Value::Number(n)) => n
                        .as_u64()
                        .and_then(|i| items.get(i as usize))
                        .cloned()
                        .unwrap_or(Value::Null),
                    (Value::Object(_), Value::String(key)) => field_of(&base, key),
                    _ => Value::Null,
                })
            }
            Expr::Method(base, method) => {
                let base = base.evaluate(bindings)?;
                Ok(apply_method(&base, *method))
            }
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&inner.evaluate(bindings)?))),
            Expr::Binary(left, op, right) => match op {
                BinaryOp::And => {
                    let l = left.evaluate(bindings)?;
                    if !is_truthy(&l) {
                        return Ok(Value::Bool(false));
                    }
                    Ok(Value::Bool(is_truthy(&right.evaluate(bindings)?)))
                }
                BinaryOp::Or => {
                    let l = left.evaluate(bindings)?;
                    if is_truthy(&l) {
                        return Ok(Value::Bool(true));
                    }
                    Ok(Value::Bool(is_truthy(&right.evaluate(bindings)?)))
                }
                _ => {
                    let l = left.evaluate(bindings)?;
                    let r = right.evaluate(bindings)?;
                    Ok(Value::Bool(compare(&l, *op, &r)))
                }
            },
        }
    }
}

fn field_of(base: &Value, field: &str) -> Value {
    match base {
        Value::Object(map) => map.get(field).cloned().unwrap_or(Value::Null),
        Value::Array(items) if field == "length" => Value::from(items.len()),
        Value::String(s) if field == "length" => Value::from(s.chars().count()),
        _ => Value::Null,
    }
}

fn apply_method(base: &Value, method: Method) -> Value {
    match (method, base) {
        (Method::Len, Value::Array(items)) => Value::from(items.len()),
        (Method::Len, Value::String(s)) => Value::from(s.chars().count()),
        (Method::Len, Value::Object(map)) => Value::from(map.len()),
        (Method::Len, _) => Value::from(0),
        (Method::IsEmpty, Value::Array(items)) => Value::Bool(items.is_empty()),
        (Method::IsEmpty, Value::String(s)) => Value::Bool(s.is_empty()),
        (Method::IsEmpty, Value::Object(map)) => Value::Bool(map.is_empty()),
        (Method::IsEmpty, Value::Null) => Value::Bool(true),
        (Method::IsEmpty, _) => Value::Bool(false),
        (Method::ToUppercase, Value::String(s)) => Value::String(s.to_uppercase()),
        (Method::ToLowercase, Value::String(s)) => Value::String(s.to_lowercase()),
        (Method::Trim, Value::String(s)) => Value::String(s.trim().to_string()),
        (Method::First, Value::Array(items)) => items.first().cloned().unwrap_or(Value::Null),
        (Method::Last, Value::Array(items)) => items.last().cloned().unwrap_or(Value::Null),
        (_, other) => other.clone(),
    }
}

fn compare(left: &Value, op: BinaryOp, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return match op {
            BinaryOp::Eq => l == r,
            BinaryOp::Ne => l != r,
            BinaryOp::Lt => l < r,
            BinaryOp::Le => l <= r,
            BinaryOp::Gt => l > r,
            BinaryOp::Ge => l >= r,
            _ => false,
        };
    }
    if let (Value::String(l), Value::String(r)) = (left, right) {
        return match op {
            BinaryOp::Eq => l == r,
            BinaryOp::Ne => l != r,
            BinaryOp::Lt => l < r,
            BinaryOp::Le => l <= r,
            BinaryOp::Gt => l > r,
            BinaryOp::Ge => l >= r,
            _ => false,
        };
    }
    match op {
        BinaryOp::Eq => left == right,
        BinaryOp::Ne => left != right,
        _ => false,
    }
}

/// `null`, `false`, `0`, `""`, `[]` and `{}` are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// String form of a scalar value; `None` for arrays and objects.
pub fn render_scalar(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(render_number(n)),
        Value::String(s) => Some(s.clone()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

pub fn render_number(n: &Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

/// Parse a literal as written in templates and island scripts.
pub fn parse_literal(src: &str) -> Option<Value> {
    match parse_expression(src) {
        Ok(Expr::Literal(value)) => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> serde_json::Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        }
    }

    #[test]
    fn test_paths_and_methods() {
        let ctx = data(json!({ "user": { "name": "Alex", "tags": ["a", "b"] } }));
        let eval = |src: &str| parse_expression(src).unwrap().evaluate(&ctx).unwrap();
        assert_eq!(eval("user.name"), json!("Alex"));
        assert_eq!(eval("user.tags.len()"), json!(2));
        assert_eq!(eval("user.tags.length"), json!(2));
        assert_eq!(eval("user.tags[1]"), json!("b"));
        assert_eq!(eval("user.name.to_uppercase()"), json!("ALEX"));
        assert_eq!(eval("user.missing"), Value::Null);
    }

    #[test]
    fn test_unresolved_root() {
        let ctx = data(json!({}));
        let err = parse_expression("ghost.name").unwrap().evaluate(&ctx).unwrap_err();
        assert_eq!(err, EvalError::Unresolved("ghost".into()));
    }

    #[test]
    fn test_logic_and_comparison() {
        let ctx = data(json!({ "count": 3, "role": "admin", "items": [] }));
        let eval = |src: &str| parse_expression(src).unwrap().evaluate(&ctx).unwrap();
        assert_eq!(eval("count > 2 && role == 'admin'"), json!(true));
        assert_eq!(eval("not items or count < 0"), json!(true));
        assert_eq!(eval("!(count >= 3)"), json!(false));
        assert_eq!(eval("count == -3"), json!(false));
    }

    #[test]
    fn test_rejects_unsupported_syntax() {
        assert!(parse_expression("items.push(1)").is_err());
        assert!(parse_expression("a + b").is_err());
        assert!(parse_expression("").is_err());
        assert!(parse_expression("'open").is_err());
    }

    #[test]
    fn test_truthiness_and_rendering() {
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!("0")));
        assert_eq!(render_scalar(&json!(2.0)), Some("2".into()));
        assert_eq!(render_scalar(&json!(1.5)), Some("1.5".into()));
        assert_eq!(render_scalar(&Value::Null), Some(String::new()));
        assert_eq!(render_scalar(&json!({"a": 1})), None);
    }

    #[test]
    fn test_roots() {
        let expr = parse_expression("user.name == other[key]").unwrap();
        assert_eq!(expr.roots(), vec!["user", "other", "key"]);
    }
}
