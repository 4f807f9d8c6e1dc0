//! Island Extraction
//!
//! An `<n:island>` region carries a small script of state and derived
//! declarations. The script is parsed into typed entries, interpolations of
//! declared names become binding markers, and event attributes become action
//! markers backed by a typed `Mutation`. Anything outside the whitelisted
//! forms turns the whole island into an inline error block.

use crate::finalize::{escape_html, unescape_html};
use crate::static_eval::{is_truthy, parse_literal, render_scalar};
use crate::validate::{
    AttributeIR, AttributeValue, Diagnostic, ElementNode, ErrorKind, HydrationStrategy,
    IslandNode, SourceLocation, Stage, TemplateNode, TextNode,
};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

lazy_static! {
    static ref DECLARED_NAME: Regex =
        Regex::new(r"^let\s+(?:mut\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*=").unwrap();
    static ref SIGNAL_DECL: Regex = Regex::new(
        r"^let\s+(?:mut\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(?:Signal|signal|Signal::new)\s*\((.*)\)$"
    )
    .unwrap();
    static ref COMPUTED_DECL: Regex = Regex::new(
        r"^let\s+(?:mut\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*=\s*computed\s*\(\s*([A-Za-z_][A-Za-z0-9_]*)\s*,\s*(?:move\s+)?\|\s*([A-Za-z_][A-Za-z0-9_]*)\s*\|\s*(.+)\)$"
    )
    .unwrap();
    static ref UPDATE_ACTION: Regex = Regex::new(
        r"^([A-Za-z_][A-Za-z0-9_]*)\.update\(\s*\|\s*([A-Za-z_][A-Za-z0-9_]*)\s*\|\s*\*?\s*([A-Za-z_][A-Za-z0-9_]*)\s*(\+=|-=|=)\s*(.+?)\s*\)$"
    )
    .unwrap();
    static ref SET_ACTION: Regex =
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\.set\(\s*(.+?)\s*\)$").unwrap();
    static ref BARE_NAME: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════════
// RUNTIME MODULE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEntry {
    pub name: String,
    pub initial: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedEntry {
    pub name: String,
    pub dependency: String,
    pub param: String,
    pub expr: DerivedExpr,
    /// Value computed from the dependency's initial value.
    pub initial: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationOp {
    Assign,
    Increment,
    Decrement,
}

impl MutationOp {
    pub fn symbol(self) -> &'static str {
        match self {
            MutationOp::Assign => "=",
            MutationOp::Increment => "+=",
            MutationOp::Decrement => "-=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub target: String,
    pub op: MutationOp,
    pub operand: Value,
}

impl Mutation {
    pub fn apply(&self, current: &Value) -> Value {
        match self.op {
            MutationOp::Assign => self.operand.clone(),
            MutationOp::Increment => binary(DerivedOp::Add, current, &self.operand),
            MutationOp::Decrement => binary(DerivedOp::Sub, current, &self.operand),
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.target, self.op.symbol(), self.operand)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionBinding {
    /// Value of the `data-ncl-action` marker, e.g. `i0a1`.
    pub id: String,
    /// DOM event name without the `on` prefix.
    pub event: String,
    pub mutation: Mutation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeModule {
    pub id: String,
    pub strategy: HydrationStrategy,
    pub state: Vec<StateEntry>,
    pub derived: Vec<DerivedEntry>,
    pub actions: Vec<ActionBinding>,
}

impl RuntimeModule {
    pub fn is_state(&self, name: &str) -> bool {
        self.state.iter().any(|s| s.name == name)
    }

    pub fn is_derived(&self, name: &str) -> bool {
        self.derived.iter().any(|d| d.name == name)
    }

    pub fn initial_value(&self, name: &str) -> Option<&Value> {
        self.state
            .iter()
            .find(|s| s.name == name)
            .map(|s| &s.initial)
            .or_else(|| self.derived.iter().find(|d| d.name == name).map(|d| &d.initial))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DERIVED EXPRESSIONS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DerivedOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl DerivedOp {
    pub fn name(self) -> &'static str {
        match self {
            DerivedOp::Add => "add",
            DerivedOp::Sub => "sub",
            DerivedOp::Mul => "mul",
            DerivedOp::Div => "div",
            DerivedOp::Rem => "rem",
            DerivedOp::Eq => "eq",
            DerivedOp::Ne => "ne",
            DerivedOp::Lt => "lt",
            DerivedOp::Le => "le",
            DerivedOp::Gt => "gt",
            DerivedOp::Ge => "ge",
            DerivedOp::And => "and",
            DerivedOp::Or => "or",
        }
    }
}

/// The body of a `computed` closure. The closure parameter is the only name
/// in scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DerivedExpr {
    Param,
    Literal { value: Value },
    Neg { expr: Box<DerivedExpr> },
    Not { expr: Box<DerivedExpr> },
    Binary {
        op: DerivedOp,
        left: Box<DerivedExpr>,
        right: Box<DerivedExpr>,
    },
}

impl DerivedExpr {
    pub fn evaluate(&self, param: &Value) -> Value {
        match self {
            DerivedExpr::Param => param.clone(),
            DerivedExpr::Literal { value } => value.clone(),
            DerivedExpr::Neg { expr } => match expr.evaluate(param).as_f64() {
                Some(n) => number(-n),
                None => Value::Null,
            },
            DerivedExpr::Not { expr } => Value::Bool(!is_truthy(&expr.evaluate(param))),
            DerivedExpr::Binary { op, left, right } => {
                binary(*op, &left.evaluate(param), &right.evaluate(param))
            }
        }
    }
}

/// Arithmetic and comparison shared by derived values and mutations. The
/// generated runtime implements the same table.
pub fn binary(op: DerivedOp, left: &Value, right: &Value) -> Value {
    let nums = (left.as_f64(), right.as_f64());
    match op {
        DerivedOp::Add => match nums {
            (Some(l), Some(r)) => number(l + r),
            _ => Value::String(format!(
                "{}{}",
                render_scalar(left).unwrap_or_default(),
                render_scalar(right).unwrap_or_default()
            )),
        },
        DerivedOp::Sub | DerivedOp::Mul | DerivedOp::Div | DerivedOp::Rem => {
            let (Some(l), Some(r)) = nums else {
                return Value::Null;
            };
            match op {
                DerivedOp::Sub => number(l - r),
                DerivedOp::Mul => number(l * r),
                DerivedOp::Div if r == 0.0 => Value::Null,
                DerivedOp::Div => number(l / r),
                DerivedOp::Rem if r == 0.0 => Value::Null,
                _ => number(l % r),
            }
        }
        DerivedOp::Eq => Value::Bool(loose_eq(left, right)),
        DerivedOp::Ne => Value::Bool(!loose_eq(left, right)),
        DerivedOp::Lt | DerivedOp::Le | DerivedOp::Gt | DerivedOp::Ge => {
            let ordering = match (nums, left, right) {
                ((Some(l), Some(r)), _, _) => l.partial_cmp(&r),
                (_, Value::String(l), Value::String(r)) => Some(l.cmp(r)),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return Value::Bool(false);
            };
            Value::Bool(match op {
                DerivedOp::Lt => ordering.is_lt(),
                DerivedOp::Le => ordering.is_le(),
                DerivedOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
        DerivedOp::And => Value::Bool(is_truthy(left) && is_truthy(right)),
        DerivedOp::Or => Value::Bool(is_truthy(left) || is_truthy(right)),
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

/// Integral results stay integers so `1 + 1` renders as `2`.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

const OPERATORS: &[&str] = &[
    "==", "!=", "<=", ">=", "&&", "||", "+", "-", "*", "/", "%", "<", ">", "!",
];

fn tokenize_derived(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
        } else if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == '_') {
                i += 1;
            }
            let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| format!("invalid number `{}`", text))?;
            tokens.push(Token::Number(value));
        } else if c == '"' || c == '\'' {
            let mut value = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err("unterminated string".into()),
                    Some(&q) if q == c => break,
                    Some('\\') => {
                        if let Some(&next) = chars.get(i + 1) {
                            value.push(next);
                        }
                        i += 2;
                        continue;
                    }
                    Some(&other) => value.push(other),
                }
                i += 1;
            }
            i += 1;
            tokens.push(Token::Str(value));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
            let Some(&op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) else {
                return Err(format!("unexpected `{}`", c));
            };
            tokens.push(Token::Op(op));
            i += op.len();
        }
    }
    Ok(tokens)
}

struct DerivedParser<'p> {
    tokens: Vec<Token>,
    pos: usize,
    param: &'p str,
}

impl DerivedParser<'_> {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn binary_level(
        &mut self,
        ops: &[(&str, DerivedOp)],
        next: fn(&mut Self) -> Result<DerivedExpr, String>,
    ) -> Result<DerivedExpr, String> {
        let mut left = next(self)?;
        while let Some(op) = self
            .peek_op()
            .and_then(|t| ops.iter().find(|(s, _)| *s == t).map(|(_, op)| *op))
        {
            self.pos += 1;
            let right = next(self)?;
            left = DerivedExpr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn or(&mut self) -> Result<DerivedExpr, String> {
        self.binary_level(&[("||", DerivedOp::Or)], Self::and)
    }

    fn and(&mut self) -> Result<DerivedExpr, String> {
        self.binary_level(&[("&&", DerivedOp::And)], Self::equality)
    }

    fn equality(&mut self) -> Result<DerivedExpr, String> {
        self.binary_level(&[("==", DerivedOp::Eq), ("!=", DerivedOp::Ne)], Self::comparison)
    }

    fn comparison(&mut self) -> Result<DerivedExpr, String> {
        self.binary_level(
            &[
                ("<", DerivedOp::Lt),
                ("<=", DerivedOp::Le),
                (">", DerivedOp::Gt),
                (">=", DerivedOp::Ge),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<DerivedExpr, String> {
        self.binary_level(&[("+", DerivedOp::Add), ("-", DerivedOp::Sub)], Self::multiplicative)
    }

    fn multiplicative(&mut self) -> Result<DerivedExpr, String> {
        self.binary_level(
            &[("*", DerivedOp::Mul), ("/", DerivedOp::Div), ("%", DerivedOp::Rem)],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<DerivedExpr, String> {
        match self.peek_op() {
            Some("!") => {
                self.pos += 1;
                Ok(DerivedExpr::Not {
                    expr: Box::new(self.unary()?),
                })
            }
            Some("-") => {
                self.pos += 1;
                Ok(DerivedExpr::Neg {
                    expr: Box::new(self.unary()?),
                })
            }
            // `*p` dereferences the closure parameter.
            Some("*") => {
                self.pos += 1;
                match self.tokens.get(self.pos) {
                    Some(Token::Ident(name)) if name == self.param => {
                        self.pos += 1;
                        Ok(DerivedExpr::Param)
                    }
                    _ => Err("`*` may only dereference the closure parameter".into()),
                }
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<DerivedExpr, String> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        match token {
            Some(Token::Number(n)) => Ok(DerivedExpr::Literal { value: number(n) }),
            Some(Token::Str(s)) => Ok(DerivedExpr::Literal {
                value: Value::String(s),
            }),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(DerivedExpr::Literal { value: Value::Bool(true) }),
                "false" => Ok(DerivedExpr::Literal { value: Value::Bool(false) }),
                "null" | "None" => Ok(DerivedExpr::Literal { value: Value::Null }),
                n if n == self.param => Ok(DerivedExpr::Param),
                other => Err(format!(
                    "`{}` is not available; a derived value can only read `{}`",
                    other, self.param
                )),
            },
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err("missing `)`".into()),
                }
            }
            Some(Token::RParen) => Err("unexpected `)`".into()),
            Some(Token::Op(op)) => Err(format!("unexpected `{}`", op)),
            None => Err("unexpected end of expression".into()),
        }
    }
}

pub fn parse_derived_expr(src: &str, param: &str) -> Result<DerivedExpr, String> {
    let tokens = tokenize_derived(src)?;
    let mut parser = DerivedParser {
        tokens,
        pos: 0,
        param,
    };
    let expr = parser.or()?;
    if parser.pos < parser.tokens.len() {
        return Err(format!("unexpected trailing input in `{}`", src.trim()));
    }
    Ok(expr)
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCRIPT PARSING
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IslandScript {
    pub state: Vec<StateEntry>,
    pub derived: Vec<DerivedEntry>,
}

/// Split on newlines and `;`, ignoring separators inside quotes and dropping
/// `//` comments.
fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    for line in script.lines() {
        let mut current = String::new();
        let mut quote: Option<char> = None;
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            match quote {
                Some(q) => {
                    current.push(c);
                    if c == '\\' {
                        if let Some(next) = chars.next() {
                            current.push(next);
                        }
                    } else if c == q {
                        quote = None;
                    }
                }
                None => match c {
                    '"' | '\'' => {
                        quote = Some(c);
                        current.push(c);
                    }
                    '/' if chars.peek() == Some(&'/') => break,
                    ';' => statements.push(std::mem::take(&mut current)),
                    _ => current.push(c),
                },
            }
        }
        statements.push(current);
    }
    statements
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// A literal operand or initial value: scalars, with an optional sign.
fn parse_scalar_literal(src: &str) -> Option<Value> {
    let src = src.trim();
    if let Some(rest) = src.strip_prefix('-') {
        return parse_literal(rest)?.as_f64().map(|n| number(-n));
    }
    match parse_literal(src) {
        Some(Value::Array(_) | Value::Object(_)) => None,
        other => other,
    }
}

/// Every name declared with `let`, whether or not the statement is valid.
pub fn declared_names(script: &str) -> HashSet<String> {
    split_statements(script)
        .iter()
        .filter_map(|s| DECLARED_NAME.captures(s).map(|c| c[1].to_string()))
        .collect()
}

pub fn parse_island_script(script: &str) -> Result<IslandScript, Vec<String>> {
    let mut parsed = IslandScript::default();
    let mut errors = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for statement in split_statements(script) {
        if let Some(caps) = SIGNAL_DECL.captures(&statement) {
            let name = caps[1].to_string();
            if !seen.insert(name.clone()) {
                errors.push(format!("`{}` is declared more than once", name));
                continue;
            }
            match parse_scalar_literal(&caps[2]) {
                Some(initial) => parsed.state.push(StateEntry { name, initial }),
                None => errors.push(format!(
                    "initial value of `{}` must be a string, number, boolean or null literal",
                    name
                )),
            }
        } else if let Some(caps) = COMPUTED_DECL.captures(&statement) {
            let name = caps[1].to_string();
            let dependency = caps[2].to_string();
            let param = caps[3].to_string();
            if !seen.insert(name.clone()) {
                errors.push(format!("`{}` is declared more than once", name));
                continue;
            }
            let dependency_initial = parsed
                .state
                .iter()
                .find(|s| s.name == dependency)
                .map(|s| s.initial.clone())
                .or_else(|| {
                    parsed
                        .derived
                        .iter()
                        .find(|d| d.name == dependency)
                        .map(|d| d.initial.clone())
                });
            let Some(dependency_initial) = dependency_initial else {
                errors.push(format!(
                    "`{}` depends on `{}`, which is not declared before it",
                    name, dependency
                ));
                continue;
            };
            match parse_derived_expr(&caps[4], &param) {
                Ok(expr) => {
                    let initial = expr.evaluate(&dependency_initial);
                    parsed.derived.push(DerivedEntry {
                        name,
                        dependency,
                        param,
                        expr,
                        initial,
                    });
                }
                Err(reason) => errors.push(format!("derived value `{}`: {}", name, reason)),
            }
        } else {
            errors.push(format!("unsupported statement `{}`", statement));
        }
    }

    if errors.is_empty() {
        Ok(parsed)
    } else {
        Err(errors)
    }
}

/// Parse an event expression into a mutation.
pub fn parse_action(code: &str) -> Result<Mutation, String> {
    let code = code.trim().trim_end_matches(';').trim();
    if let Some(caps) = UPDATE_ACTION.captures(code) {
        if caps[2] != caps[3] {
            return Err(format!(
                "the update closure must mutate its parameter `{}`",
                &caps[2]
            ));
        }
        let op = match &caps[4] {
            "+=" => MutationOp::Increment,
            "-=" => MutationOp::Decrement,
            _ => MutationOp::Assign,
        };
        let operand = parse_scalar_literal(&caps[5])
            .ok_or_else(|| format!("`{}` is not a literal", caps[5].trim()))?;
        if op != MutationOp::Assign && operand.as_f64().is_none() && !operand.is_string() {
            return Err(format!("`{}` cannot be added or subtracted", operand));
        }
        return Ok(Mutation {
            target: caps[1].to_string(),
            op,
            operand,
        });
    }
    if let Some(caps) = SET_ACTION.captures(code) {
        let operand = parse_scalar_literal(&caps[2])
            .ok_or_else(|| format!("`{}` is not a literal", caps[2].trim()))?;
        return Ok(Mutation {
            target: caps[1].to_string(),
            op: MutationOp::Assign,
            operand,
        });
    }
    Err(format!("unsupported event expression `{}`", code))
}

// ═══════════════════════════════════════════════════════════════════════════════
// EXTRACTION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IslandOutput {
    pub nodes: Vec<TemplateNode>,
    pub modules: Vec<RuntimeModule>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Replace every island region with its marked-up wrapper (or an error
/// block) and collect the runtime modules in document order.
pub fn extract_islands(nodes: Vec<TemplateNode>, file: &str) -> IslandOutput {
    let mut extractor = Extractor {
        file: file.to_string(),
        next_id: 0,
        modules: Vec::new(),
        diagnostics: Vec::new(),
    };
    let nodes = extractor.walk(nodes);
    tracing::debug!(file = %file, islands = extractor.modules.len(), "islands extracted");
    IslandOutput {
        nodes,
        modules: extractor.modules,
        diagnostics: extractor.diagnostics,
    }
}

struct Extractor {
    file: String,
    next_id: usize,
    modules: Vec<RuntimeModule>,
    diagnostics: Vec<Diagnostic>,
}

struct IslandRewrite<'m> {
    module: &'m mut RuntimeModule,
    errors: Vec<(String, SourceLocation)>,
}

impl Extractor {
    fn walk(&mut self, nodes: Vec<TemplateNode>) -> Vec<TemplateNode> {
        nodes
            .into_iter()
            .map(|node| match node {
                TemplateNode::Island(island) => self.extract(island),
                mut other => {
                    for list in other.child_lists_mut() {
                        let children = std::mem::take(list);
                        *list = self.walk(children);
                    }
                    other
                }
            })
            .collect()
    }

    fn extract(&mut self, island: IslandNode) -> TemplateNode {
        let id = format!("i{}", self.next_id);
        self.next_id += 1;

        let script = match parse_island_script(&island.script) {
            Ok(script) => script,
            Err(errors) => {
                let errors = errors.into_iter().map(|e| (e, island.location.clone())).collect();
                return self.fail(&id, errors, &island.location);
            }
        };

        let mut module = RuntimeModule {
            id: id.clone(),
            strategy: island.strategy.clone(),
            state: script.state,
            derived: script.derived,
            actions: Vec::new(),
        };
        let mut rewrite = IslandRewrite {
            module: &mut module,
            errors: Vec::new(),
        };
        let children = rewrite.rewrite_nodes(island.children);
        if !rewrite.errors.is_empty() {
            let errors = rewrite.errors;
            return self.fail(&id, errors, &island.location);
        }

        let mut attributes = vec![
            AttributeIR::new("data-ncl-island", AttributeValue::Static(id)),
            AttributeIR::new(
                "data-ncl-hydrate",
                AttributeValue::Static(island.strategy.as_str().to_string()),
            ),
        ];
        if let HydrationStrategy::Media(query) = &island.strategy {
            attributes.push(AttributeIR::new(
                "data-ncl-media",
                AttributeValue::Static(query.clone()),
            ));
        }
        self.modules.push(module);
        TemplateNode::Element(ElementNode {
            tag: "div".to_string(),
            attributes,
            children,
            self_closing: false,
            location: island.location,
        })
    }

    fn fail(&mut self, id: &str, errors: Vec<(String, SourceLocation)>, location: &SourceLocation) -> TemplateNode {
        for (message, at) in &errors {
            self.diagnostics.push(
                Diagnostic::error(
                    Stage::Islands,
                    ErrorKind::IslandParse,
                    format!("Island {}: {}.", id, message),
                )
                .at(&self.file, at),
            );
        }
        let summary = errors
            .iter()
            .map(|(m, _)| m.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        TemplateNode::error(ErrorKind::IslandParse, summary, location.clone())
    }
}

impl IslandRewrite<'_> {
    fn rewrite_nodes(&mut self, nodes: Vec<TemplateNode>) -> Vec<TemplateNode> {
        nodes.into_iter().map(|node| self.rewrite_node(node)).collect()
    }

    fn rewrite_node(&mut self, node: TemplateNode) -> TemplateNode {
        match node {
            TemplateNode::Expression(e) => {
                let name = e.code.trim();
                if BARE_NAME.is_match(name) {
                    if let Some(initial) = self.module.initial_value(name) {
                        return binding_marker(name, initial, &e.location);
                    }
                }
                self.errors.push((
                    format!("only a bare state or derived name can be bound, found `{}`", name),
                    e.location.clone(),
                ));
                TemplateNode::Expression(e)
            }
            TemplateNode::Element(mut el) => {
                let mut action_ids = Vec::new();
                let mut attributes = Vec::with_capacity(el.attributes.len());
                for attr in std::mem::take(&mut el.attributes) {
                    let is_event = attr.name.len() > 2 && attr.name.to_ascii_lowercase().starts_with("on");
                    if !is_event {
                        if let AttributeValue::Interpolated(_) | AttributeValue::Expression(_) = attr.value {
                            self.errors.push((
                                format!("attribute `{}` cannot bind island state", attr.name),
                                attr.location.clone(),
                            ));
                        }
                        attributes.push(attr);
                        continue;
                    }
                    let code = match &attr.value {
                        AttributeValue::Static(text) => unescape_html(text),
                        AttributeValue::Expression(code) => code.clone(),
                        _ => {
                            self.errors.push((
                                format!("event attribute `{}` needs an expression", attr.name),
                                attr.location.clone(),
                            ));
                            continue;
                        }
                    };
                    match self.bind_action(&attr.name[2..], &code) {
                        Ok(id) => action_ids.push(id),
                        Err(message) => self.errors.push((message, attr.location.clone())),
                    }
                }
                if !action_ids.is_empty() {
                    attributes.push(AttributeIR::new(
                        "data-ncl-action",
                        AttributeValue::Static(action_ids.join(" ")),
                    ));
                }
                el.attributes = attributes;
                el.children = self.rewrite_nodes(el.children);
                TemplateNode::Element(el)
            }
            TemplateNode::Island(inner) => {
                self.errors.push(("islands cannot be nested".to_string(), inner.location.clone()));
                TemplateNode::Island(inner)
            }
            mut other => {
                for list in other.child_lists_mut() {
                    let children = std::mem::take(list);
                    *list = self.rewrite_nodes(children);
                }
                other
            }
        }
    }

    fn bind_action(&mut self, event: &str, code: &str) -> Result<String, String> {
        let mutation = parse_action(code)?;
        if self.module.is_derived(&mutation.target) {
            return Err(format!("derived value `{}` cannot be mutated", mutation.target));
        }
        if !self.module.is_state(&mutation.target) {
            return Err(format!("`{}` is not a declared state", mutation.target));
        }
        let id = format!("{}a{}", self.module.id, self.module.actions.len());
        self.module.actions.push(ActionBinding {
            id: id.clone(),
            event: event.to_ascii_lowercase(),
            mutation,
        });
        Ok(id)
    }
}

fn binding_marker(name: &str, initial: &Value, location: &SourceLocation) -> TemplateNode {
    TemplateNode::Element(ElementNode {
        tag: "span".to_string(),
        attributes: vec![AttributeIR::new(
            "data-ncl-bind",
            AttributeValue::Static(name.to_string()),
        )],
        children: vec![TemplateNode::Text(TextNode {
            value: escape_html(&display_value(initial)),
            location: location.clone(),
        })],
        self_closing: false,
        location: location.clone(),
    })
}

/// Text shown for a state value, matching the generated runtime.
pub fn display_value(value: &Value) -> String {
    render_scalar(value).unwrap_or_else(|| value.to_string())
}

// ═══════════════════════════════════════════════════════════════════════════════
// NATIVE HYDRATION
// ═══════════════════════════════════════════════════════════════════════════════

/// In-process model of the generated runtime: the same state map, listener
/// table and update routine, without a DOM.
#[derive(Debug, Clone)]
pub struct HydratedIsland {
    module: RuntimeModule,
    state: BTreeMap<String, Value>,
    listeners: BTreeMap<String, ActionBinding>,
}

impl HydratedIsland {
    pub fn new(module: RuntimeModule) -> Self {
        let state = module
            .state
            .iter()
            .map(|s| (s.name.clone(), s.initial.clone()))
            .collect();
        Self {
            module,
            state,
            listeners: BTreeMap::new(),
        }
    }

    /// Registers every action listener not yet registered. Returns how many
    /// were added; attaching again adds none.
    pub fn attach(&mut self) -> usize {
        let mut added = 0;
        for action in &self.module.actions {
            if !self.listeners.contains_key(&action.id) {
                self.listeners.insert(action.id.clone(), action.clone());
                added += 1;
            }
        }
        added
    }

    pub fn is_attached(&self) -> bool {
        !self.module.actions.is_empty() && self.listeners.len() == self.module.actions.len()
    }

    /// Fire the listener for `action_id`. Returns false if none is attached.
    pub fn dispatch(&mut self, action_id: &str) -> bool {
        let Some(action) = self.listeners.get(action_id) else {
            return false;
        };
        let target = action.mutation.target.clone();
        let current = self.state.get(&target).cloned().unwrap_or(Value::Null);
        let next = action.mutation.apply(&current);
        self.state.insert(target, next);
        true
    }

    /// Current value of a state or derived name.
    pub fn value(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.state.get(name) {
            return Some(value.clone());
        }
        let entry = self.module.derived.iter().find(|d| d.name == name)?;
        let dependency = self.value(&entry.dependency)?;
        Some(entry.expr.evaluate(&dependency))
    }

    /// Text of every binding marker, keyed by name.
    pub fn render_bindings(&self) -> BTreeMap<String, String> {
        self.module
            .state
            .iter()
            .map(|s| s.name.as_str())
            .chain(self.module.derived.iter().map(|d| d.name.as_str()))
            .filter_map(|name| self.value(name).map(|v| (name.to_string(), display_value(&v))))
            .collect()
    }

    pub fn module(&self) -> &RuntimeModule {
        &self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_template;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn island(src: &str) -> IslandOutput {
        let parsed = parse_template(src, "page.ncl");
        assert!(parsed.diagnostics.is_empty(), "{:?}", parsed.diagnostics);
        extract_islands(parsed.nodes, "page.ncl")
    }

    #[test]
    fn test_parse_island_script() {
        let script = parse_island_script(
            "let count = Signal(0);\nlet label = Signal(\"a;b\") // trailing\nlet double = computed(count, |c| *c * 2)",
        )
        .unwrap();
        assert_eq!(script.state.len(), 2);
        assert_eq!(script.state[1].initial, json!("a;b"));
        assert_eq!(script.derived[0].dependency, "count");
        assert_eq!(script.derived[0].initial, json!(0));
    }

    #[test]
    fn test_mut_declarations() {
        let script = parse_island_script(
            "let mut count = Signal(2)\nlet mut double = computed(count, |c| *c * 2)",
        )
        .unwrap();
        assert_eq!(script.state.len(), 1);
        assert_eq!(script.derived.len(), 1);
        assert_eq!(script.derived[0].name, "double");
        assert_eq!(script.derived[0].initial, json!(4));
        assert!(declared_names("let mut double = computed(count, |c| *c * 2)").contains("double"));
    }

    #[test]
    fn test_script_errors() {
        let errors = parse_island_script(
            "let a = Signal(1)\nlet a = Signal(2)\nlet b = computed(zzz, |p| p)\nfetch('/api')\nlet c = computed(a, |p| other + 1)",
        )
        .unwrap_err();
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_parse_action() {
        assert_eq!(
            parse_action("count.update(|p| *p += 1)").unwrap(),
            Mutation {
                target: "count".into(),
                op: MutationOp::Increment,
                operand: json!(1)
            }
        );
        assert_eq!(parse_action("count.update(|n| *n -= 2);").unwrap().op, MutationOp::Decrement);
        assert_eq!(parse_action("name.set('Ada')").unwrap().operand, json!("Ada"));
        assert_eq!(parse_action("count.update(|p| *p = -1)").unwrap().operand, json!(-1));
        assert!(parse_action("count.update(|p| *q += 1)").is_err());
        assert!(parse_action("alert('hi')").is_err());
    }

    #[test]
    fn test_derived_expressions() {
        let expr = parse_derived_expr("(*p + 1) * 2 >= 6 && !false", "p").unwrap();
        assert_eq!(expr.evaluate(&json!(2)), json!(true));
        assert_eq!(expr.evaluate(&json!(1)), json!(false));
        let label = parse_derived_expr("\"n=\" + p", "p").unwrap();
        assert_eq!(label.evaluate(&json!(3)), json!("n=3"));
        assert!(parse_derived_expr("window.alert(p)", "p").is_err());
    }

    #[test]
    fn test_extract_markers() {
        let out = island(
            r#"<n:island client:visible><script>let count = Signal(0)
let double = computed(count, |c| *c * 2)</script><button onclick="count.update(|p| *p += 1)">{count}</button><i>{double}</i></n:island>"#,
        );
        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
        assert_eq!(out.modules.len(), 1);
        let module = &out.modules[0];
        assert_eq!(module.id, "i0");
        assert_eq!(module.actions[0].id, "i0a0");
        assert_eq!(module.actions[0].event, "click");
        assert_eq!(module.actions[0].mutation.to_string(), "count:+=:1");

        let TemplateNode::Element(wrapper) = &out.nodes[0] else {
            panic!("expected wrapper");
        };
        assert_eq!(wrapper.static_attribute("data-ncl-hydrate"), Some("visible"));
        let TemplateNode::Element(button) = &wrapper.children[0] else {
            panic!("expected button");
        };
        assert_eq!(button.static_attribute("data-ncl-action"), Some("i0a0"));
        assert!(button.attribute("onclick").is_none());
        let TemplateNode::Element(span) = &button.children[0] else {
            panic!("expected binding marker");
        };
        assert_eq!(span.static_attribute("data-ncl-bind"), Some("count"));
    }

    #[test]
    fn test_invalid_island_renders_error_block() {
        let out = island(
            r#"<n:island client:load><script>let total = Signal(1)
let twice = computed(total, |t| t * 2)</script><button onclick="twice.set(3)">{total}</button></n:island>"#,
        );
        assert!(out.modules.is_empty());
        assert!(matches!(&out.nodes[0], TemplateNode::Error(e) if e.kind == ErrorKind::IslandParse));
        assert_eq!(out.diagnostics.len(), 1);
        assert!(out.diagnostics[0].message.contains("cannot be mutated"));
    }

    #[test]
    fn test_hydrated_island_is_monotonic() {
        let out = island(
            r#"<n:island client:load><script>let count = Signal(0)</script><button onclick="count.update(|p| *p += 1)">{count}</button></n:island>"#,
        );
        let mut hydrated = HydratedIsland::new(out.modules[0].clone());
        assert!(!hydrated.dispatch("i0a0"));
        assert_eq!(hydrated.attach(), 1);
        assert_eq!(hydrated.attach(), 0);
        assert!(hydrated.is_attached());

        assert_eq!(hydrated.render_bindings()["count"], "0");
        hydrated.dispatch("i0a0");
        assert_eq!(hydrated.render_bindings()["count"], "1");
        hydrated.dispatch("i0a0");
        assert_eq!(hydrated.value("count"), Some(json!(2)));
    }
}
