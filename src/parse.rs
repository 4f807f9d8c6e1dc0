//! Parse Module for the NCL Compiler
//!
//! Two passes: `Lexer` turns markup into tokens (tags, text, interpolations,
//! `{% %}` blocks, raw text) and `Parser` builds the `TemplateNode` tree by
//! recursive descent. Both are error tolerant: problems become diagnostics
//! and parsing continues.
//!
//! Raw-text elements (`script`, `style`, `n:props`) are never scanned for
//! directives, so `{`, `<for>` or `{% %}` inside them survive untouched.

use crate::static_eval::parse_expression;
use crate::validate::{
    AttributeIR, AttributeValue, CommentNode, ComponentNode, ConditionalBranch, ConditionalNode,
    Diagnostic, Dialect, DoctypeNode, ElementNode, ErrorKind, ExpressionNode, HydrationStrategy,
    IslandNode, LoopNode, SlotNode, SourceLocation, Stage, TemplateNode, TextNode, ValuePart,
};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref FOR_BLOCK: Regex =
        Regex::new(r"^for\s+([A-Za-z_][A-Za-z0-9_]*)\s+in\s+(.+)$").unwrap();
    static ref IF_BLOCK: Regex = Regex::new(r"^if\s+(.+)$").unwrap();
    static ref ELIF_BLOCK: Regex = Regex::new(r"^(?:elif|else\s+if)\s+(.+)$").unwrap();
}

pub const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "n:props"];

pub fn is_void_element(tag: &str) -> bool {
    VOID_ELEMENTS.iter().any(|v| v.eq_ignore_ascii_case(tag))
}

/// PascalCase tags (`Card`, `Card.Header`) are component usages.
pub fn is_component_tag(tag: &str) -> bool {
    tag.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTemplate {
    pub nodes: Vec<TemplateNode>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Parse a template document into nodes plus diagnostics.
pub fn parse_template(source: &str, file: &str) -> ParsedTemplate {
    let mut lexer = Lexer::new(source, file);
    lexer.run();
    let Lexer {
        tokens,
        diagnostics,
        ..
    } = lexer;

    let mut parser = Parser {
        tokens,
        pos: 0,
        open: Vec::new(),
        diagnostics,
        file: file.to_string(),
    };
    let (nodes, stop) = parser.parse_nodes(&[]);
    if let Stop::Block(tag, loc) = stop {
        parser.unexpected_block(&tag, &loc);
    }

    ParsedTemplate {
        nodes,
        diagnostics: parser.diagnostics,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TOKENS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
enum RawValue {
    Text(String),
    Brace(String),
}

#[derive(Debug, Clone, PartialEq)]
struct RawAttribute {
    name: String,
    value: Option<RawValue>,
    location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
enum BlockTag {
    For { item: String, source: String },
    If(String),
    Elif(String),
    Else,
    EndFor,
    EndIf,
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Elif,
    Else,
    EndFor,
    EndIf,
}

impl BlockTag {
    fn kind(&self) -> Option<BlockKind> {
        match self {
            BlockTag::Elif(_) => Some(BlockKind::Elif),
            BlockTag::Else => Some(BlockKind::Else),
            BlockTag::EndFor => Some(BlockKind::EndFor),
            BlockTag::EndIf => Some(BlockKind::EndIf),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            BlockTag::For { item, source } => format!("{{% for {} in {} %}}", item, source),
            BlockTag::If(c) => format!("{{% if {} %}}", c),
            BlockTag::Elif(c) => format!("{{% elif {} %}}", c),
            BlockTag::Else => "{% else %}".to_string(),
            BlockTag::EndFor => "{% endfor %}".to_string(),
            BlockTag::EndIf => "{% endif %}".to_string(),
            BlockTag::Invalid(raw) => format!("{{% {} %}}", raw),
        }
    }
}

fn parse_block(inner: &str) -> BlockTag {
    let inner = inner.trim();
    match inner {
        "else" => return BlockTag::Else,
        "endfor" | "end for" => return BlockTag::EndFor,
        "endif" | "end if" => return BlockTag::EndIf,
        _ => {}
    }
    if let Some(caps) = FOR_BLOCK.captures(inner) {
        return BlockTag::For {
            item: caps[1].to_string(),
            source: caps[2].trim().to_string(),
        };
    }
    if let Some(caps) = ELIF_BLOCK.captures(inner) {
        return BlockTag::Elif(caps[1].trim().to_string());
    }
    if let Some(caps) = IF_BLOCK.captures(inner) {
        return BlockTag::If(caps[1].trim().to_string());
    }
    BlockTag::Invalid(inner.to_string())
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Text(String),
    Interpolation { code: String, raw: String },
    OpenTag {
        name: String,
        attributes: Vec<RawAttribute>,
        self_closing: bool,
    },
    CloseTag(String),
    Comment(String),
    Doctype(String),
    Block(BlockTag),
    RawText(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    location: SourceLocation,
}

// ═══════════════════════════════════════════════════════════════════════════════
// LEXER
// ═══════════════════════════════════════════════════════════════════════════════

struct Lexer<'s> {
    src: &'s str,
    pos: usize,
    line: u32,
    column: u32,
    tokens: Vec<Token>,
    text: String,
    text_start: SourceLocation,
    diagnostics: Vec<Diagnostic>,
    file: String,
}

impl<'s> Lexer<'s> {
    fn new(src: &'s str, file: &str) -> Self {
        Lexer {
            src,
            pos: 0,
            line: 1,
            column: 1,
            tokens: Vec::new(),
            text: String::new(),
            text_start: SourceLocation::new(1, 1),
            diagnostics: Vec::new(),
            file: file.to_string(),
        }
    }

    fn rest(&self) -> &'s str {
        &self.src[self.pos..]
    }

    fn loc(&self) -> SourceLocation {
        SourceLocation::new(self.line, self.column)
    }

    fn advance(&mut self, bytes: usize) {
        let end = (self.pos + bytes).min(self.src.len());
        for ch in self.src[self.pos..end].chars() {
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        self.pos = end;
    }

    fn save(&self) -> (usize, u32, u32) {
        (self.pos, self.line, self.column)
    }

    fn restore(&mut self, saved: (usize, u32, u32)) {
        self.pos = saved.0;
        self.line = saved.1;
        self.column = saved.2;
    }

    fn push_text(&mut self, text: &str) {
        if self.text.is_empty() {
            self.text_start = self.loc();
        }
        self.text.push_str(text);
    }

    fn flush_text(&mut self) {
        if !self.text.is_empty() {
            let value = std::mem::take(&mut self.text);
            self.tokens.push(Token {
                kind: TokenKind::Text(value),
                location: self.text_start.clone(),
            });
        }
    }

    fn emit(&mut self, kind: TokenKind, location: SourceLocation) {
        self.flush_text();
        self.tokens.push(Token { kind, location });
    }

    fn diagnose(&mut self, kind: ErrorKind, message: String, location: &SourceLocation) {
        self.diagnostics
            .push(Diagnostic::error(Stage::Parse, kind, message).at(&self.file, location));
    }

    fn run(&mut self) {
        while self.pos < self.src.len() {
            let rest = self.rest();
            let next_char = rest.chars().nth(1);

            if rest.starts_with("<!--") {
                self.lex_comment();
            } else if rest.starts_with("<!") {
                self.lex_doctype();
            } else if rest.starts_with("</") && rest[2..].starts_with(|c: char| c.is_ascii_alphabetic()) {
                self.lex_close_tag();
            } else if rest.starts_with('<') && next_char.is_some_and(|c| c.is_ascii_alphabetic()) {
                if !self.lex_open_tag() {
                    self.push_text("<");
                    self.advance(1);
                }
            } else if rest.starts_with("{{") {
                self.lex_double_brace();
            } else if rest.starts_with("{%") {
                self.lex_block();
            } else if rest.starts_with('{') {
                self.lex_single_brace();
            } else {
                let first = rest.chars().next().map(char::len_utf8).unwrap_or(1);
                let end = rest[first..]
                    .find(['<', '{'])
                    .map(|i| i + first)
                    .unwrap_or(rest.len());
                self.push_text(&rest[..end]);
                self.advance(end);
            }
        }
        self.flush_text();
    }

    fn lex_comment(&mut self) {
        let loc = self.loc();
        let rest = self.rest();
        match rest[4..].find("-->") {
            Some(end) => {
                let value = rest[4..4 + end].to_string();
                self.advance(4 + end + 3);
                self.emit(TokenKind::Comment(value), loc);
            }
            None => {
                self.diagnose(
                    ErrorKind::StructuralDirective,
                    "Unterminated comment.".to_string(),
                    &loc,
                );
                let value = rest[4..].to_string();
                self.advance(rest.len());
                self.emit(TokenKind::Comment(value), loc);
            }
        }
    }

    fn lex_doctype(&mut self) {
        let loc = self.loc();
        let rest = self.rest();
        let end = rest.find('>').map(|i| i + 1).unwrap_or(rest.len());
        let value = rest[2..end].trim_end_matches('>').trim().to_string();
        self.advance(end);
        self.emit(TokenKind::Doctype(value), loc);
    }

    fn lex_close_tag(&mut self) {
        let loc = self.loc();
        let rest = self.rest();
        let end = rest.find('>').map(|i| i + 1).unwrap_or(rest.len());
        let name = rest[2..end].trim_end_matches('>').trim().to_string();
        self.advance(end);
        self.emit(TokenKind::CloseTag(name), loc);
    }

    /// Returns false (without consuming) when the tag is malformed.
    fn lex_open_tag(&mut self) -> bool {
        let saved = self.save();
        let loc = self.loc();
        self.advance(1);

        let name_len = self
            .rest()
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(self.rest().len());
        let name = self.rest()[..name_len].to_string();
        self.advance(name_len);

        let mut attributes = Vec::new();
        let self_closing;
        loop {
            let ws = self.rest().len() - self.rest().trim_start().len();
            self.advance(ws);
            let rest = self.rest();
            if rest.is_empty() {
                self.restore(saved);
                return false;
            }
            if rest.starts_with("/>") {
                self.advance(2);
                self_closing = true;
                break;
            }
            if rest.starts_with('>') {
                self.advance(1);
                self_closing = false;
                break;
            }

            let attr_loc = self.loc();
            let attr_len = rest
                .find(|c: char| c.is_whitespace() || c == '=' || c == '>' || c == '/' || c == '"' || c == '\'')
                .unwrap_or(rest.len());
            if attr_len == 0 {
                // stray `/`, quote or `=`
                let width = rest.chars().next().map(char::len_utf8).unwrap_or(1);
                self.advance(width);
                continue;
            }
            let attr_name = rest[..attr_len].to_string();
            self.advance(attr_len);

            let ws = self.rest().len() - self.rest().trim_start().len();
            let after_ws = &self.rest()[ws..];
            if !after_ws.starts_with('=') {
                attributes.push(RawAttribute {
                    name: attr_name,
                    value: None,
                    location: attr_loc,
                });
                continue;
            }
            self.advance(ws + 1);
            let ws = self.rest().len() - self.rest().trim_start().len();
            self.advance(ws);

            let rest = self.rest();
            let value = if rest.starts_with('"') || rest.starts_with('\'') {
                let quote = &rest[..1];
                match rest[1..].find(quote) {
                    Some(end) => {
                        let value = rest[1..1 + end].to_string();
                        self.advance(end + 2);
                        RawValue::Text(value)
                    }
                    None => {
                        self.restore(saved);
                        return false;
                    }
                }
            } else if rest.starts_with('{') {
                match find_balanced_brace_end(rest) {
                    Some(end) => {
                        let code = rest[1..end].trim().to_string();
                        self.advance(end + 1);
                        RawValue::Brace(code)
                    }
                    None => {
                        self.restore(saved);
                        return false;
                    }
                }
            } else {
                let end = rest
                    .find(|c: char| c.is_whitespace() || c == '>')
                    .unwrap_or(rest.len());
                let value = rest[..end].trim_end_matches('/').to_string();
                let consumed = if rest[..end].ends_with('/') && rest[end..].starts_with('>') {
                    end - 1
                } else {
                    end
                };
                self.advance(consumed);
                RawValue::Text(value)
            };
            attributes.push(RawAttribute {
                name: attr_name,
                value: Some(value),
                location: attr_loc,
            });
        }

        let is_raw = !self_closing && RAW_TEXT_ELEMENTS.iter().any(|r| r.eq_ignore_ascii_case(&name));
        self.emit(
            TokenKind::OpenTag {
                name: name.clone(),
                attributes,
                self_closing,
            },
            loc,
        );

        if is_raw {
            self.lex_raw_text(&name);
        }
        true
    }

    fn lex_raw_text(&mut self, name: &str) {
        let loc = self.loc();
        let rest = self.rest();
        let needle = format!("</{}", name.to_ascii_lowercase());
        let end = rest.to_ascii_lowercase().find(&needle);
        let content_end = match end {
            Some(end) => end,
            None => {
                self.diagnose(
                    ErrorKind::StructuralDirective,
                    format!("Unclosed <{}> block.", name),
                    &loc,
                );
                rest.len()
            }
        };
        let content = rest[..content_end].to_string();
        self.advance(content_end);
        if !content.is_empty() {
            self.emit(TokenKind::RawText(content), loc);
        }
    }

    fn lex_double_brace(&mut self) {
        let loc = self.loc();
        let rest = self.rest();
        match rest[2..].find("}}") {
            Some(end) => {
                let raw = rest[..end + 4].to_string();
                let code = rest[2..2 + end].trim().to_string();
                self.advance(end + 4);
                self.emit(TokenKind::Interpolation { code, raw }, loc);
            }
            None => {
                self.diagnose(
                    ErrorKind::InvalidExpression,
                    "Unterminated `{{` interpolation.".to_string(),
                    &loc,
                );
                self.push_text("{{");
                self.advance(2);
            }
        }
    }

    fn lex_block(&mut self) {
        let loc = self.loc();
        let rest = self.rest();
        match rest[2..].find("%}") {
            Some(end) => {
                let block = parse_block(&rest[2..2 + end]);
                self.advance(end + 4);
                self.emit(TokenKind::Block(block), loc);
            }
            None => {
                self.diagnose(
                    ErrorKind::ControlFlowSyntax,
                    "Unterminated `{%` block tag.".to_string(),
                    &loc,
                );
                self.push_text("{%");
                self.advance(2);
            }
        }
    }

    /// `{ expr }` is an interpolation only if it holds a valid expression.
    fn lex_single_brace(&mut self) {
        let loc = self.loc();
        let rest = self.rest();
        if let Some(end) = find_balanced_brace_end(rest) {
            let inner = &rest[1..end];
            if !inner.contains('\n') && parse_expression(inner).is_ok() {
                let raw = rest[..end + 1].to_string();
                let code = inner.trim().to_string();
                self.advance(end + 1);
                self.emit(TokenKind::Interpolation { code, raw }, loc);
                return;
            }
        }
        self.push_text("{");
        self.advance(1);
    }
}

/// Byte index of the `}` matching the `{` at index 0, skipping quoted strings.
fn find_balanced_brace_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => quote = Some(c),
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split attribute text into literal and `{expr}` / `{{ expr }}` parts.
pub fn split_interpolations(text: &str) -> Vec<ValuePart> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut rest = text;

    while let Some(start) = rest.find('{') {
        literal.push_str(&rest[..start]);
        let candidate = &rest[start..];
        let found = if let Some(inner) = candidate.strip_prefix("{{") {
            inner.find("}}").map(|end| (inner[..end].trim().to_string(), end + 4))
        } else {
            find_balanced_brace_end(candidate).and_then(|end| {
                let inner = &candidate[1..end];
                parse_expression(inner)
                    .ok()
                    .map(|_| (inner.trim().to_string(), end + 1))
            })
        };
        match found {
            Some((code, consumed)) => {
                if !literal.is_empty() {
                    parts.push(ValuePart::Text(std::mem::take(&mut literal)));
                }
                parts.push(ValuePart::Expression(code));
                rest = &candidate[consumed..];
            }
            None => {
                literal.push('{');
                rest = &candidate[1..];
            }
        }
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        parts.push(ValuePart::Text(literal));
    }
    parts
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARSER
// ═══════════════════════════════════════════════════════════════════════════════

enum Stop {
    Eof,
    /// A close tag for an open ancestor; left unconsumed.
    Close,
    Block(BlockTag, SourceLocation),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    open: Vec<String>,
    diagnostics: Vec<Diagnostic>,
    file: String,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn diagnose(&mut self, kind: ErrorKind, message: String, location: &SourceLocation) {
        self.diagnostics
            .push(Diagnostic::error(Stage::Parse, kind, message).at(&self.file, location));
    }

    fn unexpected_block(&mut self, tag: &BlockTag, loc: &SourceLocation) {
        let message = match tag {
            BlockTag::Invalid(raw) => format!("Unrecognized block tag `{{% {} %}}`.", raw),
            other => format!("Unexpected {}.", other.describe()),
        };
        self.diagnose(ErrorKind::ControlFlowSyntax, message, loc);
    }

    fn parse_nodes(&mut self, terminators: &[BlockKind]) -> (Vec<TemplateNode>, Stop) {
        let mut nodes = Vec::new();

        while let Some(token) = self.tokens.get(self.pos).cloned() {
            let Token { kind, location } = token;
            match kind {
                TokenKind::Text(value) | TokenKind::RawText(value) => {
                    self.pos += 1;
                    nodes.push(TemplateNode::Text(TextNode { value, location }));
                }
                TokenKind::Interpolation { code, raw } => {
                    self.pos += 1;
                    nodes.push(TemplateNode::Expression(ExpressionNode {
                        code,
                        raw,
                        location,
                    }));
                }
                TokenKind::Comment(value) => {
                    self.pos += 1;
                    nodes.push(TemplateNode::Comment(CommentNode { value, location }));
                }
                TokenKind::Doctype(value) => {
                    self.pos += 1;
                    nodes.push(TemplateNode::Doctype(DoctypeNode { value, location }));
                }
                TokenKind::CloseTag(name) => {
                    if self.open.iter().any(|o| o.eq_ignore_ascii_case(&name)) {
                        return (nodes, Stop::Close);
                    }
                    self.pos += 1;
                    self.diagnostics.push(
                        Diagnostic::warning(
                            Stage::Parse,
                            ErrorKind::StructuralDirective,
                            format!("Stray closing tag </{}>.", name),
                        )
                        .at(&self.file, &location),
                    );
                }
                TokenKind::OpenTag {
                    name,
                    attributes,
                    self_closing,
                } => {
                    self.pos += 1;
                    let node = self.parse_tag(name, attributes, self_closing, location);
                    nodes.push(node);
                }
                TokenKind::Block(tag) => {
                    self.pos += 1;
                    if tag.kind().is_some_and(|k| terminators.contains(&k)) {
                        return (nodes, Stop::Block(tag, location));
                    }
                    match tag {
                        BlockTag::For { item, source } => {
                            nodes.push(self.parse_block_loop(item, source, location));
                        }
                        BlockTag::If(condition) => {
                            nodes.push(self.parse_block_conditional(condition, location));
                        }
                        other => self.unexpected_block(&other, &location),
                    }
                }
            }
        }

        (nodes, Stop::Eof)
    }

    fn parse_block_loop(&mut self, item: String, source: String, location: SourceLocation) -> TemplateNode {
        let (body, stop) = self.parse_nodes(&[BlockKind::EndFor]);
        if !matches!(stop, Stop::Block(BlockTag::EndFor, _)) {
            self.diagnose(
                ErrorKind::ControlFlowSyntax,
                format!("`{{% for {} in {} %}}` is missing `{{% endfor %}}`.", item, source),
                &location,
            );
        }
        TemplateNode::Loop(LoopNode {
            item,
            source,
            body,
            dialect: Dialect::Delimiter,
            location,
        })
    }

    fn parse_block_conditional(&mut self, condition: String, location: SourceLocation) -> TemplateNode {
        let mut branches = Vec::new();
        let mut alternate = None;
        let mut condition = condition;

        loop {
            let (body, stop) =
                self.parse_nodes(&[BlockKind::Elif, BlockKind::Else, BlockKind::EndIf]);
            branches.push(ConditionalBranch { condition, body });
            match stop {
                Stop::Block(BlockTag::Elif(next), _) => condition = next,
                Stop::Block(BlockTag::Else, _) => {
                    let (body, stop) = self.parse_nodes(&[BlockKind::EndIf]);
                    alternate = Some(body);
                    if !matches!(stop, Stop::Block(BlockTag::EndIf, _)) {
                        self.missing_endif(&location);
                    }
                    break;
                }
                Stop::Block(BlockTag::EndIf, _) => break,
                _ => {
                    self.missing_endif(&location);
                    break;
                }
            }
        }

        TemplateNode::Conditional(ConditionalNode {
            branches,
            alternate,
            dialect: Dialect::Delimiter,
            location,
        })
    }

    fn missing_endif(&mut self, location: &SourceLocation) {
        self.diagnose(
            ErrorKind::ControlFlowSyntax,
            "`{% if %}` is missing `{% endif %}`.".to_string(),
            location,
        );
    }

    /// Children of an open tag up to and including its close tag.
    fn parse_element_children(&mut self, name: &str, location: &SourceLocation) -> Vec<TemplateNode> {
        self.open.push(name.to_string());
        let (children, stop) = self.parse_nodes(&[]);
        self.open.pop();

        if let Stop::Block(tag, loc) = stop {
            self.unexpected_block(&tag, &loc);
        }

        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::CloseTag(close)) if close.eq_ignore_ascii_case(name) => {
                self.pos += 1;
            }
            _ => {
                self.diagnose(
                    ErrorKind::StructuralDirective,
                    format!("Unclosed <{}>.", name),
                    location,
                );
            }
        }
        children
    }

    fn parse_tag(
        &mut self,
        name: String,
        raw_attributes: Vec<RawAttribute>,
        self_closing: bool,
        location: SourceLocation,
    ) -> TemplateNode {
        let children = if self_closing || is_void_element(&name) {
            Vec::new()
        } else {
            self.parse_element_children(&name, &location)
        };
        let lower = name.to_ascii_lowercase();

        match lower.as_str() {
            "for" => self.build_tag_loop(&raw_attributes, children, location),
            "if" => {
                let node = self.build_tag_conditional(&raw_attributes, children, location);
                self.chain_tag_branches(node)
            }
            "elif" | "else" => {
                self.diagnose(
                    ErrorKind::ControlFlowSyntax,
                    format!("<{}> must directly follow an <if> or <elif>.", lower),
                    &location,
                );
                TemplateNode::error(
                    ErrorKind::ControlFlowSyntax,
                    format!("<{}> without a preceding <if>", lower),
                    location,
                )
            }
            "slot" | "n:slot" => TemplateNode::Slot(SlotNode {
                name: directive_value(&raw_attributes, "name").filter(|n| !n.is_empty()),
                fallback: children,
                location,
            }),
            "n:island" => build_island(&raw_attributes, children, location),
            _ if is_component_tag(&name) => TemplateNode::Component(ComponentNode {
                name,
                attributes: convert_attributes(raw_attributes),
                children,
                location,
            }),
            _ => TemplateNode::Element(ElementNode {
                tag: name,
                attributes: convert_attributes(raw_attributes),
                children,
                self_closing,
                location,
            }),
        }
    }

    fn build_tag_loop(
        &mut self,
        attributes: &[RawAttribute],
        body: Vec<TemplateNode>,
        location: SourceLocation,
    ) -> TemplateNode {
        let item = directive_value(attributes, "item");
        let source = directive_value(attributes, "in");
        match (item, source) {
            (Some(item), Some(source)) if !item.is_empty() && !source.is_empty() => {
                TemplateNode::Loop(LoopNode {
                    item,
                    source,
                    body,
                    dialect: Dialect::Tag,
                    location,
                })
            }
            _ => {
                let message = "<for> needs both `item` and `in` attributes.".to_string();
                self.diagnose(ErrorKind::ControlFlowSyntax, message.clone(), &location);
                TemplateNode::error(ErrorKind::ControlFlowSyntax, message, location)
            }
        }
    }

    fn build_tag_conditional(
        &mut self,
        attributes: &[RawAttribute],
        body: Vec<TemplateNode>,
        location: SourceLocation,
    ) -> TemplateNode {
        match directive_value(attributes, "condition") {
            Some(condition) if !condition.is_empty() => TemplateNode::Conditional(ConditionalNode {
                branches: vec![ConditionalBranch { condition, body }],
                alternate: None,
                dialect: Dialect::Tag,
                location,
            }),
            _ => {
                let message = "<if> needs a `condition` attribute.".to_string();
                self.diagnose(ErrorKind::ControlFlowSyntax, message.clone(), &location);
                TemplateNode::error(ErrorKind::ControlFlowSyntax, message, location)
            }
        }
    }

    /// Attach `<elif>`/`<else>` siblings (whitespace between them is dropped).
    fn chain_tag_branches(&mut self, node: TemplateNode) -> TemplateNode {
        let TemplateNode::Conditional(mut cond) = node else {
            return node;
        };

        loop {
            let saved = self.pos;
            while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Text(t)) if t.trim().is_empty())
            {
                self.pos += 1;
            }
            let Some(Token {
                kind:
                    TokenKind::OpenTag {
                        name,
                        attributes,
                        self_closing,
                    },
                location,
            }) = self.peek().cloned()
            else {
                self.pos = saved;
                break;
            };

            let lower = name.to_ascii_lowercase();
            if lower != "elif" && lower != "else" {
                self.pos = saved;
                break;
            }
            self.pos += 1;
            let body = if self_closing {
                Vec::new()
            } else {
                self.parse_element_children(&name, &location)
            };

            if lower == "else" {
                cond.alternate = Some(body);
                break;
            }
            match directive_value(&attributes, "condition") {
                Some(condition) if !condition.is_empty() => {
                    cond.branches.push(ConditionalBranch { condition, body });
                }
                _ => self.diagnose(
                    ErrorKind::ControlFlowSyntax,
                    "<elif> needs a `condition` attribute.".to_string(),
                    &location,
                ),
            }
        }

        TemplateNode::Conditional(cond)
    }
}

/// Value of a directive attribute: static text, `{expr}` or a lone `{{ expr }}`.
fn directive_value(attributes: &[RawAttribute], name: &str) -> Option<String> {
    let attr = attributes.iter().find(|a| a.name.eq_ignore_ascii_case(name))?;
    match &attr.value {
        Some(RawValue::Brace(code)) => Some(code.clone()),
        Some(RawValue::Text(text)) => match split_interpolations(text).as_slice() {
            [ValuePart::Expression(code)] => Some(code.clone()),
            _ => Some(text.trim().to_string()),
        },
        None => Some(String::new()),
    }
}

fn convert_attributes(raw: Vec<RawAttribute>) -> Vec<AttributeIR> {
    raw.into_iter()
        .map(|attr| {
            let value = match attr.value {
                None => AttributeValue::Boolean,
                Some(RawValue::Brace(code)) => AttributeValue::Expression(code),
                Some(RawValue::Text(text)) => {
                    let parts = split_interpolations(&text);
                    if parts.iter().any(|p| matches!(p, ValuePart::Expression(_))) {
                        AttributeValue::Interpolated(parts)
                    } else {
                        AttributeValue::Static(text)
                    }
                }
            };
            AttributeIR {
                name: attr.name,
                value,
                location: attr.location,
            }
        })
        .collect()
}

fn build_island(attributes: &[RawAttribute], children: Vec<TemplateNode>, location: SourceLocation) -> TemplateNode {
    let mut strategy = HydrationStrategy::Load;
    for attr in attributes {
        match attr.name.to_ascii_lowercase().as_str() {
            "client:load" => strategy = HydrationStrategy::Load,
            "client:visible" => strategy = HydrationStrategy::Visible,
            "client:idle" => strategy = HydrationStrategy::Idle,
            "client:media" => {
                let query = match &attr.value {
                    Some(RawValue::Text(q)) | Some(RawValue::Brace(q)) => q.clone(),
                    None => String::new(),
                };
                strategy = HydrationStrategy::Media(query);
            }
            _ => {}
        }
    }

    let mut script = None;
    let mut rest = Vec::with_capacity(children.len());
    for child in children {
        match child {
            TemplateNode::Element(el) if script.is_none() && el.tag.eq_ignore_ascii_case("script") => {
                let text: String = el
                    .children
                    .iter()
                    .filter_map(|c| match c {
                        TemplateNode::Text(t) => Some(t.value.as_str()),
                        _ => None,
                    })
                    .collect();
                script = Some(text);
            }
            other => rest.push(other),
        }
    }

    TemplateNode::Island(IslandNode {
        strategy,
        script: script.unwrap_or_default(),
        children: rest,
        location,
    })
}
