//! IR and Diagnostics for the NCL Compiler
//!
//! Every stage consumes and produces `TemplateNode` trees and reports problems
//! as `Diagnostic` records instead of failing. `verify_output` is the last
//! gate before rendering.

use crate::discovery::PropType;
use serde::{Deserialize, Serialize};
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const NCL_STRUCTURAL_DIRECTIVE: &str = "NCL001";
pub const NCL_MISSING_REQUIRED_PROP: &str = "NCL002";
pub const NCL_UNKNOWN_COMPONENT: &str = "NCL003";
pub const NCL_CIRCULAR_COMPONENT: &str = "NCL004";
pub const NCL_CONTROL_FLOW_SYNTAX: &str = "NCL005";
pub const NCL_INTERPOLATION_TARGET_MISSING: &str = "NCL006";
pub const NCL_ISLAND_PARSE: &str = "NCL007";
pub const NCL_INVALID_PROP_TYPE: &str = "NCL008";
pub const NCL_NON_SCALAR_INTERPOLATION: &str = "NCL009";
pub const NCL_INVALID_EXPRESSION: &str = "NCL010";
pub const NCL_SLOT_NOT_FOUND: &str = "NCL011";
pub const NCL_DUPLICATE_SLOT: &str = "NCL012";
pub const NCL_INVALID_PROP_DECLARATION: &str = "NCL013";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    StructuralDirective,
    MissingRequiredProp,
    UnknownComponent,
    CircularComponentDependency,
    ControlFlowSyntax,
    InterpolationTargetMissing,
    IslandParse,
    InvalidPropType,
    NonScalarInterpolation,
    InvalidExpression,
    SlotNotFound,
    DuplicateSlot,
    InvalidPropDeclaration,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::StructuralDirective => NCL_STRUCTURAL_DIRECTIVE,
            ErrorKind::MissingRequiredProp => NCL_MISSING_REQUIRED_PROP,
            ErrorKind::UnknownComponent => NCL_UNKNOWN_COMPONENT,
            ErrorKind::CircularComponentDependency => NCL_CIRCULAR_COMPONENT,
            ErrorKind::ControlFlowSyntax => NCL_CONTROL_FLOW_SYNTAX,
            ErrorKind::InterpolationTargetMissing => NCL_INTERPOLATION_TARGET_MISSING,
            ErrorKind::IslandParse => NCL_ISLAND_PARSE,
            ErrorKind::InvalidPropType => NCL_INVALID_PROP_TYPE,
            ErrorKind::NonScalarInterpolation => NCL_NON_SCALAR_INTERPOLATION,
            ErrorKind::InvalidExpression => NCL_INVALID_EXPRESSION,
            ErrorKind::SlotNotFound => NCL_SLOT_NOT_FOUND,
            ErrorKind::DuplicateSlot => NCL_DUPLICATE_SLOT,
            ErrorKind::InvalidPropDeclaration => NCL_INVALID_PROP_DECLARATION,
        }
    }

    /// Human-readable name, as shown in error blocks.
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::StructuralDirective => "StructuralDirectiveError",
            ErrorKind::MissingRequiredProp => "MissingRequiredPropError",
            ErrorKind::UnknownComponent => "UnknownComponentError",
            ErrorKind::CircularComponentDependency => "CircularComponentDependencyError",
            ErrorKind::ControlFlowSyntax => "ControlFlowSyntaxError",
            ErrorKind::InterpolationTargetMissing => "InterpolationTargetMissingError",
            ErrorKind::IslandParse => "IslandParseError",
            ErrorKind::InvalidPropType => "InvalidPropTypeError",
            ErrorKind::NonScalarInterpolation => "NonScalarInterpolationError",
            ErrorKind::InvalidExpression => "InvalidExpressionError",
            ErrorKind::SlotNotFound => "SlotNotFoundError",
            ErrorKind::DuplicateSlot => "DuplicateSlotError",
            ErrorKind::InvalidPropDeclaration => "InvalidPropDeclarationError",
        }
    }

    pub fn help(self) -> &'static str {
        match self {
            ErrorKind::StructuralDirective => {
                "Structural directives (n:view, n:layout, n:props, slots) must be well-formed."
            }
            ErrorKind::MissingRequiredProp => {
                "Props declared without a default must be supplied at every usage."
            }
            ErrorKind::UnknownComponent => {
                "Every PascalCase tag must match a component file or an <n:component> block."
            }
            ErrorKind::CircularComponentDependency => {
                "A component may not render itself, directly or through other components."
            }
            ErrorKind::ControlFlowSyntax => {
                "Loops need an item name and a collection; every block needs its closing tag."
            }
            ErrorKind::InterpolationTargetMissing => {
                "Interpolated names must exist in the data context or an enclosing scope."
            }
            ErrorKind::IslandParse => {
                "Island scripts may only declare Signal(..) and computed(..) values and update them with +=, -= or =."
            }
            ErrorKind::InvalidPropType => "Prop values must parse as the declared prop type.",
            ErrorKind::NonScalarInterpolation => {
                "Only strings, numbers, booleans and null can be interpolated."
            }
            ErrorKind::InvalidExpression => {
                "Expressions support paths, literals, comparisons, logic and a few zero-argument methods."
            }
            ErrorKind::SlotNotFound => "Named slot content must target a slot the component declares.",
            ErrorKind::DuplicateSlot => "Each slot name may appear only once per component.",
            ErrorKind::InvalidPropDeclaration => {
                "Prop declarations use `name: Type` or `name: Type = default`, one per line."
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DIAGNOSTICS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Discovery,
    Parse,
    Normalize,
    Components,
    ControlFlow,
    Interpolation,
    Islands,
    Assembly,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Discovery => "discovery",
            Stage::Parse => "parse",
            Stage::Normalize => "normalize",
            Stage::Components => "components",
            Stage::ControlFlow => "control-flow",
            Stage::Interpolation => "interpolation",
            Stage::Islands => "islands",
            Stage::Assembly => "assembly",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub code: String,
    pub kind: ErrorKind,
    pub stage: Stage,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub file: String,
    pub location: Option<SourceLocation>,
    #[serde(default)]
    pub hints: Vec<String>,
}

impl Diagnostic {
    pub fn new(stage: Stage, kind: ErrorKind, severity: Severity, message: impl Into<String>) -> Self {
        Diagnostic {
            code: kind.code().to_string(),
            kind,
            stage,
            severity,
            message: message.into(),
            file: String::new(),
            location: None,
            hints: vec![kind.help().to_string()],
        }
    }

    pub fn error(stage: Stage, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(stage, kind, Severity::Error, message)
    }

    pub fn warning(stage: Stage, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(stage, kind, Severity::Warning, message)
    }

    pub fn at(mut self, file: &str, location: &SourceLocation) -> Self {
        self.file = file.to_string();
        self.location = Some(location.clone());
        self
    }

    pub fn in_file(mut self, file: &str) -> Self {
        self.file = file.to_string();
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// `file:line:column`, or as much of it as is known.
    pub fn location_hint(&self) -> String {
        match (&self.location, self.file.is_empty()) {
            (Some(loc), false) => format!("{}:{}:{}", self.file, loc.line, loc.column),
            (Some(loc), true) => format!("{}:{}", loc.line, loc.column),
            (None, false) => self.file.clone(),
            (None, true) => String::new(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({}): {}", self.code, self.kind, self.stage, self.message)?;
        let hint = self.location_hint();
        if !hint.is_empty() {
            write!(f, " at {}", hint)?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IR TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TemplateNode {
    Element(ElementNode),
    Text(TextNode),
    Expression(ExpressionNode),
    Comment(CommentNode),
    Doctype(DoctypeNode),
    Component(ComponentNode),
    Slot(SlotNode),
    Loop(LoopNode),
    Conditional(ConditionalNode),
    Island(IslandNode),
    Scoped(ScopedNode),
    CallerScope(CallerScopeNode),
    Error(ErrorNode),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementNode {
    pub tag: String,
    pub attributes: Vec<AttributeIR>,
    pub children: Vec<TemplateNode>,
    #[serde(default)]
    pub self_closing: bool,
    #[serde(default)]
    pub location: SourceLocation,
}

impl ElementNode {
    pub fn attribute(&self, name: &str) -> Option<&AttributeIR> {
        self.attributes.iter().find(|a| a.name.eq_ignore_ascii_case(name))
    }

    pub fn static_attribute(&self, name: &str) -> Option<&str> {
        match self.attribute(name).map(|a| &a.value) {
            Some(AttributeValue::Static(value)) => Some(value.as_str()),
            _ => None,
        }
    }
}

/// Text is stored HTML-ready: source text verbatim, substituted values escaped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextNode {
    pub value: String,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionNode {
    /// Expression source without delimiters.
    pub code: String,
    /// Original text including delimiters, used for lenient pass-through.
    pub raw: String,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentNode {
    pub value: String,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctypeNode {
    pub value: String,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentNode {
    pub name: String,
    pub attributes: Vec<AttributeIR>,
    pub children: Vec<TemplateNode>,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotNode {
    pub name: Option<String>, // None = default slot
    pub fallback: Vec<TemplateNode>,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    Tag,
    Delimiter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopNode {
    pub item: String,
    pub source: String,
    pub body: Vec<TemplateNode>,
    pub dialect: Dialect,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalBranch {
    pub condition: String,
    pub body: Vec<TemplateNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalNode {
    pub branches: Vec<ConditionalBranch>,
    pub alternate: Option<Vec<TemplateNode>>,
    pub dialect: Dialect,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "query", rename_all = "lowercase")]
pub enum HydrationStrategy {
    Load,
    Visible,
    Idle,
    Media(String),
}

impl HydrationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            HydrationStrategy::Load => "load",
            HydrationStrategy::Visible => "visible",
            HydrationStrategy::Idle => "idle",
            HydrationStrategy::Media(_) => "media",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IslandNode {
    pub strategy: HydrationStrategy,
    pub script: String,
    pub children: Vec<TemplateNode>,
    #[serde(default)]
    pub location: SourceLocation,
}

/// A prop value bound at a component usage site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PropValue {
    Resolved { value: serde_json::Value },
    /// Evaluated in the caller's scope during control-flow expansion.
    Deferred { attribute: AttributeValue, ty: PropType },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropBinding {
    pub name: String,
    pub value: PropValue,
}

/// An expanded component instance: its body evaluates in an isolated frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopedNode {
    pub component: String,
    pub bindings: Vec<PropBinding>,
    pub children: Vec<TemplateNode>,
    #[serde(default)]
    pub location: SourceLocation,
}

/// Slot content: evaluates in the frame of the component's caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerScopeNode {
    pub children: Vec<TemplateNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNode {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum ValuePart {
    Text(String),
    Expression(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum AttributeValue {
    /// HTML-ready text; only quotes are escaped when rendering.
    Static(String),
    /// Bare attribute (`disabled`).
    Boolean,
    /// `class="btn {variant}"`
    Interpolated(Vec<ValuePart>),
    /// `value={expr}`
    Expression(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeIR {
    pub name: String,
    pub value: AttributeValue,
    #[serde(default)]
    pub location: SourceLocation,
}

impl AttributeIR {
    pub fn new(name: impl Into<String>, value: AttributeValue) -> Self {
        Self {
            name: name.into(),
            value,
            location: SourceLocation::default(),
        }
    }
}

impl TemplateNode {
    pub fn text(value: impl Into<String>) -> Self {
        TemplateNode::Text(TextNode {
            value: value.into(),
            location: SourceLocation::default(),
        })
    }

    pub fn comment(value: impl Into<String>) -> Self {
        TemplateNode::Comment(CommentNode {
            value: value.into(),
            location: SourceLocation::default(),
        })
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>, location: SourceLocation) -> Self {
        TemplateNode::Error(ErrorNode {
            kind,
            message: message.into(),
            location,
        })
    }

    pub fn location(&self) -> SourceLocation {
        match self {
            TemplateNode::Element(n) => n.location.clone(),
            TemplateNode::Text(n) => n.location.clone(),
            TemplateNode::Expression(n) => n.location.clone(),
            TemplateNode::Comment(n) => n.location.clone(),
            TemplateNode::Doctype(n) => n.location.clone(),
            TemplateNode::Component(n) => n.location.clone(),
            TemplateNode::Slot(n) => n.location.clone(),
            TemplateNode::Loop(n) => n.location.clone(),
            TemplateNode::Conditional(n) => n.location.clone(),
            TemplateNode::Island(n) => n.location.clone(),
            TemplateNode::Scoped(n) => n.location.clone(),
            TemplateNode::CallerScope(n) => n
                .children
                .first()
                .map(TemplateNode::location)
                .unwrap_or_default(),
            TemplateNode::Error(n) => n.location.clone(),
        }
    }

    /// True for text nodes holding only whitespace.
    pub fn is_blank(&self) -> bool {
        matches!(self, TemplateNode::Text(t) if t.value.trim().is_empty())
    }

    /// Every child list of this node, in source order.
    pub fn child_lists(&self) -> Vec<&Vec<TemplateNode>> {
        match self {
            TemplateNode::Element(n) => vec![&n.children],
            TemplateNode::Component(n) => vec![&n.children],
            TemplateNode::Slot(n) => vec![&n.fallback],
            TemplateNode::Loop(n) => vec![&n.body],
            TemplateNode::Conditional(n) => {
                let mut lists: Vec<&Vec<TemplateNode>> = n.branches.iter().map(|b| &b.body).collect();
                if let Some(alt) = &n.alternate {
                    lists.push(alt);
                }
                lists
            }
            TemplateNode::Island(n) => vec![&n.children],
            TemplateNode::Scoped(n) => vec![&n.children],
            TemplateNode::CallerScope(n) => vec![&n.children],
            _ => vec![],
        }
    }

    pub fn child_lists_mut(&mut self) -> Vec<&mut Vec<TemplateNode>> {
        match self {
            TemplateNode::Element(n) => vec![&mut n.children],
            TemplateNode::Component(n) => vec![&mut n.children],
            TemplateNode::Slot(n) => vec![&mut n.fallback],
            TemplateNode::Loop(n) => vec![&mut n.body],
            TemplateNode::Conditional(n) => {
                let mut lists: Vec<&mut Vec<TemplateNode>> =
                    n.branches.iter_mut().map(|b| &mut b.body).collect();
                if let Some(alt) = &mut n.alternate {
                    lists.push(alt);
                }
                lists
            }
            TemplateNode::Island(n) => vec![&mut n.children],
            TemplateNode::Scoped(n) => vec![&mut n.children],
            TemplateNode::CallerScope(n) => vec![&mut n.children],
            _ => vec![],
        }
    }
}

/// Visit every node depth-first, parents before children.
pub fn walk_nodes<'a>(nodes: &'a [TemplateNode], visit: &mut dyn FnMut(&'a TemplateNode)) {
    for node in nodes {
        visit(node);
        for list in node.child_lists() {
            walk_nodes(list, visit);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OUTPUT VALIDATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Checks that nothing unexpanded reaches rendering. Returns one diagnostic
/// per leftover construct.
pub fn verify_output(nodes: &[TemplateNode], file: &str) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    walk_nodes(nodes, &mut |node| {
        if let Some(message) = check_node_expanded(node) {
            diagnostics.push(
                Diagnostic::error(Stage::Assembly, ErrorKind::StructuralDirective, message)
                    .at(file, &node.location()),
            );
        }
    });
    diagnostics
}

fn check_node_expanded(node: &TemplateNode) -> Option<String> {
    match node {
        TemplateNode::Component(c) => Some(format!("Unexpanded component <{}>.", c.name)),
        TemplateNode::Loop(l) => Some(format!("Unexpanded loop over `{}`.", l.source)),
        TemplateNode::Conditional(_) => Some("Unexpanded conditional.".to_string()),
        TemplateNode::Scoped(s) => Some(format!("Unflattened scope for <{}>.", s.component)),
        TemplateNode::CallerScope(_) => Some("Unflattened slot scope.".to_string()),
        TemplateNode::Slot(_) => Some("Unresolved slot placeholder.".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_loc() -> SourceLocation {
        SourceLocation { line: 3, column: 7 }
    }

    #[test]
    fn test_diagnostic_location_hint() {
        let diag = Diagnostic::error(Stage::Components, ErrorKind::UnknownComponent, "Unknown <Foo>.")
            .at("pages/index.ncl", &mock_loc());
        assert_eq!(diag.code, NCL_UNKNOWN_COMPONENT);
        assert_eq!(diag.location_hint(), "pages/index.ncl:3:7");
        assert!(diag.to_string().contains("UnknownComponentError"));
        assert!(diag.is_error());
    }

    #[test]
    fn test_verify_output_flags_unexpanded_nodes() {
        let nodes = vec![TemplateNode::Element(ElementNode {
            tag: "div".into(),
            attributes: vec![],
            children: vec![TemplateNode::Component(ComponentNode {
                name: "Card".into(),
                attributes: vec![],
                children: vec![],
                location: mock_loc(),
            })],
            self_closing: false,
            location: SourceLocation::default(),
        })];
        let diags = verify_output(&nodes, "index.ncl");
        assert_eq!(diags.len(), 1);
        assert!(diags[0].message.contains("<Card>"));
        assert_eq!(diags[0].location, Some(mock_loc()));
    }

    #[test]
    fn test_verify_output_accepts_plain_tree() {
        let nodes = vec![TemplateNode::text("hello"), TemplateNode::comment(" layout:main ")];
        assert!(verify_output(&nodes, "index.ncl").is_empty());
    }
}
