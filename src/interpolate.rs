//! Interpolation Resolution
//!
//! Substitutes `{{ expr }}` / `{ expr }` nodes and interpolated attribute
//! values with the scalar string form of their value. Control-flow expansion
//! uses the same helpers for expressions rooted in loop or prop bindings; this
//! stage handles whatever is left, against the root data context.
//!
//! Names declared by an island's script are left alone inside that island;
//! the island stage turns them into binding markers.

use crate::finalize::{escape_html, unescape_html};
use crate::island::declared_names;
use crate::pipeline::CompileMode;
use crate::scope::DataContext;
use crate::static_eval::{parse_expression, render_scalar, Bindings, EvalError, Expr, ParseError};
use crate::validate::{
    AttributeValue, Diagnostic, ErrorKind, ExpressionNode, SourceLocation, Stage, TemplateNode,
    TextNode, ValuePart,
};
use serde_json::Value;
use std::collections::HashSet;

/// How unresolved and invalid expressions are reported.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResolveSettings<'f> {
    pub mode: CompileMode,
    pub stage: Stage,
    pub file: &'f str,
}

impl ResolveSettings<'_> {
    /// Only the final pass reports expressions that fail to parse; earlier
    /// passes leave them for it.
    fn reports_unparsed(&self) -> bool {
        self.stage == Stage::Interpolation
    }
}

/// Resolve every remaining expression against `data`.
pub fn resolve_interpolations(
    nodes: Vec<TemplateNode>,
    data: &DataContext,
    mode: CompileMode,
    file: &str,
) -> (Vec<TemplateNode>, Vec<Diagnostic>) {
    let mut resolver = Resolver {
        data,
        settings: ResolveSettings {
            mode,
            stage: Stage::Interpolation,
            file,
        },
        island_names: Vec::new(),
        diagnostics: Vec::new(),
    };
    let nodes = resolver.resolve_nodes(nodes);
    tracing::debug!(
        file = %file,
        diagnostics = resolver.diagnostics.len(),
        "interpolation resolved"
    );
    (nodes, resolver.diagnostics)
}

/// Resolve a page-level metadata value (title, description) to HTML-ready text.
pub fn resolve_metadata(
    value: &AttributeValue,
    data: &DataContext,
    mode: CompileMode,
    file: &str,
    diagnostics: &mut Vec<Diagnostic>,
) -> String {
    let settings = ResolveSettings {
        mode,
        stage: Stage::Interpolation,
        file,
    };
    match resolve_attribute_value(
        value.clone(),
        data,
        settings,
        &SourceLocation::default(),
        diagnostics,
        &|_: &Expr| true,
    ) {
        Some(AttributeValue::Static(text)) => text,
        _ => String::new(),
    }
}

struct Resolver<'a> {
    data: &'a DataContext,
    settings: ResolveSettings<'a>,
    /// Declared names of the enclosing islands, innermost last.
    island_names: Vec<HashSet<String>>,
    diagnostics: Vec<Diagnostic>,
}

fn is_island_expression(island_names: &[HashSet<String>], expr: &Expr) -> bool {
    expr.roots()
        .iter()
        .any(|root| island_names.iter().any(|names| names.contains(root)))
}

impl Resolver<'_> {
    fn resolve_nodes(&mut self, nodes: Vec<TemplateNode>) -> Vec<TemplateNode> {
        nodes.into_iter().map(|node| self.resolve_node(node)).collect()
    }

    fn resolve_node(&mut self, node: TemplateNode) -> TemplateNode {
        match node {
            TemplateNode::Expression(e) => match parse_expression(&e.code) {
                Ok(expr) if is_island_expression(&self.island_names, &expr) => {
                    TemplateNode::Expression(e)
                }
                Ok(expr) => {
                    resolve_expression_node(&e, &expr, self.data, self.settings, &mut self.diagnostics)
                }
                Err(err) => invalid_expression(&e, &err, self.settings, &mut self.diagnostics),
            },
            TemplateNode::Element(mut el) => {
                let in_island = !self.island_names.is_empty();
                let mut attributes = Vec::with_capacity(el.attributes.len());
                for mut attr in std::mem::take(&mut el.attributes) {
                    if in_island && attr.name.starts_with("on") {
                        attributes.push(attr);
                        continue;
                    }
                    let names = &self.island_names;
                    let resolved = resolve_attribute_value(
                        attr.value,
                        self.data,
                        self.settings,
                        &attr.location,
                        &mut self.diagnostics,
                        &|expr: &Expr| !is_island_expression(names, expr),
                    );
                    if let Some(value) = resolved {
                        attr.value = value;
                        attributes.push(attr);
                    }
                }
                el.attributes = attributes;
                el.children = self.resolve_nodes(el.children);
                TemplateNode::Element(el)
            }
            TemplateNode::Island(mut island) => {
                self.island_names.push(declared_names(&island.script));
                island.children = self.resolve_nodes(island.children);
                self.island_names.pop();
                TemplateNode::Island(island)
            }
            mut other => {
                for list in other.child_lists_mut() {
                    let children = std::mem::take(list);
                    *list = self.resolve_nodes(children);
                }
                other
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Evaluate a parsed expression node into escaped text or an error block.
pub(crate) fn resolve_expression_node(
    node: &ExpressionNode,
    expr: &Expr,
    bindings: &dyn Bindings,
    settings: ResolveSettings,
    diagnostics: &mut Vec<Diagnostic>,
) -> TemplateNode {
    match expr.evaluate(bindings) {
        Ok(value) => match render_scalar(&value) {
            Some(text) => TemplateNode::Text(TextNode {
                value: escape_html(&text),
                location: node.location.clone(),
            }),
            None => {
                let message = non_scalar_message(&node.code, &value);
                diagnostics.push(
                    Diagnostic::error(settings.stage, ErrorKind::NonScalarInterpolation, message.clone())
                        .at(settings.file, &node.location),
                );
                TemplateNode::error(ErrorKind::NonScalarInterpolation, message, node.location.clone())
            }
        },
        Err(EvalError::Unresolved(name)) => {
            match report_missing(&node.code, &name, settings, &node.location, diagnostics) {
                CompileMode::Lenient => TemplateNode::Text(TextNode {
                    value: escape_html(&node.raw),
                    location: node.location.clone(),
                }),
                CompileMode::Strict => TemplateNode::error(
                    ErrorKind::InterpolationTargetMissing,
                    missing_message(&name),
                    node.location.clone(),
                ),
            }
        }
    }
}

pub(crate) fn invalid_expression(
    node: &ExpressionNode,
    err: &ParseError,
    settings: ResolveSettings,
    diagnostics: &mut Vec<Diagnostic>,
) -> TemplateNode {
    let message = format!("Invalid expression `{}`: {}.", node.code.trim(), err);
    diagnostics.push(
        Diagnostic::error(settings.stage, ErrorKind::InvalidExpression, message.clone())
            .at(settings.file, &node.location),
    );
    TemplateNode::error(ErrorKind::InvalidExpression, message, node.location.clone())
}

fn missing_message(name: &str) -> String {
    format!("`{}` is not defined in the data context.", name)
}

fn non_scalar_message(code: &str, value: &Value) -> String {
    let kind = if value.is_array() { "an array" } else { "an object" };
    format!(
        "`{}` evaluates to {}; only scalar values can be interpolated.",
        code.trim(),
        kind
    )
}

/// Records the diagnostic for an unresolved root and returns the mode that
/// decides the fallback.
pub(crate) fn report_missing(
    code: &str,
    name: &str,
    settings: ResolveSettings,
    location: &SourceLocation,
    diagnostics: &mut Vec<Diagnostic>,
) -> CompileMode {
    let message = missing_message(name);
    match settings.mode {
        CompileMode::Lenient => {
            tracing::warn!(file = %settings.file, expression = %code.trim(), "unresolved interpolation passed through");
            diagnostics.push(
                Diagnostic::warning(settings.stage, ErrorKind::InterpolationTargetMissing, message)
                    .at(settings.file, location)
                    .with_hint("Strict mode rejects unresolved interpolations."),
            );
        }
        CompileMode::Strict => diagnostics.push(
            Diagnostic::error(settings.stage, ErrorKind::InterpolationTargetMissing, message)
                .at(settings.file, location),
        ),
    }
    settings.mode
}

/// Substitute the expression parts of an attribute value that `select`
/// accepts. `None` means the attribute is dropped (`disabled={false}`).
pub(crate) fn resolve_attribute_value(
    value: AttributeValue,
    bindings: &dyn Bindings,
    settings: ResolveSettings,
    location: &SourceLocation,
    diagnostics: &mut Vec<Diagnostic>,
    select: &dyn Fn(&Expr) -> bool,
) -> Option<AttributeValue> {
    match value {
        AttributeValue::Expression(code) => {
            let expr = match parse_expression(&code) {
                Ok(expr) => expr,
                Err(err) => {
                    if !settings.reports_unparsed() {
                        return Some(AttributeValue::Expression(code));
                    }
                    report_invalid(&code, &err, settings, location, diagnostics);
                    return Some(AttributeValue::Static(String::new()));
                }
            };
            if !select(&expr) {
                return Some(AttributeValue::Expression(code));
            }
            match expr.evaluate(bindings) {
                Ok(Value::Bool(false)) | Ok(Value::Null) => None,
                Ok(Value::Bool(true)) => Some(AttributeValue::Boolean),
                Ok(value) => Some(AttributeValue::Static(
                    scalar_or_report(&code, &value, settings, location, diagnostics),
                )),
                Err(EvalError::Unresolved(name)) => {
                    match report_missing(&code, &name, settings, location, diagnostics) {
                        CompileMode::Lenient => {
                            Some(AttributeValue::Static(escape_html(&format!("{{{}}}", code))))
                        }
                        CompileMode::Strict => Some(AttributeValue::Static(String::new())),
                    }
                }
            }
        }
        AttributeValue::Interpolated(parts) => {
            let mut out: Vec<ValuePart> = Vec::with_capacity(parts.len());
            for part in parts {
                let resolved = match part {
                    ValuePart::Text(text) => ValuePart::Text(text),
                    ValuePart::Expression(code) => {
                        resolve_part(code, bindings, settings, location, diagnostics, select)
                    }
                };
                match (out.last_mut(), resolved) {
                    (Some(ValuePart::Text(prev)), ValuePart::Text(next)) => prev.push_str(&next),
                    (_, part) => out.push(part),
                }
            }
            match out.as_slice() {
                [] => Some(AttributeValue::Static(String::new())),
                [ValuePart::Text(text)] => Some(AttributeValue::Static(text.clone())),
                _ => Some(AttributeValue::Interpolated(out)),
            }
        }
        other => Some(other),
    }
}

fn resolve_part(
    code: String,
    bindings: &dyn Bindings,
    settings: ResolveSettings,
    location: &SourceLocation,
    diagnostics: &mut Vec<Diagnostic>,
    select: &dyn Fn(&Expr) -> bool,
) -> ValuePart {
    let expr = match parse_expression(&code) {
        Ok(expr) => expr,
        Err(err) => {
            if !settings.reports_unparsed() {
                return ValuePart::Expression(code);
            }
            report_invalid(&code, &err, settings, location, diagnostics);
            return ValuePart::Text(String::new());
        }
    };
    if !select(&expr) {
        return ValuePart::Expression(code);
    }
    match expr.evaluate(bindings) {
        Ok(value) => ValuePart::Text(scalar_or_report(&code, &value, settings, location, diagnostics)),
        Err(EvalError::Unresolved(name)) => {
            match report_missing(&code, &name, settings, location, diagnostics) {
                CompileMode::Lenient => ValuePart::Text(escape_html(&format!("{{{}}}", code))),
                CompileMode::Strict => ValuePart::Text(String::new()),
            }
        }
    }
}

fn scalar_or_report(
    code: &str,
    value: &Value,
    settings: ResolveSettings,
    location: &SourceLocation,
    diagnostics: &mut Vec<Diagnostic>,
) -> String {
    match render_scalar(value) {
        Some(text) => escape_html(&text),
        None => {
            diagnostics.push(
                Diagnostic::error(
                    settings.stage,
                    ErrorKind::NonScalarInterpolation,
                    non_scalar_message(code, value),
                )
                .at(settings.file, location),
            );
            String::new()
        }
    }
}

fn report_invalid(
    code: &str,
    err: &ParseError,
    settings: ResolveSettings,
    location: &SourceLocation,
    diagnostics: &mut Vec<Diagnostic>,
) {
    diagnostics.push(
        Diagnostic::error(
            settings.stage,
            ErrorKind::InvalidExpression,
            format!("Invalid expression `{}`: {}.", code.trim(), err),
        )
        .at(settings.file, location),
    );
}

/// Plain-text value of a fully resolved attribute.
pub(crate) fn attribute_text(value: &AttributeValue) -> Option<String> {
    match value {
        AttributeValue::Static(text) => Some(unescape_html(text)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_template;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn data(value: Value) -> DataContext {
        DataContext::from_value(value).unwrap()
    }

    fn texts(nodes: &[TemplateNode]) -> String {
        nodes
            .iter()
            .map(|n| match n {
                TemplateNode::Text(t) => t.value.clone(),
                TemplateNode::Error(e) => format!("[{}]", e.kind.code()),
                _ => String::new(),
            })
            .collect()
    }

    fn resolve(src: &str, ctx: &DataContext, mode: CompileMode) -> (Vec<TemplateNode>, Vec<Diagnostic>) {
        let parsed = parse_template(src, "page.ncl");
        resolve_interpolations(parsed.nodes, ctx, mode, "page.ncl")
    }

    #[test]
    fn test_scalar_substitution_is_escaped() {
        let ctx = data(json!({ "name": "<b>Ada</b>", "n": 3, "user": { "age": 36 } }));
        let (nodes, diags) = resolve("Hi {{ name }} {n} {{user.age}}", &ctx, CompileMode::Lenient);
        assert!(diags.is_empty());
        assert_eq!(texts(&nodes), "Hi &lt;b&gt;Ada&lt;/b&gt; 3 36");
    }

    #[test]
    fn test_missing_root_lenient_passes_raw_text() {
        let (nodes, diags) = resolve("<p>{{ ghost }}</p>", &DataContext::new(), CompileMode::Lenient);
        let TemplateNode::Element(p) = &nodes[0] else {
            panic!("expected element");
        };
        assert_eq!(texts(&p.children), "{{ ghost }}");
        assert_eq!(diags.len(), 1);
        assert!(!diags[0].is_error());
        assert_eq!(diags[0].kind, ErrorKind::InterpolationTargetMissing);
    }

    #[test]
    fn test_missing_root_strict_is_an_error() {
        let (nodes, diags) = resolve("{{ ghost }}", &DataContext::new(), CompileMode::Strict);
        assert_eq!(texts(&nodes), "[NCL006]");
        assert!(diags[0].is_error());
    }

    #[test]
    fn test_non_scalar_is_reported() {
        let ctx = data(json!({ "items": [1, 2] }));
        let (nodes, diags) = resolve("{{ items }}", &ctx, CompileMode::Lenient);
        assert_eq!(texts(&nodes), "[NCL009]");
        assert_eq!(diags[0].kind, ErrorKind::NonScalarInterpolation);
    }

    #[test]
    fn test_attribute_values() {
        let ctx = data(json!({ "variant": "primary", "off": false }));
        let (nodes, diags) = resolve(
            r#"<button class="btn btn-{variant}" disabled={off}>x</button>"#,
            &ctx,
            CompileMode::Lenient,
        );
        assert!(diags.is_empty(), "{:?}", diags);
        let TemplateNode::Element(button) = &nodes[0] else {
            panic!("expected element");
        };
        assert_eq!(button.attributes.len(), 1);
        assert_eq!(
            button.attributes[0].value,
            AttributeValue::Static("btn btn-primary".into())
        );
    }

    #[test]
    fn test_island_names_are_left_for_the_island_stage() {
        let (nodes, diags) = resolve(
            "<n:island client:load><script>let count = Signal(0)</script><p>{count}</p></n:island>",
            &DataContext::new(),
            CompileMode::Strict,
        );
        assert!(diags.is_empty(), "{:?}", diags);
        let TemplateNode::Island(island) = &nodes[0] else {
            panic!("expected island");
        };
        let TemplateNode::Element(p) = &island.children[0] else {
            panic!("expected element");
        };
        assert!(matches!(&p.children[0], TemplateNode::Expression(e) if e.code.trim() == "count"));
    }

    #[test]
    fn test_metadata() {
        let ctx = data(json!({ "site": "Docs" }));
        let mut diags = Vec::new();
        let title = resolve_metadata(
            &AttributeValue::Interpolated(vec![
                ValuePart::Text("Home | ".into()),
                ValuePart::Expression("site".into()),
            ]),
            &ctx,
            CompileMode::Lenient,
            "page.ncl",
            &mut diags,
        );
        assert_eq!(title, "Home | Docs");
        assert!(diags.is_empty());
    }
}
