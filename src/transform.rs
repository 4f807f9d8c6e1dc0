//! Control-Flow Expansion
//!
//! Expands loops and conditionals of both dialects against the data context,
//! outer-first: every loop iteration gets its own child frame, so bindings
//! never leak between iterations. Component instances (`Scoped`) are
//! flattened here as well, since their prop bindings may depend on loop
//! variables of the caller.

use crate::discovery::PropType;
use crate::finalize::unescape_html;
use crate::interpolate::{
    report_missing, resolve_attribute_value, resolve_expression_node, ResolveSettings,
};
use crate::pipeline::CompileMode;
use crate::scope::{DataContext, Scope};
use crate::static_eval::{is_truthy, parse_expression, EvalError, Expr};
use crate::validate::{
    AttributeValue, ConditionalNode, Diagnostic, Dialect, ErrorKind, LoopNode, PropValue,
    ScopedNode, SourceLocation, Stage, TemplateNode,
};
use serde_json::{json, Value};

/// Expand every loop, conditional and component scope in `nodes`.
pub fn expand_control_flow(
    nodes: Vec<TemplateNode>,
    data: &DataContext,
    mode: CompileMode,
    file: &str,
) -> (Vec<TemplateNode>, Vec<Diagnostic>) {
    let mut expander = Expander {
        mode,
        file: file.to_string(),
        diagnostics: Vec::new(),
    };
    let root = Scope::root(data);
    let nodes = expander.expand_nodes(nodes, &root);
    tracing::debug!(
        file = %file,
        diagnostics = expander.diagnostics.len(),
        "control flow expanded"
    );
    (nodes, expander.diagnostics)
}

struct Expander {
    mode: CompileMode,
    file: String,
    diagnostics: Vec<Diagnostic>,
}

impl Expander {
    fn settings(&self) -> ResolveSettings<'_> {
        ResolveSettings {
            mode: self.mode,
            stage: Stage::ControlFlow,
            file: &self.file,
        }
    }

    fn error_node(&mut self, kind: ErrorKind, message: String, location: &SourceLocation) -> TemplateNode {
        self.diagnostics.push(
            Diagnostic::error(Stage::ControlFlow, kind, message.clone()).at(&self.file, location),
        );
        TemplateNode::error(kind, message, location.clone())
    }

    fn expand_nodes(&mut self, nodes: Vec<TemplateNode>, scope: &Scope<'_>) -> Vec<TemplateNode> {
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            self.expand_node(node, scope, &mut out);
        }
        out
    }

    fn expand_node(&mut self, node: TemplateNode, scope: &Scope<'_>, out: &mut Vec<TemplateNode>) {
        match node {
            TemplateNode::Loop(l) => self.expand_loop(l, scope, out),
            TemplateNode::Conditional(c) => self.expand_conditional(c, scope, out),
            TemplateNode::Scoped(s) => self.expand_scoped(s, scope, out),
            TemplateNode::CallerScope(cs) => {
                let children = match scope.caller() {
                    Some(caller) => self.expand_nodes(cs.children, caller),
                    None => self.expand_nodes(cs.children, scope),
                };
                out.extend(children);
            }
            TemplateNode::Expression(e) => {
                let local = match parse_expression(&e.code) {
                    Ok(expr) if has_local_root(&expr, scope) => Some(expr),
                    _ => None,
                };
                match local {
                    Some(expr) => {
                        let settings = ResolveSettings {
                            mode: self.mode,
                            stage: Stage::ControlFlow,
                            file: &self.file,
                        };
                        out.push(resolve_expression_node(&e, &expr, scope, settings, &mut self.diagnostics));
                    }
                    None => out.push(TemplateNode::Expression(e)),
                }
            }
            TemplateNode::Element(mut el) => {
                let mut attributes = Vec::with_capacity(el.attributes.len());
                for mut attr in std::mem::take(&mut el.attributes) {
                    let settings = ResolveSettings {
                        mode: self.mode,
                        stage: Stage::ControlFlow,
                        file: &self.file,
                    };
                    let resolved = resolve_attribute_value(
                        attr.value,
                        scope,
                        settings,
                        &attr.location,
                        &mut self.diagnostics,
                        &|expr: &Expr| has_local_root(expr, scope),
                    );
                    if let Some(value) = resolved {
                        attr.value = value;
                        attributes.push(attr);
                    }
                }
                el.attributes = attributes;
                el.children = self.expand_nodes(el.children, scope);
                out.push(TemplateNode::Element(el));
            }
            mut other => {
                for list in other.child_lists_mut() {
                    let children = std::mem::take(list);
                    *list = self.expand_nodes(children, scope);
                }
                out.push(other);
            }
        }
    }

    fn expand_loop(&mut self, l: LoopNode, scope: &Scope<'_>, out: &mut Vec<TemplateNode>) {
        let expr = match parse_expression(&l.source) {
            Ok(expr) => expr,
            Err(err) => {
                out.push(self.error_node(
                    ErrorKind::InvalidExpression,
                    format!("Invalid loop source `{}`: {}.", l.source.trim(), err),
                    &l.location,
                ));
                return;
            }
        };

        let items: Vec<Value> = match expr.evaluate(scope) {
            Ok(Value::Array(items)) => items,
            Ok(Value::Null) => Vec::new(),
            Ok(Value::Object(map)) => map
                .into_iter()
                .map(|(key, value)| json!({ "key": key, "value": value }))
                .collect(),
            Ok(other) => {
                out.push(self.error_node(
                    ErrorKind::ControlFlowSyntax,
                    format!("`{}` is not a collection (found `{}`).", l.source.trim(), other),
                    &l.location,
                ));
                return;
            }
            Err(EvalError::Unresolved(name)) => match l.dialect {
                Dialect::Tag => {
                    tracing::debug!(file = %self.file, collection = %name, "unresolved loop source treated as empty");
                    Vec::new()
                }
                Dialect::Delimiter => {
                    out.push(self.error_node(
                        ErrorKind::ControlFlowSyntax,
                        format!("Loop collection `{}` is not defined.", name),
                        &l.location,
                    ));
                    return;
                }
            },
        };

        let length = items.len();
        for (index, item) in items.into_iter().enumerate() {
            let mut frame = scope.child();
            frame.bind(l.item.clone(), item);
            frame.bind(
                "loop",
                json!({
                    "index": index + 1,
                    "index0": index,
                    "first": index == 0,
                    "last": index + 1 == length,
                    "length": length,
                }),
            );
            let body = self.expand_nodes(l.body.clone(), &frame);
            out.extend(body);
        }
    }

    fn expand_conditional(&mut self, c: ConditionalNode, scope: &Scope<'_>, out: &mut Vec<TemplateNode>) {
        for branch in c.branches {
            if self.condition_holds(&branch.condition, scope, &c.location) {
                let body = self.expand_nodes(branch.body, scope);
                out.extend(body);
                return;
            }
        }
        if let Some(alternate) = c.alternate {
            let body = self.expand_nodes(alternate, scope);
            out.extend(body);
        }
    }

    /// Unresolved roots are falsy; unparsable conditions are reported and falsy.
    fn condition_holds(&mut self, condition: &str, scope: &Scope<'_>, location: &SourceLocation) -> bool {
        match parse_expression(condition) {
            Ok(expr) => match expr.evaluate(scope) {
                Ok(value) => is_truthy(&value),
                Err(EvalError::Unresolved(_)) => false,
            },
            Err(err) => {
                self.diagnostics.push(
                    Diagnostic::error(
                        Stage::ControlFlow,
                        ErrorKind::InvalidExpression,
                        format!("Invalid condition `{}`: {}.", condition.trim(), err),
                    )
                    .at(&self.file, location),
                );
                false
            }
        }
    }

    fn expand_scoped(&mut self, s: ScopedNode, scope: &Scope<'_>, out: &mut Vec<TemplateNode>) {
        let mut frame = scope.isolated();
        for binding in s.bindings {
            let value = match binding.value {
                PropValue::Resolved { value } => value,
                PropValue::Deferred { attribute, ty } => {
                    self.evaluate_deferred(&s.component, &binding.name, attribute, ty, scope, &s.location)
                }
            };
            frame.bind(binding.name, value);
        }
        let children = self.expand_nodes(s.children, &frame);
        out.extend(children);
    }

    /// Evaluate a dynamic prop in the caller's scope and coerce it.
    fn evaluate_deferred(
        &mut self,
        component: &str,
        name: &str,
        attribute: AttributeValue,
        ty: PropType,
        scope: &Scope<'_>,
        location: &SourceLocation,
    ) -> Value {
        let value = match attribute {
            AttributeValue::Expression(code) => match parse_expression(&code) {
                Ok(expr) => match expr.evaluate(scope) {
                    Ok(value) => value,
                    Err(EvalError::Unresolved(root)) => {
                        let settings = self.settings();
                        let mut diagnostics = Vec::new();
                        report_missing(&code, &root, settings, location, &mut diagnostics);
                        self.diagnostics.append(&mut diagnostics);
                        Value::Null
                    }
                },
                Err(err) => {
                    self.diagnostics.push(
                        Diagnostic::error(
                            Stage::ControlFlow,
                            ErrorKind::InvalidExpression,
                            format!("Invalid expression for prop `{}`: {}.", name, err),
                        )
                        .at(&self.file, location),
                    );
                    Value::Null
                }
            },
            AttributeValue::Interpolated(parts) => {
                let settings = ResolveSettings {
                    mode: self.mode,
                    stage: Stage::ControlFlow,
                    file: &self.file,
                };
                match resolve_attribute_value(
                    AttributeValue::Interpolated(parts),
                    scope,
                    settings,
                    location,
                    &mut self.diagnostics,
                    &|_: &Expr| true,
                ) {
                    Some(AttributeValue::Static(text)) => Value::String(unescape_html(&text)),
                    _ => Value::Null,
                }
            }
            AttributeValue::Static(text) => Value::String(unescape_html(&text)),
            AttributeValue::Boolean => Value::Bool(true),
        };

        match ty.coerce_value(value) {
            Ok(value) => value,
            Err(reason) => {
                self.diagnostics.push(
                    Diagnostic::error(
                        Stage::ControlFlow,
                        ErrorKind::InvalidPropType,
                        format!("Prop `{}` of <{}>: {}.", name, component, reason),
                    )
                    .at(&self.file, location),
                );
                Value::Null
            }
        }
    }
}

fn has_local_root(expr: &Expr, scope: &Scope<'_>) -> bool {
    expr.roots().iter().any(|root| scope.is_local(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_template;
    use pretty_assertions::assert_eq;

    fn expand(src: &str, data: serde_json::Value) -> (Vec<TemplateNode>, Vec<Diagnostic>) {
        let parsed = parse_template(src, "page.ncl");
        assert!(parsed.diagnostics.is_empty(), "{:?}", parsed.diagnostics);
        let ctx = DataContext::from_value(data).unwrap();
        expand_control_flow(parsed.nodes, &ctx, CompileMode::Lenient, "page.ncl")
    }

    fn flat_text(nodes: &[TemplateNode]) -> String {
        let mut out = String::new();
        crate::validate::walk_nodes(nodes, &mut |node| match node {
            TemplateNode::Text(t) => out.push_str(&t.value),
            TemplateNode::Expression(e) => out.push_str(&e.raw),
            TemplateNode::Error(e) => out.push_str(&format!("[{}]", e.kind.code())),
            _ => {}
        });
        out
    }

    #[test]
    fn test_tag_loop_copies_in_order() {
        let (nodes, diags) = expand(
            r#"<for item="u" in="users">{{u.name}}</for>"#,
            json!({ "users": [{ "name": "Alex" }, { "name": "Sam" }] }),
        );
        assert!(diags.is_empty());
        assert_eq!(flat_text(&nodes), "AlexSam");
    }

    #[test]
    fn test_empty_and_missing_collections() {
        let (nodes, _) = expand(r#"<for item="u" in="users"><p>{{u}}</p></for>"#, json!({ "users": [] }));
        assert!(nodes.is_empty());
        let (nodes, diags) = expand(r#"<for item="u" in="ghosts"><p>{{u}}</p></for>"#, json!({}));
        assert!(nodes.is_empty());
        assert!(diags.is_empty());
    }

    #[test]
    fn test_delimiter_loop_with_missing_collection_is_an_error() {
        let (nodes, diags) = expand("{% for u in ghosts %}x{% endfor %}", json!({}));
        assert_eq!(flat_text(&nodes), "[NCL005]");
        assert_eq!(diags[0].kind, ErrorKind::ControlFlowSyntax);
    }

    #[test]
    fn test_loop_metadata_and_nesting() {
        let (nodes, _) = expand(
            "{% for row in rows %}{% for c in row %}{{loop.index}}{{c}}{% endfor %};{% endfor %}",
            json!({ "rows": [["a", "b"], ["c"]] }),
        );
        assert_eq!(flat_text(&nodes), "1a2b;1c;");
    }

    #[test]
    fn test_first_truthy_branch_wins() {
        let src = "{% if a %}A{% elif b %}B{% else %}C{% endif %}";
        assert_eq!(flat_text(&expand(src, json!({ "a": 1, "b": true })).0), "A");
        assert_eq!(flat_text(&expand(src, json!({ "a": 0, "b": "yes" })).0), "B");
        assert_eq!(flat_text(&expand(src, json!({ "a": [], "b": "" })).0), "C");
        assert_eq!(flat_text(&expand("{% if a %}A{% endif %}", json!({})).0), "");
    }

    #[test]
    fn test_tag_conditional_chain() {
        let src = r#"<if condition="role == 'admin'">admin</if><elif condition="role == 'user'">user</elif><else>guest</else>"#;
        assert_eq!(flat_text(&expand(src, json!({ "role": "user" })).0), "user");
        assert_eq!(flat_text(&expand(src, json!({})).0), "guest");
    }

    #[test]
    fn test_global_expressions_are_left_for_interpolation() {
        let (nodes, _) = expand(
            "{% for x in xs %}{{x}}{{site}}{% endfor %}",
            json!({ "xs": [1], "site": "Docs" }),
        );
        assert_eq!(flat_text(&nodes), "1{{site}}");
    }
}
