//! Component Expansion
//!
//! Replaces every component usage with its definition body wrapped in a
//! `Scoped` node carrying the prop bindings. Slot content is resolved in the
//! caller's context first and placed into the body inside `CallerScope`
//! nodes, so control-flow expansion later evaluates it in the caller's frame.

use crate::discovery::{ComponentDefinition, ComponentRegistry, PropDefinition, PropType};
use crate::validate::{
    AttributeIR, AttributeValue, CallerScopeNode, ComponentNode, Diagnostic, ErrorKind,
    PropBinding, PropValue, ScopedNode, SourceLocation, Stage, TemplateNode, ValuePart,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_MAX_DEPTH: u32 = 32;

/// Output of one expansion pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expansion {
    pub nodes: Vec<TemplateNode>,
    /// Definitions that were instantiated, in first-use order.
    pub used_components: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Slot content collected from a usage site.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedSlots {
    pub default: Vec<TemplateNode>,
    /// Lowercased slot name to content, in source order.
    pub named: Vec<(String, Vec<TemplateNode>)>,
}

impl ResolvedSlots {
    fn named_mut(&mut self, name: &str) -> &mut Vec<TemplateNode> {
        let index = match self.named.iter().position(|(n, _)| n == name) {
            Some(index) => index,
            None => {
                self.named.push((name.to_string(), Vec::new()));
                self.named.len() - 1
            }
        };
        &mut self.named[index].1
    }
}

struct ResolutionContext<'r> {
    registry: &'r ComponentRegistry,
    max_depth: u32,
    /// Names of the definitions currently being expanded, outermost first.
    stack: Vec<String>,
    /// File diagnostics are attributed to.
    file: String,
    used_components: Vec<String>,
    diagnostics: Vec<Diagnostic>,
}

/// Expand every component usage in `nodes`.
pub fn expand_components(
    nodes: Vec<TemplateNode>,
    registry: &ComponentRegistry,
    max_depth: u32,
    file: &str,
) -> Expansion {
    let mut ctx = ResolutionContext {
        registry,
        max_depth,
        stack: Vec::new(),
        file: file.to_string(),
        used_components: Vec::new(),
        diagnostics: Vec::new(),
    };
    let nodes = resolve_nodes(nodes, &mut ctx);
    tracing::debug!(
        file = %file,
        used = ctx.used_components.len(),
        diagnostics = ctx.diagnostics.len(),
        "component expansion finished"
    );
    Expansion {
        nodes,
        used_components: ctx.used_components,
        diagnostics: ctx.diagnostics,
    }
}

impl ResolutionContext<'_> {
    fn error_node(&mut self, kind: ErrorKind, message: String, location: &SourceLocation) -> TemplateNode {
        self.diagnostics.push(
            Diagnostic::error(Stage::Components, kind, message.clone()).at(&self.file, location),
        );
        TemplateNode::error(kind, message, location.clone())
    }

    fn warn(&mut self, kind: ErrorKind, message: String, location: &SourceLocation) {
        tracing::warn!(file = %self.file, "{}", message);
        self.diagnostics
            .push(Diagnostic::warning(Stage::Components, kind, message).at(&self.file, location));
    }
}

fn resolve_nodes(nodes: Vec<TemplateNode>, ctx: &mut ResolutionContext) -> Vec<TemplateNode> {
    let mut resolved = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            TemplateNode::Component(comp) => resolved.push(resolve_component_node(comp, ctx)),
            // Already resolved at the usage site.
            TemplateNode::CallerScope(_) => resolved.push(node),
            mut other => {
                for list in other.child_lists_mut() {
                    let children = std::mem::take(list);
                    *list = resolve_nodes(children, ctx);
                }
                resolved.push(other);
            }
        }
    }
    resolved
}

fn resolve_component_node(node: ComponentNode, ctx: &mut ResolutionContext) -> TemplateNode {
    let location = node.location.clone();
    let registry = ctx.registry;

    let Some(def) = registry.get(&node.name) else {
        let message = match node.name.split_once('.') {
            Some((parent, _)) => format!(
                "<{}> is only valid as a direct child of <{}>.",
                node.name, parent
            ),
            None => format!("Unknown component <{}>.", node.name),
        };
        return ctx.error_node(ErrorKind::UnknownComponent, message, &location);
    };

    if let Some(start) = ctx.stack.iter().position(|n| n == &def.name) {
        let mut chain = ctx.stack[start..].to_vec();
        chain.push(def.name.clone());
        return ctx.error_node(
            ErrorKind::CircularComponentDependency,
            format!("Circular component dependency: {}", chain.join(" -> ")),
            &location,
        );
    }
    if ctx.stack.len() as u32 >= ctx.max_depth {
        return ctx.error_node(
            ErrorKind::CircularComponentDependency,
            format!(
                "Component nesting exceeds {} levels at <{}>.",
                ctx.max_depth, def.name
            ),
            &location,
        );
    }

    if !ctx.used_components.contains(&def.name) {
        ctx.used_components.push(def.name.clone());
    }

    // 1. Props
    let mut bindings: Vec<PropBinding> = Vec::new();
    let mut forwarded: Vec<AttributeIR> = Vec::new();
    for attr in node.attributes {
        if attr.name == "slot" {
            continue;
        }
        match def.prop(&attr.name) {
            Some(prop) => match bind_prop(prop, attr, def, ctx) {
                Ok(Some(binding)) => bindings.push(binding),
                Ok(None) => {}
                Err(message) => {
                    return TemplateNode::error(ErrorKind::InvalidPropType, message, location);
                }
            },
            None => forwarded.push(attr),
        }
    }

    let mut missing = Vec::new();
    for prop in &def.props {
        if bindings.iter().any(|b| b.name == prop.name) {
            continue;
        }
        match (&prop.default, prop.optional) {
            (Some(default), _) => bindings.push(resolved(&prop.name, default.clone())),
            (None, true) => bindings.push(resolved(&prop.name, Value::Null)),
            (None, false) => missing.push(prop.name.clone()),
        }
    }
    if !missing.is_empty() {
        for name in &missing {
            ctx.diagnostics.push(
                Diagnostic::error(
                    Stage::Components,
                    ErrorKind::MissingRequiredProp,
                    format!("<{}> is missing required prop `{}`.", def.name, name),
                )
                .at(&ctx.file, &location),
            );
        }
        return TemplateNode::error(
            ErrorKind::MissingRequiredProp,
            format!(
                "<{}> is missing required prop{} {}",
                def.name,
                if missing.len() == 1 { "" } else { "s" },
                missing
                    .iter()
                    .map(|m| format!("`{}`", m))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            location,
        );
    }
    // Declaration order keeps the output stable regardless of attribute order.
    bindings.sort_by_key(|b| def.props.iter().position(|p| p.name == b.name));

    // 2. Slots, resolved in the caller's context
    let mut slots = extract_slots(&node.name, node.children, ctx);
    for (name, content) in &slots.named {
        if !def.slots.iter().any(|s| slot_matches(s.name.as_deref(), Some(name.as_str()))) {
            if content.iter().all(TemplateNode::is_blank) {
                continue;
            }
            ctx.warn(
                ErrorKind::SlotNotFound,
                format!("<{}> has no slot named `{}`; the content is dropped.", def.name, name),
                &location,
            );
        }
    }

    let mut body = resolve_slots(def.nodes.clone(), &mut slots);
    forward_attributes_to_root(&mut body, forwarded, def, ctx, &location);

    // 3. Body, in the definition's context
    ctx.stack.push(def.name.clone());
    let caller_file = std::mem::replace(&mut ctx.file, def.path.clone());
    let children = resolve_nodes(body, ctx);
    ctx.file = caller_file;
    ctx.stack.pop();

    TemplateNode::Scoped(ScopedNode {
        component: def.name.clone(),
        bindings,
        children,
        location,
    })
}

fn resolved(name: &str, value: Value) -> PropBinding {
    PropBinding {
        name: name.to_string(),
        value: PropValue::Resolved { value },
    }
}

/// `Ok(None)` drops the attribute and lets the default apply.
fn bind_prop(
    prop: &PropDefinition,
    attr: AttributeIR,
    def: &ComponentDefinition,
    ctx: &mut ResolutionContext,
) -> Result<Option<PropBinding>, String> {
    let coerced = match attr.value {
        AttributeValue::Static(raw) => prop.ty.coerce_str(&crate::finalize::unescape_html(&raw)),
        AttributeValue::Boolean => match prop.ty {
            PropType::Bool | PropType::Any => Ok(Value::Bool(true)),
            PropType::String => Ok(Value::String(String::new())),
            ty => Err(format!("expected {}, got a bare attribute", ty.name())),
        },
        value @ (AttributeValue::Interpolated(_) | AttributeValue::Expression(_)) => {
            return Ok(Some(PropBinding {
                name: prop.name.clone(),
                value: PropValue::Deferred {
                    attribute: value,
                    ty: prop.ty,
                },
            }));
        }
    };

    match coerced {
        Ok(value) => Ok(Some(resolved(&prop.name, value))),
        Err(reason) => {
            let message = format!("Prop `{}` of <{}>: {}.", prop.name, def.name, reason);
            if prop.default.is_some() || prop.optional {
                ctx.diagnostics.push(
                    Diagnostic::warning(Stage::Components, ErrorKind::InvalidPropType, message)
                        .at(&ctx.file, &attr.location)
                        .with_hint("The declared default is used instead."),
                );
                Ok(None)
            } else {
                ctx.diagnostics.push(
                    Diagnostic::error(Stage::Components, ErrorKind::InvalidPropType, message.clone())
                        .at(&ctx.file, &attr.location),
                );
                Err(message)
            }
        }
    }
}

/// Split usage children into default and named slot content. Content is
/// expanded here, in the caller's context.
fn extract_slots(
    parent_name: &str,
    children: Vec<TemplateNode>,
    ctx: &mut ResolutionContext,
) -> ResolvedSlots {
    let mut slots = ResolvedSlots::default();

    for child in children {
        match child {
            TemplateNode::Component(mut comp) => {
                if let Some(slot_name) = parse_compound_name(&comp.name, parent_name) {
                    let content = resolve_nodes(comp.children, ctx);
                    slots.named_mut(&slot_name).extend(content);
                } else if let Some(slot_name) = take_slot_attribute(&mut comp.attributes) {
                    let content = resolve_component_node(comp, ctx);
                    slots.named_mut(&slot_name).push(content);
                } else {
                    slots.default.push(TemplateNode::Component(comp));
                }
            }
            TemplateNode::Element(mut el) => match take_slot_attribute(&mut el.attributes) {
                Some(slot_name) => {
                    let content = resolve_nodes(vec![TemplateNode::Element(el)], ctx);
                    slots.named_mut(&slot_name).extend(content);
                }
                None => slots.default.push(TemplateNode::Element(el)),
            },
            other => slots.default.push(other),
        }
    }

    slots.default = resolve_nodes(std::mem::take(&mut slots.default), ctx);
    slots
}

fn take_slot_attribute(attributes: &mut Vec<AttributeIR>) -> Option<String> {
    let index = attributes.iter().position(|a| {
        a.name == "slot" && matches!(&a.value, AttributeValue::Static(v) if !v.trim().is_empty())
    })?;
    match attributes.remove(index).value {
        AttributeValue::Static(name) => Some(name.trim().to_lowercase()),
        _ => None,
    }
}

/// `Card.Header` inside `<Card>` names the `header` slot.
pub fn parse_compound_name(component_name: &str, parent_name: &str) -> Option<String> {
    let prefix = format!("{}.", parent_name);
    component_name
        .strip_prefix(&prefix)
        .filter(|rest| !rest.is_empty())
        .map(str::to_lowercase)
}

fn slot_matches(declared: Option<&str>, wanted: Option<&str>) -> bool {
    match (declared, wanted) {
        (None, None) => true,
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

/// Replace slot placeholders in a definition body. Each piece of content is
/// placed at most once; later placeholders of the same slot get their
/// fallback.
fn resolve_slots(nodes: Vec<TemplateNode>, slots: &mut ResolvedSlots) -> Vec<TemplateNode> {
    let mut resolved = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            TemplateNode::Slot(slot) => {
                let content = match &slot.name {
                    None => Some(std::mem::take(&mut slots.default)),
                    Some(name) => slots
                        .named
                        .iter_mut()
                        .find(|(n, _)| n.eq_ignore_ascii_case(name))
                        .map(|(_, content)| std::mem::take(content)),
                };
                match content {
                    Some(children) if !children.iter().all(TemplateNode::is_blank) => {
                        resolved.push(TemplateNode::CallerScope(CallerScopeNode { children }));
                    }
                    _ => resolved.extend(resolve_slots(slot.fallback, slots)),
                }
            }
            mut other => {
                for list in other.child_lists_mut() {
                    let children = std::mem::take(list);
                    *list = resolve_slots(children, slots);
                }
                resolved.push(other);
            }
        }
    }
    resolved
}

/// Undeclared attributes go to the single root element of the body.
fn forward_attributes_to_root(
    body: &mut [TemplateNode],
    forwarded: Vec<AttributeIR>,
    def: &ComponentDefinition,
    ctx: &mut ResolutionContext,
    location: &SourceLocation,
) {
    if forwarded.is_empty() {
        return;
    }
    let (forwardable, dynamic): (Vec<_>, Vec<_>) = forwarded.into_iter().partition(|a| {
        matches!(a.value, AttributeValue::Static(_) | AttributeValue::Boolean)
    });
    for attr in dynamic {
        ctx.warn(
            ErrorKind::StructuralDirective,
            format!(
                "Dynamic attribute `{}` is not a prop of <{}> and is dropped.",
                attr.name, def.name
            ),
            &attr.location,
        );
    }
    if forwardable.is_empty() {
        return;
    }

    let mut roots = body
        .iter_mut()
        .filter(|n| !n.is_blank() && !matches!(n, TemplateNode::Comment(_)));
    let root = match (roots.next(), roots.next()) {
        (Some(root), None) => root,
        _ => {
            let names: Vec<_> = forwardable.iter().map(|a| a.name.as_str()).collect();
            ctx.warn(
                ErrorKind::StructuralDirective,
                format!(
                    "<{}> has no single root element; attributes {} are dropped.",
                    def.name,
                    names.join(", ")
                ),
                location,
            );
            return;
        }
    };

    match root {
        TemplateNode::Element(el) => {
            for attr in forwardable {
                merge_attribute(&mut el.attributes, attr);
            }
        }
        // Forwarded on to the nested usage.
        TemplateNode::Component(comp) => {
            for attr in forwardable {
                merge_attribute(&mut comp.attributes, attr);
            }
        }
        _ => ctx.warn(
            ErrorKind::StructuralDirective,
            format!("<{}> has no root element to receive attributes.", def.name),
            location,
        ),
    }
}

fn merge_attribute(attributes: &mut Vec<AttributeIR>, attr: AttributeIR) {
    let Some(existing) = attributes.iter_mut().find(|a| a.name.eq_ignore_ascii_case(&attr.name)) else {
        attributes.push(attr);
        return;
    };
    match (&mut existing.value, attr.value) {
        (AttributeValue::Static(current), AttributeValue::Static(extra)) if attr.name == "class" => {
            if !extra.trim().is_empty() {
                current.push(' ');
                current.push_str(extra.trim());
            }
        }
        (AttributeValue::Interpolated(parts), AttributeValue::Static(extra)) if attr.name == "class" => {
            parts.push(ValuePart::Text(format!(" {}", extra.trim())));
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compound_name() {
        assert_eq!(parse_compound_name("Card.Header", "Card"), Some("header".into()));
        assert_eq!(parse_compound_name("Card.Footer", "Card"), Some("footer".into()));
        assert_eq!(parse_compound_name("Other.Header", "Card"), None);
        assert_eq!(parse_compound_name("Card.", "Card"), None);
        assert_eq!(parse_compound_name("Card", "Card"), None);
    }

    #[test]
    fn test_merge_class_attribute() {
        let mut attrs = vec![AttributeIR::new("class", AttributeValue::Static("card".into()))];
        merge_attribute(&mut attrs, AttributeIR::new("class", AttributeValue::Static("wide".into())));
        merge_attribute(&mut attrs, AttributeIR::new("id", AttributeValue::Static("main".into())));
        assert_eq!(attrs[0].value, AttributeValue::Static("card wide".into()));
        assert_eq!(attrs[1].value, AttributeValue::Static("main".into()));
    }
}
