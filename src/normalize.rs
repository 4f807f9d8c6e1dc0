//! Directive Normalization
//!
//! Purely structural rewrite of a parsed document: the page root and layout
//! wrappers are stripped (their attributes kept as metadata), prop blocks and
//! inline component blocks are lifted out, style and script blocks are
//! collected, and scoped styles are rewritten against a per-document scope
//! attribute. No expression is evaluated here.

use crate::css::{scope_attribute, scope_css};
use crate::validate::{
    AttributeIR, AttributeValue, Diagnostic, ElementNode, ErrorKind, SourceLocation, Stage,
    TemplateNode,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentRole {
    Page,
    Component,
    Layout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropsBlock {
    pub source: String,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineComponent {
    pub name: String,
    pub nodes: Vec<TemplateNode>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedDocument {
    pub path: String,
    pub nodes: Vec<TemplateNode>,
    pub title: Option<AttributeValue>,
    pub description: Option<AttributeValue>,
    pub layout: Option<String>,
    pub props: Option<PropsBlock>,
    pub inline_components: Vec<InlineComponent>,
    pub styles: Vec<String>,
    pub scripts: Vec<String>,
    pub scope_attribute: Option<String>,
    pub diagnostics: Vec<Diagnostic>,
}

struct Normalizer<'d> {
    role: DocumentRole,
    doc: &'d mut NormalizedDocument,
    scoped_styles: Vec<String>,
}

/// Normalize the nodes of one document.
pub fn normalize_document(nodes: Vec<TemplateNode>, path: &str, role: DocumentRole) -> NormalizedDocument {
    let mut doc = NormalizedDocument {
        path: path.to_string(),
        ..Default::default()
    };

    let mut normalizer = Normalizer {
        role,
        doc: &mut doc,
        scoped_styles: Vec::new(),
    };
    let mut normalized = normalizer.normalize_nodes(nodes);
    let scoped_styles = std::mem::take(&mut normalizer.scoped_styles);

    if !scoped_styles.is_empty() {
        let attribute = scope_attribute(path);
        for css in &scoped_styles {
            doc.styles.push(scope_css(css, &attribute));
        }
        stamp_scope_attribute(&mut normalized, &attribute);
        doc.scope_attribute = Some(attribute);
    }

    doc.nodes = normalized;
    tracing::debug!(
        path = %path,
        styles = doc.styles.len(),
        scripts = doc.scripts.len(),
        inline_components = doc.inline_components.len(),
        "normalized document"
    );
    doc
}

impl Normalizer<'_> {
    fn diagnose(&mut self, diagnostic: Diagnostic, location: &SourceLocation) {
        let file = self.doc.path.clone();
        self.doc.diagnostics.push(diagnostic.at(&file, location));
    }

    fn normalize_nodes(&mut self, nodes: Vec<TemplateNode>) -> Vec<TemplateNode> {
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            self.normalize_node(node, &mut out);
        }
        out
    }

    fn normalize_node(&mut self, node: TemplateNode, out: &mut Vec<TemplateNode>) {
        match node {
            TemplateNode::Element(el) => self.normalize_element(el, out),
            TemplateNode::Slot(mut slot) => {
                if self.role == DocumentRole::Page {
                    // Nothing can fill a slot on a page; keep a marker only.
                    let marker = match &slot.name {
                        Some(name) => format!(" slot:{} ", name),
                        None => " slot ".to_string(),
                    };
                    out.push(TemplateNode::comment(marker));
                } else {
                    slot.fallback = self.normalize_nodes(slot.fallback);
                    out.push(TemplateNode::Slot(slot));
                }
            }
            mut other => {
                for list in other.child_lists_mut() {
                    let children = std::mem::take(list);
                    *list = self.normalize_nodes(children);
                }
                out.push(other);
            }
        }
    }

    fn normalize_element(&mut self, mut el: ElementNode, out: &mut Vec<TemplateNode>) {
        let tag = el.tag.to_ascii_lowercase();
        match tag.as_str() {
            "n:view" => {
                if self.doc.title.is_some() {
                    self.diagnose(
                        Diagnostic::warning(
                            Stage::Normalize,
                            ErrorKind::StructuralDirective,
                            "Multiple <n:view> roots; the first title wins.",
                        ),
                        &el.location,
                    );
                } else {
                    self.doc.title = take_attribute(&mut el, "title");
                    self.doc.description = take_attribute(&mut el, "description");
                }
                let children = self.normalize_nodes(el.children);
                out.extend(children);
            }
            "n:layout" => {
                match static_name(&el) {
                    Some(name) => {
                        out.push(TemplateNode::comment(format!(" layout:{} ", name)));
                        self.doc.layout = Some(name);
                    }
                    None => self.diagnose(
                        Diagnostic::error(
                            Stage::Normalize,
                            ErrorKind::StructuralDirective,
                            "<n:layout> needs a static `name` attribute.",
                        ),
                        &el.location,
                    ),
                }
                let children = self.normalize_nodes(el.children);
                out.extend(children);
            }
            "n:props" => {
                if self.doc.props.is_some() {
                    self.diagnose(
                        Diagnostic::error(
                            Stage::Normalize,
                            ErrorKind::InvalidPropDeclaration,
                            "Only one <n:props> block is allowed per component.",
                        ),
                        &el.location,
                    );
                    return;
                }
                self.doc.props = Some(PropsBlock {
                    source: element_text(&el),
                    location: el.location.clone(),
                });
            }
            "n:component" => {
                match static_name(&el) {
                    Some(name) => {
                        self.doc.inline_components.push(InlineComponent {
                            name,
                            nodes: el.children,
                            location: el.location,
                        });
                    }
                    None => self.diagnose(
                        Diagnostic::error(
                            Stage::Normalize,
                            ErrorKind::StructuralDirective,
                            "<n:component> needs a static `name` attribute.",
                        ),
                        &el.location,
                    ),
                }
            }
            "style" => {
                let css = element_text(&el);
                if el.attribute("scoped").is_some() {
                    self.scoped_styles.push(css);
                } else if !css.trim().is_empty() {
                    self.doc.styles.push(css);
                }
            }
            "script" if el.attribute("src").is_none() => {
                let js = element_text(&el);
                if !js.trim().is_empty() {
                    self.doc.scripts.push(js);
                }
            }
            _ if tag.starts_with("n:") => {
                self.diagnose(
                    Diagnostic::warning(
                        Stage::Normalize,
                        ErrorKind::StructuralDirective,
                        format!("Unknown directive <{}>; its content is kept.", el.tag),
                    ),
                    &el.location,
                );
                let children = self.normalize_nodes(el.children);
                out.extend(children);
            }
            _ => {
                el.children = self.normalize_nodes(el.children);
                out.push(TemplateNode::Element(el));
            }
        }
    }
}

fn static_name(el: &ElementNode) -> Option<String> {
    el.static_attribute("name")
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
}

fn take_attribute(el: &mut ElementNode, name: &str) -> Option<AttributeValue> {
    let index = el
        .attributes
        .iter()
        .position(|a| a.name.eq_ignore_ascii_case(name))?;
    Some(el.attributes.remove(index).value)
}

/// Concatenated raw text of an element's direct text children.
fn element_text(el: &ElementNode) -> String {
    el.children
        .iter()
        .filter_map(|c| match c {
            TemplateNode::Text(t) => Some(t.value.as_str()),
            _ => None,
        })
        .collect()
}

/// Mark every element of a document with its scope attribute.
pub fn stamp_scope_attribute(nodes: &mut [TemplateNode], attribute: &str) {
    for node in nodes.iter_mut() {
        if let TemplateNode::Element(el) = node {
            if el.attribute(attribute).is_none() {
                el.attributes
                    .push(AttributeIR::new(attribute, AttributeValue::Boolean));
            }
        }
        for list in node.child_lists_mut() {
            stamp_scope_attribute(list, attribute);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_template;

    fn normalize(src: &str, role: DocumentRole) -> NormalizedDocument {
        let parsed = parse_template(src, "test.ncl");
        assert!(parsed.diagnostics.is_empty(), "{:?}", parsed.diagnostics);
        normalize_document(parsed.nodes, "test.ncl", role)
    }

    #[test]
    fn test_view_wrapper_is_stripped() {
        let doc = normalize(
            r#"<n:view title="Home" description="Welcome"><h1>Hi</h1></n:view>"#,
            DocumentRole::Page,
        );
        assert_eq!(doc.title, Some(AttributeValue::Static("Home".into())));
        assert_eq!(doc.description, Some(AttributeValue::Static("Welcome".into())));
        assert_eq!(doc.nodes.len(), 1);
        assert!(matches!(&doc.nodes[0], TemplateNode::Element(e) if e.tag == "h1"));
    }

    #[test]
    fn test_layout_becomes_marker() {
        let doc = normalize(r#"<n:layout name="main"><p>x</p></n:layout>"#, DocumentRole::Page);
        assert_eq!(doc.layout.as_deref(), Some("main"));
        assert!(matches!(&doc.nodes[0], TemplateNode::Comment(c) if c.value == " layout:main "));
    }

    #[test]
    fn test_props_and_components_are_lifted() {
        let doc = normalize(
            "<n:props>\nlabel: String\n</n:props><n:component name=\"Badge\"><b>hi</b></n:component><div></div>",
            DocumentRole::Component,
        );
        assert_eq!(doc.props.as_ref().map(|p| p.source.trim()), Some("label: String"));
        assert_eq!(doc.inline_components.len(), 1);
        assert_eq!(doc.inline_components[0].name, "Badge");
        assert_eq!(doc.nodes.len(), 1);
    }

    #[test]
    fn test_page_slots_become_markers() {
        let doc = normalize(r#"<main><slot name="aside"/></main>"#, DocumentRole::Page);
        let TemplateNode::Element(main) = &doc.nodes[0] else {
            panic!("expected element");
        };
        assert!(matches!(&main.children[0], TemplateNode::Comment(c) if c.value == " slot:aside "));
    }

    #[test]
    fn test_scoped_style_stamps_elements() {
        let doc = normalize(
            "<style scoped>.card { color: red; }</style><div class=\"card\"><p>x</p></div>",
            DocumentRole::Component,
        );
        let attribute = doc.scope_attribute.clone().unwrap();
        assert!(doc.styles[0].contains(&format!(".card[{}]", attribute)));
        let TemplateNode::Element(div) = &doc.nodes[0] else {
            panic!("expected element");
        };
        assert!(div.attribute(&attribute).is_some());
        let TemplateNode::Element(p) = &div.children[0] else {
            panic!("expected element");
        };
        assert!(p.attribute(&attribute).is_some());
    }

    #[test]
    fn test_unknown_directive_warns_and_unwraps() {
        let doc = normalize("<n:frobnicate><p>kept</p></n:frobnicate>", DocumentRole::Page);
        assert_eq!(doc.diagnostics.len(), 1);
        assert_eq!(doc.diagnostics[0].kind, ErrorKind::StructuralDirective);
        assert!(matches!(&doc.nodes[0], TemplateNode::Element(e) if e.tag == "p"));
    }
}
