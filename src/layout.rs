//! Layout Application
//!
//! A page that references a layout is placed into the layout's default slot.
//! Named slots of the layout render their fallback content.

use crate::discovery::ComponentRegistry;
use crate::validate::{Diagnostic, ErrorKind, Stage, TemplateNode};

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutResult {
    pub nodes: Vec<TemplateNode>,
    /// Styles and scripts of the layout that was applied.
    pub styles: Vec<String>,
    pub scripts: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Wrap `page` in the layout called `name`. An unknown layout leaves the page
/// standalone with a warning.
pub fn apply_layout(registry: &ComponentRegistry, name: &str, page: Vec<TemplateNode>, file: &str) -> LayoutResult {
    let Some(layout) = registry.layout(name) else {
        tracing::warn!(layout = %name, file = %file, "layout not found, rendering page standalone");
        return LayoutResult {
            nodes: page,
            styles: Vec::new(),
            scripts: Vec::new(),
            diagnostics: vec![Diagnostic::warning(
                Stage::Normalize,
                ErrorKind::StructuralDirective,
                format!("Layout `{}` was not found; the page renders without it.", name),
            )
            .in_file(file)],
        };
    };

    let mut page = Some(page);
    let nodes = fill_slots(layout.nodes.clone(), &mut page);
    let mut diagnostics = Vec::new();
    if page.is_some() {
        diagnostics.push(
            Diagnostic::warning(
                Stage::Normalize,
                ErrorKind::SlotNotFound,
                format!("Layout `{}` has no default slot; the page content is dropped.", name),
            )
            .in_file(file),
        );
    }
    tracing::debug!(layout = %name, file = %file, "layout applied");

    LayoutResult {
        nodes,
        styles: layout.styles.clone(),
        scripts: layout.scripts.clone(),
        diagnostics,
    }
}

/// The first default slot takes the page; every other slot falls back.
fn fill_slots(nodes: Vec<TemplateNode>, page: &mut Option<Vec<TemplateNode>>) -> Vec<TemplateNode> {
    let mut out = Vec::with_capacity(nodes.len());
    for mut node in nodes {
        match node {
            TemplateNode::Slot(slot) => match (&slot.name, page.take()) {
                (None, Some(content)) => out.extend(content),
                (_, taken) => {
                    *page = taken;
                    out.extend(fill_slots(slot.fallback, page));
                }
            },
            _ => {
                for list in node.child_lists_mut() {
                    let children = std::mem::take(list);
                    *list = fill_slots(children, page);
                }
                out.push(node);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheTable;
    use crate::discovery::discover;
    use crate::document::SourceDocument;
    use crate::finalize::render_nodes;

    #[test]
    fn test_page_fills_default_slot() {
        let docs = vec![SourceDocument::new(
            "layouts/Main.ncl",
            "<main><header><slot name=\"nav\">Home</slot></header><slot/></main>",
        )];
        let discovery = discover(&docs, &CacheTable::default());
        let result = apply_layout(&discovery.registry, "Main", vec![TemplateNode::text("<p>Body</p>")], "index.ncl");
        assert!(result.diagnostics.is_empty());
        assert_eq!(
            render_nodes(&result.nodes),
            "<main><header>Home</header><p>Body</p></main>"
        );
    }

    #[test]
    fn test_missing_layout_renders_standalone() {
        let registry = ComponentRegistry::new();
        let result = apply_layout(&registry, "Missing", vec![TemplateNode::text("x")], "index.ncl");
        assert_eq!(render_nodes(&result.nodes), "x");
        assert_eq!(result.diagnostics.len(), 1);
        assert!(!result.diagnostics[0].is_error());
    }
}
