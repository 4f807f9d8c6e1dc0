//! Finalize Module for the NCL Compiler
//!
//! Renders the expanded node tree to HTML and wraps it in a full document
//! with the aggregated styles, scripts and island runtime.

use crate::parse::is_void_element;
use crate::validate::{walk_nodes, AttributeIR, AttributeValue, ErrorNode, TemplateNode, ValuePart};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref ENTITY: Regex = Regex::new(r"&(#x[0-9a-fA-F]+|#[0-9]+|amp|lt|gt|quot|apos);").unwrap();
    static ref SCRIPT_CLOSE: Regex = Regex::new(r"(?i)</(script)").unwrap();
}

/// Default rule for inline error blocks, included once when any is rendered.
pub const ERROR_BLOCK_CSS: &str = ".ncl-error{display:block;margin:.5rem 0;padding:.5rem .75rem;border:1px solid #d33;border-radius:4px;background:#fff1f1;color:#8a1010;font:14px/1.4 ui-monospace,monospace;white-space:pre-wrap}";

// ═══════════════════════════════════════════════════════════════════════════════
// ESCAPING
// ═══════════════════════════════════════════════════════════════════════════════

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Quote-only escaping for attribute text that is already HTML-ready.
pub fn escape_attr(text: &str) -> String {
    text.replace('"', "&quot;")
}

/// Inverse of `escape_html` plus numeric character references. Unknown
/// entities are left as written.
pub fn unescape_html(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    ENTITY
        .replace_all(text, |caps: &regex::Captures| {
            let entity = &caps[1];
            let decoded = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ if entity.starts_with("#x") => u32::from_str_radix(&entity[2..], 16).ok().and_then(char::from_u32),
                _ => entity[1..].parse::<u32>().ok().and_then(char::from_u32),
            };
            match decoded {
                Some(c) => c.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

// ═══════════════════════════════════════════════════════════════════════════════
// RENDERING
// ═══════════════════════════════════════════════════════════════════════════════

pub fn render_nodes(nodes: &[TemplateNode]) -> String {
    let mut out = String::new();
    for node in nodes {
        render_node(node, &mut out);
    }
    out
}

fn render_node(node: &TemplateNode, out: &mut String) {
    match node {
        TemplateNode::Element(el) => {
            out.push('<');
            out.push_str(&el.tag);
            render_attributes(&el.attributes, out);
            out.push('>');
            if is_void_element(&el.tag) {
                return;
            }
            for child in &el.children {
                render_node(child, out);
            }
            out.push_str("</");
            out.push_str(&el.tag);
            out.push('>');
        }
        TemplateNode::Text(text) => out.push_str(&text.value),
        TemplateNode::Expression(expr) => out.push_str(&escape_html(&expr.raw)),
        TemplateNode::Comment(comment) => {
            out.push_str("<!--");
            out.push_str(&comment.value.replace("--", "- -"));
            out.push_str("-->");
        }
        TemplateNode::Doctype(doctype) => {
            out.push_str("<!");
            out.push_str(&doctype.value);
            out.push('>');
        }
        TemplateNode::Error(error) => out.push_str(&render_error_block(error)),
        TemplateNode::Slot(slot) => {
            for child in &slot.fallback {
                render_node(child, out);
            }
        }
        TemplateNode::Island(island) => {
            for child in &island.children {
                render_node(child, out);
            }
        }
        TemplateNode::Scoped(scoped) => {
            for child in &scoped.children {
                render_node(child, out);
            }
        }
        TemplateNode::CallerScope(caller) => {
            for child in &caller.children {
                render_node(child, out);
            }
        }
        // Reported by `verify_output`.
        TemplateNode::Component(_) | TemplateNode::Loop(_) | TemplateNode::Conditional(_) => {}
    }
}

fn render_attributes(attributes: &[AttributeIR], out: &mut String) {
    for attr in attributes {
        match &attr.value {
            AttributeValue::Boolean => {
                out.push(' ');
                out.push_str(&attr.name);
            }
            AttributeValue::Static(value) => {
                out.push_str(&format!(" {}=\"{}\"", attr.name, escape_attr(value)));
            }
            AttributeValue::Interpolated(parts) => {
                let raw: String = parts
                    .iter()
                    .map(|part| match part {
                        ValuePart::Text(text) => text.clone(),
                        ValuePart::Expression(code) => escape_html(&format!("{{{}}}", code)),
                    })
                    .collect();
                out.push_str(&format!(" {}=\"{}\"", attr.name, escape_attr(&raw)));
            }
            AttributeValue::Expression(code) => {
                out.push_str(&format!(" {}=\"{}\"", attr.name, escape_html(&format!("{{{}}}", code))));
            }
        }
    }
}

pub fn render_error_block(error: &ErrorNode) -> String {
    format!(
        "<div class=\"ncl-error\" data-ncl-error=\"{}\" role=\"alert\"><strong>{}</strong>: {}</div>",
        error.kind.code(),
        error.kind.name(),
        escape_html(&error.message)
    )
}

pub fn contains_error_block(nodes: &[TemplateNode]) -> bool {
    let mut found = false;
    walk_nodes(nodes, &mut |node| {
        if matches!(node, TemplateNode::Error(_)) {
            found = true;
        }
    });
    found
}

/// Drop top-level doctype nodes; the assembled document supplies its own.
pub fn strip_doctype(nodes: &mut Vec<TemplateNode>) {
    nodes.retain(|node| !matches!(node, TemplateNode::Doctype(_)));
}

// ═══════════════════════════════════════════════════════════════════════════════
// ASSEMBLY
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything that goes around the rendered body. Title and description are
/// HTML-ready text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentShell {
    pub lang: String,
    pub title: String,
    /// False when `title` is the configured fallback; no `og:title` then.
    pub page_title: bool,
    pub description: Option<String>,
    pub stylesheets: Vec<String>,
    pub css: String,
    pub scripts: Vec<String>,
    /// Aggregated inline scripts followed by the island runtime.
    pub inline_script: String,
}

/// Neutralize the sequences that end or comment out a `<script>` element.
/// Everything else, `<` comparisons included, is left as written.
pub fn escape_inline_script(js: &str) -> String {
    SCRIPT_CLOSE.replace_all(js, "<\\/$1").replace("<!--", "<\\!--")
}

pub fn assemble_document(shell: &DocumentShell, body: &str) -> String {
    let mut html = String::with_capacity(body.len() + shell.css.len() + shell.inline_script.len() + 512);
    html.push_str("<!DOCTYPE html>\n");
    html.push_str(&format!("<html lang=\"{}\">\n<head>\n", escape_html(&shell.lang)));
    html.push_str("<meta charset=\"utf-8\">\n");
    html.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    html.push_str(&format!("<title>{}</title>\n", shell.title));
    if shell.page_title {
        html.push_str(&format!("<meta property=\"og:title\" content=\"{}\">\n", escape_attr(&shell.title)));
    }
    if let Some(description) = &shell.description {
        html.push_str(&format!("<meta name=\"description\" content=\"{}\">\n", escape_attr(description)));
        html.push_str(&format!("<meta property=\"og:description\" content=\"{}\">\n", escape_attr(description)));
    }
    for href in &shell.stylesheets {
        html.push_str(&format!("<link rel=\"stylesheet\" href=\"{}\">\n", escape_html(href)));
    }
    if !shell.css.trim().is_empty() {
        html.push_str("<style>\n");
        html.push_str(&shell.css.replace("</style", "<\\/style"));
        html.push_str("\n</style>\n");
    }
    html.push_str("</head>\n<body>\n");
    html.push_str(body);
    if !body.ends_with('\n') {
        html.push('\n');
    }
    for src in &shell.scripts {
        html.push_str(&format!("<script src=\"{}\"></script>\n", escape_html(src)));
    }
    if !shell.inline_script.trim().is_empty() {
        html.push_str("<script type=\"module\">\n");
        html.push_str(&escape_inline_script(&shell.inline_script));
        html.push_str("\n</script>\n");
    }
    html.push_str("</body>\n</html>\n");
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::{ElementNode, ErrorKind, SourceLocation};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_escape_round_trip() {
        let raw = r#"<a href="x">Tom & 'Jerry'</a>"#;
        let escaped = escape_html(raw);
        assert_eq!(escaped, "&lt;a href=&quot;x&quot;&gt;Tom &amp; &#39;Jerry&#39;&lt;/a&gt;");
        assert_eq!(unescape_html(&escaped), raw);
        assert_eq!(unescape_html("&#x41;&#66;&nbsp;"), "AB&nbsp;");
    }

    #[test]
    fn test_render_elements_and_attributes() {
        let nodes = vec![TemplateNode::Element(ElementNode {
            tag: "p".into(),
            attributes: vec![
                AttributeIR::new("class", AttributeValue::Static("a \"b\"".into())),
                AttributeIR::new("hidden", AttributeValue::Boolean),
            ],
            children: vec![
                TemplateNode::text("Hi"),
                TemplateNode::Element(ElementNode {
                    tag: "br".into(),
                    attributes: vec![],
                    children: vec![],
                    self_closing: true,
                    location: SourceLocation::default(),
                }),
            ],
            self_closing: false,
            location: SourceLocation::default(),
        })];
        assert_eq!(render_nodes(&nodes), "<p class=\"a &quot;b&quot;\" hidden>Hi<br></p>");
    }

    #[test]
    fn test_error_block() {
        let nodes = vec![TemplateNode::error(
            ErrorKind::MissingRequiredProp,
            "Missing required prop `title` on <Card>.",
            SourceLocation::default(),
        )];
        assert!(contains_error_block(&nodes));
        assert_eq!(
            render_nodes(&nodes),
            "<div class=\"ncl-error\" data-ncl-error=\"NCL002\" role=\"alert\"><strong>MissingRequiredPropError</strong>: Missing required prop `title` on &lt;Card&gt;.</div>"
        );
    }

    #[test]
    fn test_assemble_document() {
        let shell = DocumentShell {
            lang: "en".into(),
            title: "Home".into(),
            page_title: true,
            description: Some("Welcome".into()),
            stylesheets: vec!["/site.css".into()],
            css: "p{color:red}".into(),
            scripts: vec!["/app.js".into()],
            inline_script: "console.log(\"</script>\")".into(),
        };
        let html = assemble_document(&shell, "<p>Hi</p>");
        assert!(html.starts_with("<!DOCTYPE html>\n<html lang=\"en\">"));
        assert!(html.contains("<title>Home</title>"));
        assert!(html.contains("<meta property=\"og:title\" content=\"Home\">"));
        assert!(html.contains("<meta name=\"description\" content=\"Welcome\">"));
        assert!(html.contains("<link rel=\"stylesheet\" href=\"/site.css\">"));
        assert!(html.contains("<style>\np{color:red}\n</style>"));
        assert!(html.contains("<body>\n<p>Hi</p>\n<script src=\"/app.js\"></script>"));
        assert!(html.contains("console.log(\"<\\/script>\")"));
        assert!(html.ends_with("</body>\n</html>\n"));
    }

    #[test]
    fn test_inline_script_keeps_comparisons_valid() {
        let js = "let a = 4;\nconsole.log(a</b/.test(\"b\"), \"</SCRIPT>\", \"<!--\");";
        let escaped = escape_inline_script(js);
        assert!(escaped.contains("a</b/.test"));
        assert!(escaped.contains("\"<\\/SCRIPT>\""));
        assert!(escaped.contains("\"<\\!--\""));
        assert!(crate::codegen::verify_script(&escaped).is_ok());

        let shell = DocumentShell {
            lang: "en".into(),
            title: "Untitled".into(),
            page_title: false,
            description: None,
            stylesheets: Vec::new(),
            css: String::new(),
            scripts: Vec::new(),
            inline_script: js.into(),
        };
        let html = assemble_document(&shell, "");
        let start = html.find("<script type=\"module\">\n").unwrap() + 23;
        let end = html.rfind("\n</script>").unwrap();
        assert_eq!(html.matches("</script>").count(), 1);
        assert!(crate::codegen::verify_script(&html[start..end]).is_ok());
        assert!(!html.contains("og:title"));
    }
}
