//! Component Discovery
//!
//! Builds the `ComponentRegistry` for one compile pass from the full
//! document set. Component files (PascalCase stems), `layouts/` documents and
//! inline `<n:component>` blocks all become definitions; everything else is a
//! page. The registry is an explicit value handed to the expander, never a
//! global.

use crate::cache::CacheTable;
use crate::document::SourceDocument;
use crate::normalize::{
    normalize_document, DocumentRole, InlineComponent, NormalizedDocument, PropsBlock,
};
use crate::parse::{is_component_tag, parse_template, ParsedTemplate};
use crate::pipeline::CompileError;
use crate::static_eval::{parse_literal, render_number, render_scalar};
use crate::validate::{
    walk_nodes, Diagnostic, ErrorKind, SourceLocation, Stage, TemplateNode,
};
use lazy_static::lazy_static;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

lazy_static! {
    static ref PROP_LINE: Regex =
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*:\s*([^=]+?)\s*(?:=\s*(.+))?$").unwrap();
}

pub const TEMPLATE_EXTENSION: &str = "ncl";

// ═══════════════════════════════════════════════════════════════════════════════
// PROP SCHEMA
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropType {
    String,
    Bool,
    Int,
    Float,
    Any,
}

impl PropType {
    /// Parse a declared type. The flag is true for `Option<T>`.
    pub fn parse(declared: &str) -> Option<(PropType, bool)> {
        let declared = declared.trim();
        if let Some(inner) = declared
            .strip_prefix("Option<")
            .and_then(|rest| rest.strip_suffix('>'))
        {
            return PropType::parse(inner).map(|(ty, _)| (ty, true));
        }
        let ty = match declared {
            "String" | "string" | "str" | "&str" | "&'static str" => PropType::String,
            "bool" | "boolean" => PropType::Bool,
            "i8" | "i16" | "i32" | "i64" | "i128" | "isize" | "u8" | "u16" | "u32" | "u64"
            | "u128" | "usize" | "int" => PropType::Int,
            "f32" | "f64" | "float" | "number" => PropType::Float,
            "Any" | "Value" | "serde_json::Value" | "Array" | "Object" | "object" => PropType::Any,
            other if other.starts_with("Vec<") || other.starts_with("HashMap<") => PropType::Any,
            _ => return None,
        };
        Some((ty, false))
    }

    pub fn name(self) -> &'static str {
        match self {
            PropType::String => "String",
            PropType::Bool => "bool",
            PropType::Int => "integer",
            PropType::Float => "number",
            PropType::Any => "any",
        }
    }

    /// Coerce attribute text to this type.
    pub fn coerce_str(self, raw: &str) -> Result<Value, String> {
        match self {
            PropType::String => Ok(Value::String(raw.to_string())),
            PropType::Bool => match raw.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                other => Err(format!("expected `true` or `false`, got `{}`", other)),
            },
            PropType::Int => raw
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("expected an integer, got `{}`", raw.trim())),
            PropType::Float => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("expected a number, got `{}`", raw.trim())),
            PropType::Any => Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))),
        }
    }

    /// Coerce an evaluated value to this type.
    pub fn coerce_value(self, value: Value) -> Result<Value, String> {
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (PropType::Any, value) => Ok(value),
            (PropType::String, value) => render_scalar(&value)
                .map(Value::String)
                .ok_or_else(|| "expected a string, got a collection".to_string()),
            (PropType::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
            (PropType::Int, Value::Number(n)) => match n.as_i64() {
                Some(i) => Ok(Value::from(i)),
                None => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 => Ok(Value::from(f as i64)),
                    _ => Err(format!("expected an integer, got `{}`", render_number(&n))),
                },
            },
            (PropType::Float, Value::Number(n)) => Ok(Value::Number(n)),
            (ty, Value::String(s)) => ty.coerce_str(&s),
            (ty, other) => Err(format!("expected {}, got `{}`", ty.name(), other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropDefinition {
    pub name: String,
    pub ty: PropType,
    pub default: Option<Value>,
    #[serde(default)]
    pub optional: bool,
}

impl PropDefinition {
    pub fn is_required(&self) -> bool {
        self.default.is_none() && !self.optional
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotDefinition {
    pub name: Option<String>, // None = default slot
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDefinition {
    pub name: String,
    pub path: String,
    pub props: Vec<PropDefinition>,
    pub slots: Vec<SlotDefinition>,
    pub nodes: Vec<TemplateNode>,
    #[serde(default)]
    pub styles: Vec<String>,
    #[serde(default)]
    pub scripts: Vec<String>,
}

impl ComponentDefinition {
    pub fn prop(&self, name: &str) -> Option<&PropDefinition> {
        self.props.iter().find(|p| p.name == name)
    }

    pub fn has_slot(&self, name: Option<&str>) -> bool {
        self.slots.iter().any(|s| s.name.as_deref() == name)
    }
}

/// Parse the body of an `<n:props>` block, one declaration per line.
pub fn parse_props_block(block: &PropsBlock, file: &str) -> (Vec<PropDefinition>, Vec<Diagnostic>) {
    let mut props: Vec<PropDefinition> = Vec::new();
    let mut diagnostics = Vec::new();

    for (offset, raw_line) in block.source.lines().enumerate() {
        let line = raw_line.split("//").next().unwrap_or_default();
        let line = line.trim().trim_end_matches([',', ';']).trim();
        if line.is_empty() {
            continue;
        }
        let location = SourceLocation::new(block.location.line + offset as u32, 1);
        let mut report = |message: String| {
            diagnostics.push(
                Diagnostic::error(Stage::Discovery, ErrorKind::InvalidPropDeclaration, message)
                    .at(file, &location),
            );
        };

        let Some(caps) = PROP_LINE.captures(line) else {
            report(format!("Invalid prop declaration `{}`.", line));
            continue;
        };
        let name = caps[1].to_string();
        let Some((ty, optional)) = PropType::parse(&caps[2]) else {
            report(format!("Unknown type `{}` for prop `{}`.", caps[2].trim(), name));
            continue;
        };
        if props.iter().any(|p| p.name == name) {
            report(format!("Prop `{}` is declared twice.", name));
            continue;
        }

        let default = match caps.get(3).map(|m| m.as_str().trim()) {
            None => None,
            Some("None") if optional => Some(Value::Null),
            Some(raw) => match parse_default(ty, raw) {
                Ok(value) => Some(value),
                Err(reason) => {
                    report(format!("Default for `{}` does not match its type: {}.", name, reason));
                    continue;
                }
            },
        };

        props.push(PropDefinition {
            name,
            ty,
            default,
            optional,
        });
    }

    (props, diagnostics)
}

fn parse_default(ty: PropType, raw: &str) -> Result<Value, String> {
    match parse_literal(raw) {
        Some(Value::String(s)) => ty.coerce_str(&s),
        Some(value) => ty.coerce_value(value),
        None => ty.coerce_str(raw),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REGISTRY
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentRegistry {
    components: BTreeMap<String, ComponentDefinition>,
    layouts: BTreeMap<String, ComponentDefinition>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false (and keeps the existing one) if the name is taken.
    pub fn register(&mut self, def: ComponentDefinition) -> bool {
        if self.components.contains_key(&def.name) {
            return false;
        }
        self.components.insert(def.name.clone(), def);
        true
    }

    pub fn register_layout(&mut self, def: ComponentDefinition) -> bool {
        if self.layouts.contains_key(&def.name) {
            return false;
        }
        self.layouts.insert(def.name.clone(), def);
        true
    }

    /// Exact match first, then case-insensitive.
    pub fn get(&self, name: &str) -> Option<&ComponentDefinition> {
        self.components.get(name).or_else(|| {
            let lower = name.to_lowercase();
            self.components
                .iter()
                .find(|(k, _)| k.to_lowercase() == lower)
                .map(|(_, v)| v)
        })
    }

    pub fn layout(&self, name: &str) -> Option<&ComponentDefinition> {
        self.layouts.get(name)
    }

    pub fn component_names(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DISCOVERY
// ═══════════════════════════════════════════════════════════════════════════════

/// A page document, parsed but not yet normalized.
#[derive(Debug, Clone)]
pub struct PageSource {
    pub path: String,
    pub nodes: Vec<TemplateNode>,
    pub stylesheet: Option<String>,
    pub script: Option<String>,
}

#[derive(Debug, Default)]
pub struct Discovery {
    pub registry: ComponentRegistry,
    pub pages: Vec<PageSource>,
    pub diagnostics: Vec<Diagnostic>,
    /// Parse results of this pass, keyed by document hash.
    pub parsed: CacheTable,
}

pub fn document_role(doc: &SourceDocument) -> DocumentRole {
    if doc.in_directory("layouts") {
        DocumentRole::Layout
    } else if is_component_tag(doc.stem()) {
        DocumentRole::Component
    } else {
        DocumentRole::Page
    }
}

/// Parse every document (in parallel, reusing `cached` entries) and build the
/// registry. Document order does not affect the result.
pub fn discover(documents: &[SourceDocument], cached: &CacheTable) -> Discovery {
    let mut sorted: Vec<&SourceDocument> = documents.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let parsed: Vec<(String, ParsedTemplate)> = sorted
        .par_iter()
        .map(|doc| {
            let hash = crate::cache::DefinitionCache::compute_hash(doc);
            let template = match cached.get(&hash) {
                Some(hit) => hit.clone(),
                None => parse_template(&doc.markup, &doc.path),
            };
            (hash, template)
        })
        .collect();

    let mut discovery = Discovery::default();
    for (doc, (hash, template)) in sorted.iter().zip(parsed) {
        discovery.diagnostics.extend(template.diagnostics.iter().cloned());
        let nodes = template.nodes.clone();
        discovery.parsed.insert(hash, template);

        match document_role(doc) {
            DocumentRole::Component => {
                let normalized = normalize_document(nodes, &doc.path, DocumentRole::Component);
                let name = doc.stem().to_string();
                add_definition(&mut discovery, name, normalized, doc, false);
            }
            DocumentRole::Layout => {
                let normalized = normalize_document(nodes, &doc.path, DocumentRole::Layout);
                let name = doc.stem().to_string();
                add_definition(&mut discovery, name, normalized, doc, true);
            }
            DocumentRole::Page => {
                let mut nodes = nodes;
                for inline in take_inline_components(&mut nodes) {
                    add_inline_component(&mut discovery, &doc.path, inline);
                }
                discovery.pages.push(PageSource {
                    path: doc.path.clone(),
                    nodes,
                    stylesheet: doc.stylesheet.clone(),
                    script: doc.script.clone(),
                });
            }
        }
    }

    tracing::info!(
        components = discovery.registry.len(),
        pages = discovery.pages.len(),
        "component discovery finished"
    );
    discovery
}

fn add_definition(
    discovery: &mut Discovery,
    name: String,
    mut normalized: NormalizedDocument,
    doc: &SourceDocument,
    is_layout: bool,
) {
    for inline in std::mem::take(&mut normalized.inline_components) {
        add_inline_component(discovery, &doc.path, inline);
    }

    let mut def = build_definition(name, &mut normalized, &mut discovery.diagnostics);
    def.styles.extend(doc.stylesheet.iter().cloned());
    def.scripts.extend(doc.script.iter().cloned());

    let registered = if is_layout {
        discovery.registry.register_layout(def)
    } else {
        discovery.registry.register(def)
    };
    if !registered {
        discovery.diagnostics.push(duplicate_definition(&doc.path, doc.stem()));
    }
}

/// Inline blocks get their own scope attribute (`path#Name`).
fn add_inline_component(discovery: &mut Discovery, path: &str, inline: InlineComponent) {
    let inline_path = format!("{}#{}", path, inline.name);
    let mut normalized = normalize_document(inline.nodes, &inline_path, DocumentRole::Component);
    let def = build_definition(inline.name.clone(), &mut normalized, &mut discovery.diagnostics);
    if !discovery.registry.register(def) {
        discovery.diagnostics.push(duplicate_definition(path, &inline.name));
    }
}

fn duplicate_definition(path: &str, name: &str) -> Diagnostic {
    Diagnostic::warning(
        Stage::Discovery,
        ErrorKind::StructuralDirective,
        format!("Component `{}` is defined more than once; the first definition is used.", name),
    )
    .in_file(path)
}

/// Remove `<n:component name>` blocks from a page tree.
fn take_inline_components(nodes: &mut Vec<TemplateNode>) -> Vec<InlineComponent> {
    let mut found = Vec::new();
    let mut kept = Vec::with_capacity(nodes.len());
    for mut node in std::mem::take(nodes) {
        if let TemplateNode::Element(el) = node {
            let name = el
                .static_attribute("name")
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty());
            match name {
                Some(name) if el.tag.eq_ignore_ascii_case("n:component") => {
                    found.push(InlineComponent {
                        name,
                        nodes: el.children,
                        location: el.location,
                    });
                    continue;
                }
                _ => node = TemplateNode::Element(el),
            }
        }
        for list in node.child_lists_mut() {
            found.extend(take_inline_components(list));
        }
        kept.push(node);
    }
    *nodes = kept;
    found
}

fn build_definition(
    name: String,
    normalized: &mut NormalizedDocument,
    diagnostics: &mut Vec<Diagnostic>,
) -> ComponentDefinition {
    diagnostics.append(&mut normalized.diagnostics);

    let props = match &normalized.props {
        Some(block) => {
            let (props, diags) = parse_props_block(block, &normalized.path);
            diagnostics.extend(diags);
            props
        }
        None => Vec::new(),
    };

    let nodes = std::mem::take(&mut normalized.nodes);
    let slots = collect_slots(&nodes, &normalized.path, diagnostics);

    ComponentDefinition {
        name,
        path: normalized.path.clone(),
        props,
        slots,
        nodes,
        styles: std::mem::take(&mut normalized.styles),
        scripts: std::mem::take(&mut normalized.scripts),
    }
}

fn collect_slots(nodes: &[TemplateNode], file: &str, diagnostics: &mut Vec<Diagnostic>) -> Vec<SlotDefinition> {
    let mut slots: Vec<SlotDefinition> = Vec::new();
    walk_nodes(nodes, &mut |node| {
        if let TemplateNode::Slot(slot) = node {
            if slots.iter().any(|s| s.name == slot.name) {
                let label = match &slot.name {
                    Some(name) => format!("slot `{}`", name),
                    None => "default slot".to_string(),
                };
                diagnostics.push(
                    Diagnostic::error(
                        Stage::Discovery,
                        ErrorKind::DuplicateSlot,
                        format!("The {} is declared more than once.", label),
                    )
                    .at(file, &slot.location),
                );
            } else {
                slots.push(SlotDefinition {
                    name: slot.name.clone(),
                    location: slot.location.clone(),
                });
            }
        }
    });
    slots
}

// ═══════════════════════════════════════════════════════════════════════════════
// FILESYSTEM
// ═══════════════════════════════════════════════════════════════════════════════

/// Load every `.ncl` file under `root`, with sibling `.css`/`.js` files
/// attached. Paths are relative to `root` with `/` separators, sorted.
pub fn discover_documents(root: &Path) -> Result<Vec<SourceDocument>, CompileError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(|e| CompileError::Walk {
            path: root.display().to_string(),
            message: e.to_string(),
        })?;
        let path = entry.path();
        if entry.file_type().is_file()
            && path.extension().and_then(|e| e.to_str()) == Some(TEMPLATE_EXTENSION)
        {
            files.push(path.to_path_buf());
        }
    }
    files.sort();

    let documents = files
        .par_iter()
        .map(|path| {
            let markup = std::fs::read_to_string(path).map_err(|source| CompileError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let sibling = |ext: &str| std::fs::read_to_string(path.with_extension(ext)).ok();
            let relative = path
                .strip_prefix(root)
                .unwrap_or(path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            Ok(SourceDocument {
                path: relative,
                markup,
                stylesheet: sibling("css"),
                script: sibling("js"),
            })
        })
        .collect::<Result<Vec<_>, CompileError>>()?;

    tracing::info!(root = %root.display(), documents = documents.len(), "loaded template documents");
    Ok(documents)
}
