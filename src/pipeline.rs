//! Compile Pipeline
//!
//! Fixed stage order: discovery, normalization (plus layout), component
//! expansion, control flow, interpolation, island extraction, hydration
//! script generation, verification and assembly. Stages report diagnostics
//! and render fallbacks; only strict mode turns diagnostics into a failure.

use crate::cache::DefinitionCache;
use crate::codegen::generate_hydration_script;
use crate::component::{expand_components, DEFAULT_MAX_DEPTH};
use crate::discovery::{discover, PageSource};
use crate::document::{CompiledOutput, SourceDocument};
use crate::finalize::{
    assemble_document, contains_error_block, escape_html, render_nodes, strip_doctype,
    unescape_html, DocumentShell, ERROR_BLOCK_CSS,
};
use crate::interpolate::{resolve_interpolations, resolve_metadata};
use crate::island::extract_islands;
use crate::layout::apply_layout;
use crate::normalize::{normalize_document, DocumentRole};
use crate::scope::DataContext;
use crate::transform::expand_control_flow;
use crate::validate::{verify_output, Diagnostic, ErrorKind, Stage};
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// OPTIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// How unresolved interpolation targets are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompileMode {
    /// Preview use: unresolved expressions pass through as written.
    #[default]
    Lenient,
    /// Deployable output: unresolved expressions are errors and any
    /// diagnostic fails the build.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompileOptions {
    pub mode: CompileMode,
    /// Path of the page to render. Defaults to the first page by path.
    pub entry: Option<String>,
    pub max_component_depth: u32,
    /// External stylesheet links injected into `<head>`.
    pub stylesheets: Vec<String>,
    /// External scripts injected before `</body>`.
    pub scripts: Vec<String>,
    pub lang: String,
    pub default_title: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            mode: CompileMode::Lenient,
            entry: None,
            max_component_depth: DEFAULT_MAX_DEPTH,
            stylesheets: Vec::new(),
            scripts: Vec::new(),
            lang: "en".to_string(),
            default_title: "Untitled".to_string(),
        }
    }
}

impl CompileOptions {
    /// Empty input means defaults.
    pub fn from_json(json: &str) -> Result<Self, CompileError> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(json).map_err(|e| CompileError::InvalidOptions(e.to_string()))
    }

    pub fn strict() -> Self {
        Self {
            mode: CompileMode::Strict,
            ..Self::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// Strict builds fail with every diagnostic of the pass.
    #[error("{}", summarize(.0))]
    Diagnostics(Vec<Diagnostic>),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to walk {path}: {message}")]
    Walk { path: String, message: String },
    #[error("invalid compile options: {0}")]
    InvalidOptions(String),
    #[error("invalid data context: {0}")]
    InvalidData(String),
}

fn summarize(diagnostics: &[Diagnostic]) -> String {
    let mut message = format!("compilation failed with {} diagnostic(s)", diagnostics.len());
    for diagnostic in diagnostics {
        message.push_str("\n  ");
        message.push_str(&diagnostic.to_string());
    }
    message
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILER
// ═══════════════════════════════════════════════════════════════════════════════

/// A compiler instance keeps its parse cache across passes. Each pass is
/// otherwise independent.
#[derive(Debug, Default)]
pub struct Compiler {
    options: CompileOptions,
    cache: DefinitionCache,
}

impl Compiler {
    pub fn new(options: CompileOptions) -> Self {
        Self {
            options,
            cache: DefinitionCache::new(),
        }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn cache(&self) -> &DefinitionCache {
        &self.cache
    }

    pub fn compile(&self, documents: &[SourceDocument], data: &DataContext) -> Result<CompiledOutput, CompileError> {
        let options = &self.options;
        let snapshot = self.cache.snapshot();
        let mut discovery = discover(documents, &snapshot);
        let mut diagnostics = std::mem::take(&mut discovery.diagnostics);

        let page = match select_page(&mut discovery.pages, options.entry.as_deref())? {
            Some(page) => page,
            None => {
                diagnostics.push(Diagnostic::error(
                    Stage::Discovery,
                    ErrorKind::StructuralDirective,
                    "No page document to render.",
                ));
                PageSource {
                    path: String::new(),
                    nodes: Vec::new(),
                    stylesheet: None,
                    script: None,
                }
            }
        };
        let file = page.path.clone();
        tracing::info!(page = %file, mode = ?options.mode, documents = documents.len(), "compiling page");

        let mut normalized = normalize_document(page.nodes, &file, DocumentRole::Page);
        diagnostics.append(&mut normalized.diagnostics);

        let mut styles = Vec::new();
        let mut scripts = Vec::new();
        let mut nodes = std::mem::take(&mut normalized.nodes);
        if let Some(layout) = &normalized.layout {
            let applied = apply_layout(&discovery.registry, layout, nodes, &file);
            nodes = applied.nodes;
            styles.extend(applied.styles);
            scripts.extend(applied.scripts);
            diagnostics.extend(applied.diagnostics);
        }

        let expansion = expand_components(nodes, &discovery.registry, options.max_component_depth, &file);
        diagnostics.extend(expansion.diagnostics);
        for name in &expansion.used_components {
            if let Some(def) = discovery.registry.get(name) {
                styles.extend(def.styles.iter().cloned());
                scripts.extend(def.scripts.iter().cloned());
            }
        }
        styles.append(&mut normalized.styles);
        styles.extend(page.stylesheet);
        scripts.append(&mut normalized.scripts);
        scripts.extend(page.script);

        let (nodes, diags) = expand_control_flow(expansion.nodes, data, options.mode, &file);
        diagnostics.extend(diags);

        let (nodes, diags) = resolve_interpolations(nodes, data, options.mode, &file);
        diagnostics.extend(diags);

        let islands = extract_islands(nodes, &file);
        diagnostics.extend(islands.diagnostics);
        let mut nodes = islands.nodes;

        let hydration = generate_hydration_script(islands.modules, &file);
        diagnostics.extend(hydration.diagnostics);

        diagnostics.extend(verify_output(&nodes, &file));

        let title = match &normalized.title {
            Some(value) => resolve_metadata(value, data, options.mode, &file, &mut diagnostics),
            None => escape_html(&options.default_title),
        };
        let description = normalized
            .description
            .as_ref()
            .map(|value| resolve_metadata(value, data, options.mode, &file, &mut diagnostics));

        strip_doctype(&mut nodes);
        if contains_error_block(&nodes) {
            styles.push(ERROR_BLOCK_CSS.to_string());
        }
        if !hydration.code.is_empty() {
            scripts.push(hydration.code);
        }

        let css = join_blocks(&styles);
        let script = join_blocks(&scripts);
        let shell = DocumentShell {
            lang: options.lang.clone(),
            title: title.clone(),
            page_title: normalized.title.is_some(),
            description,
            stylesheets: options.stylesheets.clone(),
            css: css.clone(),
            scripts: options.scripts.clone(),
            inline_script: script.clone(),
        };
        let html = assemble_document(&shell, &render_nodes(&nodes));

        let errors = diagnostics.iter().filter(|d| d.is_error()).count();
        if errors == 0 {
            self.cache.commit(discovery.parsed);
        }
        tracing::info!(
            page = %file,
            diagnostics = diagnostics.len(),
            errors,
            islands = hydration.modules.len(),
            bytes = html.len(),
            "compile finished"
        );

        if options.mode == CompileMode::Strict && !diagnostics.is_empty() {
            return Err(CompileError::Diagnostics(diagnostics));
        }

        Ok(CompiledOutput {
            html,
            css,
            script,
            title: unescape_html(&title),
            diagnostics,
            islands: hydration.modules,
        })
    }
}

/// Compile with a fresh compiler.
pub fn compile(
    documents: &[SourceDocument],
    data: &DataContext,
    options: CompileOptions,
) -> Result<CompiledOutput, CompileError> {
    Compiler::new(options).compile(documents, data)
}

/// JSON in, JSON out. `documents_json` is an array of documents,
/// `data_json` an object (or empty), `options_json` the options (or empty).
pub fn compile_json(documents_json: &str, data_json: &str, options_json: &str) -> Result<String, CompileError> {
    let documents: Vec<SourceDocument> =
        serde_json::from_str(documents_json).map_err(|e| CompileError::InvalidData(format!("documents: {}", e)))?;
    let data = if data_json.trim().is_empty() {
        DataContext::new()
    } else {
        let value: serde_json::Value =
            serde_json::from_str(data_json).map_err(|e| CompileError::InvalidData(e.to_string()))?;
        DataContext::from_value(value)
            .ok_or_else(|| CompileError::InvalidData("the data context must be a JSON object".to_string()))?
    };
    let options = CompileOptions::from_json(options_json)?;
    let output = compile(&documents, &data, options)?;
    serde_json::to_string(&output).map_err(|e| CompileError::InvalidData(e.to_string()))
}

fn select_page(pages: &mut Vec<PageSource>, entry: Option<&str>) -> Result<Option<PageSource>, CompileError> {
    match entry {
        Some(path) => match pages.iter().position(|p| p.path == path) {
            Some(index) => Ok(Some(pages.remove(index))),
            None => Err(CompileError::InvalidOptions(format!("entry page `{}` not found", path))),
        },
        None if pages.is_empty() => Ok(None),
        None => Ok(Some(pages.remove(0))),
    }
}

fn join_blocks(blocks: &[String]) -> String {
    blocks
        .iter()
        .map(|b| b.trim())
        .filter(|b| !b.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_options_from_json() {
        let options = CompileOptions::from_json(r#"{"mode":"strict","maxComponentDepth":4,"lang":"de"}"#).unwrap();
        assert_eq!(options.mode, CompileMode::Strict);
        assert_eq!(options.max_component_depth, 4);
        assert_eq!(options.lang, "de");
        assert_eq!(options.default_title, "Untitled");
        assert_eq!(CompileOptions::from_json("").unwrap(), CompileOptions::default());
        assert!(matches!(
            CompileOptions::from_json("{\"mode\":\"loud\"}"),
            Err(CompileError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_compile_minimal_page() {
        let docs = vec![SourceDocument::new(
            "index.ncl",
            "<n:view title=\"Hello {{ name }}\"><p>Hi {{ name }}</p></n:view>",
        )];
        let data = DataContext::from_value(json!({ "name": "Ada" })).unwrap();
        let output = compile(&docs, &data, CompileOptions::default()).unwrap();
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        assert_eq!(output.title, "Hello Ada");
        assert!(output.html.contains("<title>Hello Ada</title>"));
        assert!(output.html.contains("<meta property=\"og:title\" content=\"Hello Ada\">"));
        assert!(output.html.contains("<body>\n<p>Hi Ada</p>\n</body>"));
        assert!(output.islands.is_empty());
    }

    #[test]
    fn test_unknown_entry_is_an_options_error() {
        let docs = vec![SourceDocument::new("index.ncl", "<p></p>")];
        let options = CompileOptions {
            entry: Some("about.ncl".into()),
            ..CompileOptions::default()
        };
        assert!(matches!(
            compile(&docs, &DataContext::new(), options),
            Err(CompileError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_strict_mode_fails_with_diagnostics() {
        let docs = vec![SourceDocument::new("index.ncl", "<p>{{ ghost }}</p>")];
        let err = compile(&docs, &DataContext::new(), CompileOptions::strict()).unwrap_err();
        match err {
            CompileError::Diagnostics(diags) => {
                assert_eq!(diags.len(), 1);
                assert_eq!(diags[0].kind, ErrorKind::InterpolationTargetMissing);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_lenient_mode_passes_raw_expression() {
        let docs = vec![SourceDocument::new("index.ncl", "<p>{{ ghost }}</p>")];
        let output = compile(&docs, &DataContext::new(), CompileOptions::default()).unwrap();
        assert!(output.html.contains("<p>{{ ghost }}</p>"));
        assert!(output.html.contains("<title>Untitled</title>"));
        assert!(!output.html.contains("og:title"));
        assert_eq!(output.diagnostics.len(), 1);
        assert!(!output.has_errors());
    }

    #[test]
    fn test_cache_committed_only_after_clean_pass() {
        let compiler = Compiler::default();
        let broken = vec![SourceDocument::new("index.ncl", "<Missing/>")];
        let output = compiler.compile(&broken, &DataContext::new()).unwrap();
        assert!(output.has_errors());
        assert!(compiler.cache().is_empty());

        let clean = vec![SourceDocument::new("index.ncl", "<p>ok</p>")];
        compiler.compile(&clean, &DataContext::new()).unwrap();
        assert_eq!(compiler.cache().len(), 1);
    }

    #[test]
    fn test_compile_json() {
        let docs = json!([{ "path": "index.ncl", "markup": "<p>{{ n }}</p>" }]).to_string();
        let out = compile_json(&docs, r#"{"n": 3}"#, "").unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert!(value["html"].as_str().unwrap().contains("<p>3</p>"));
        assert!(matches!(compile_json(&docs, "[1]", ""), Err(CompileError::InvalidData(_))));
    }
}
