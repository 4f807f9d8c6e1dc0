//! Document Module for the NCL Compiler
//!
//! Inputs and outputs of a compile pass.

use crate::island::RuntimeModule;
use crate::validate::Diagnostic;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One template file as supplied by the host, fully loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDocument {
    pub path: String,
    pub markup: String,
    #[serde(default)]
    pub stylesheet: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
}

impl SourceDocument {
    pub fn new(path: impl Into<String>, markup: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            markup: markup.into(),
            stylesheet: None,
            script: None,
        }
    }

    pub fn with_stylesheet(mut self, css: impl Into<String>) -> Self {
        self.stylesheet = Some(css.into());
        self
    }

    pub fn with_script(mut self, js: impl Into<String>) -> Self {
        self.script = Some(js.into());
        self
    }

    /// File name without directories or extension.
    pub fn stem(&self) -> &str {
        Path::new(&self.path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.path)
    }

    pub fn in_directory(&self, dir: &str) -> bool {
        self.path
            .split(['/', '\\'])
            .rev()
            .skip(1)
            .any(|segment| segment == dir)
    }
}

/// Result of a compile pass. Produced fresh on every invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledOutput {
    pub html: String,
    pub css: String,
    pub script: String,
    pub title: String,
    pub diagnostics: Vec<Diagnostic>,
    pub islands: Vec<RuntimeModule>,
}

impl CompiledOutput {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stem_and_directory() {
        let doc = SourceDocument::new("site/layouts/Main.ncl", "");
        assert_eq!(doc.stem(), "Main");
        assert!(doc.in_directory("layouts"));
        assert!(!doc.in_directory("Main.ncl"));
        assert!(!SourceDocument::new("layouts.ncl", "").in_directory("layouts"));
    }
}
