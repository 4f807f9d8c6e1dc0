//! # NCL Compiler
//!
//! Compiles `.ncl` component-and-directive markup into a complete HTML
//! document plus a small hydration runtime for interactive islands.
//!
//! ## Pipeline
//!
//! 1. **Discovery**: every document is parsed (cached by content hash) and
//!    component/layout definitions are collected into an explicit
//!    `ComponentRegistry`.
//! 2. **Normalization**: page root, layout reference, prop blocks and style
//!    blocks are rewritten structurally. Nothing is evaluated.
//! 3. **Components**: usages are replaced by their bodies with bound props;
//!    slot content keeps the caller's scope.
//! 4. **Control flow**: loops and conditionals (tag and `{% %}` dialects)
//!    expand against the `DataContext`.
//! 5. **Interpolation**: `{{ expr }}` and `{ expr }` resolve to escaped text.
//!    Unresolved names pass through in lenient mode and fail in strict mode.
//! 6. **Islands**: `<n:island>` scripts become typed `RuntimeModule`s and
//!    the page gets binding and action markers.
//! 7. **Assembly**: the tree is verified, rendered and wrapped with the
//!    aggregated CSS and scripts.
//!
//! Every stage reports `Diagnostic`s and renders an inline error block at
//! the failing construct instead of aborting the pass.

#[cfg(feature = "napi")]
use napi_derive::napi;

mod cache;
mod codegen;
mod component;
mod css;
mod discovery;
mod document;
mod finalize;
mod interpolate;
mod island;
mod layout;
mod live;
mod normalize;
mod parse;
mod pipeline;
mod scope;
mod static_eval;
mod transform;
mod validate;

#[cfg(test)]
mod component_tests;
#[cfg(test)]
mod expression_tests;
#[cfg(test)]
mod safety_tests;

pub use cache::{CacheTable, DefinitionCache};
pub use codegen::{generate_hydration_script, verify_script, HydrationScript};
pub use component::{expand_components, Expansion, DEFAULT_MAX_DEPTH};
pub use discovery::{
    discover, discover_documents, ComponentDefinition, ComponentRegistry, Discovery, PropDefinition,
    PropType, SlotDefinition,
};
pub use document::{CompiledOutput, SourceDocument};
pub use finalize::{assemble_document, escape_html, render_nodes, DocumentShell};
pub use interpolate::resolve_interpolations;
pub use island::{
    extract_islands, parse_island_script, ActionBinding, DerivedEntry, DerivedExpr, DerivedOp,
    HydratedIsland, IslandOutput, Mutation, MutationOp, RuntimeModule, StateEntry,
};
pub use layout::apply_layout;
pub use live::{ComponentStore, Edit, EditDebouncer, LiveCompiler, Ticket};
pub use normalize::{normalize_document, DocumentRole, NormalizedDocument};
pub use parse::{parse_template, ParsedTemplate};
pub use pipeline::{compile, compile_json, CompileError, CompileMode, CompileOptions, Compiler};
pub use scope::{DataContext, Scope};
pub use static_eval::{parse_expression, Expr};
pub use transform::expand_control_flow;
pub use validate::*;

/// Compile from JSON inputs and return the serialized `CompiledOutput`.
#[cfg(feature = "napi")]
#[napi]
pub fn compile_native(documents_json: String, data_json: String, options_json: String) -> napi::Result<String> {
    compile_json(&documents_json, &data_json, &options_json).map_err(|e| napi::Error::from_reason(e.to_string()))
}
