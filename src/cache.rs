//! Parse cache shared across compile passes.
//!
//! Entries are keyed by the sha256 of a document's path and markup. A pass
//! reads an immutable snapshot and builds its own table; the table replaces
//! the snapshot only once the pass finished without errors, so a pass never
//! sees a half-updated cache.

use crate::document::SourceDocument;
use crate::parse::ParsedTemplate;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

pub type CacheTable = HashMap<String, ParsedTemplate>;

#[derive(Debug, Default)]
pub struct DefinitionCache {
    current: RwLock<Arc<CacheTable>>,
}

impl DefinitionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compute_hash(doc: &SourceDocument) -> String {
        let mut hasher = Sha256::new();
        hasher.update(doc.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(doc.markup.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn snapshot(&self) -> Arc<CacheTable> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the whole table in one step.
    pub fn commit(&self, table: CacheTable) {
        let entries = table.len();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
        tracing::debug!(entries, "parse cache committed");
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
