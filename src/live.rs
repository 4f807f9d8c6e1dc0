//! Live recompilation.
//!
//! Editor change events are coalesced per path by `EditDebouncer`. The
//! document set lives in a `ComponentStore` that is swapped as a whole, so a
//! compile pass always sees a complete set. `LiveCompiler` numbers every
//! pass and only publishes the result of the newest one (last edit wins).

use crate::discovery::discover_documents;
use crate::document::{CompiledOutput, SourceDocument};
use crate::pipeline::{CompileError, CompileOptions, Compiler};
use crate::scope::DataContext;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════════
// DEBOUNCING
// ═══════════════════════════════════════════════════════════════════════════════

/// Latest content of a document after a burst of edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub path: String,
    pub markup: String,
}

#[derive(Default)]
struct PendingEdits {
    markup: HashMap<String, String>,
    deadline: Option<Instant>,
}

/// Thread-safe edit coalescer. Every new edit replaces the pending content
/// of its path and pushes the shared deadline back by one window, so a burst
/// across several files drains as one batch.
pub struct EditDebouncer {
    pending: Mutex<PendingEdits>,
    window: Duration,
}

impl EditDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            pending: Mutex::new(PendingEdits::default()),
            window,
        }
    }

    pub fn record(&self, path: impl Into<String>, markup: impl Into<String>) {
        self.record_at(path, markup, Instant::now());
    }

    pub fn record_at(&self, path: impl Into<String>, markup: impl Into<String>, now: Instant) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.markup.insert(path.into(), markup.into());
        let deadline = now + self.window;
        pending.deadline = Some(pending.deadline.map_or(deadline, |d| d.max(deadline)));
    }

    /// Remove and return every pending edit once the burst has been quiet
    /// for a full window, sorted by path. Empty before that.
    pub fn drain_ready(&self, now: Instant) -> Vec<Edit> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match pending.deadline {
            Some(deadline) if deadline <= now => {}
            _ => return Vec::new(),
        }
        pending.deadline = None;
        let mut edits: Vec<Edit> = pending
            .markup
            .drain()
            .map(|(path, markup)| Edit { path, markup })
            .collect();
        edits.sort_by(|a, b| a.path.cmp(&b.path));
        edits
    }

    /// Deadline of the current burst, for timer scheduling.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .deadline
    }

    pub fn is_empty(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .markup
            .is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DOCUMENT STORE
// ═══════════════════════════════════════════════════════════════════════════════

/// The current document set. Readers get an `Arc` snapshot without holding
/// a lock; writers are serialized and replace the set in one step.
#[derive(Debug, Default)]
pub struct ComponentStore {
    reload_lock: Mutex<()>,
    current: RwLock<Arc<Vec<SourceDocument>>>,
}

impl ComponentStore {
    pub fn new(documents: Vec<SourceDocument>) -> Self {
        Self {
            reload_lock: Mutex::new(()),
            current: RwLock::new(Arc::new(sorted(documents))),
        }
    }

    pub fn documents(&self) -> Arc<Vec<SourceDocument>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, documents: Vec<SourceDocument>) {
        let _guard = self.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.swap(sorted(documents));
    }

    /// Load the full set from disk. The store is unchanged if loading fails.
    pub fn load_dir(&self, root: &Path) -> Result<usize, CompileError> {
        let _guard = self.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let documents = discover_documents(root)?;
        let count = documents.len();
        self.swap(documents);
        tracing::info!(root = %root.display(), documents = count, "document set reloaded");
        Ok(count)
    }

    /// Apply debounced edits on top of the current set. Unknown paths are
    /// added as new documents.
    pub fn apply_edits(&self, edits: Vec<Edit>) -> Arc<Vec<SourceDocument>> {
        let _guard = self.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut documents: Vec<SourceDocument> = self.documents().as_ref().clone();
        for edit in edits {
            match documents.iter_mut().find(|d| d.path == edit.path) {
                Some(doc) => doc.markup = edit.markup,
                None => documents.push(SourceDocument::new(edit.path, edit.markup)),
            }
        }
        let documents = Arc::new(sorted(documents));
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = documents.clone();
        documents
    }

    fn swap(&self, documents: Vec<SourceDocument>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(documents);
    }
}

fn sorted(mut documents: Vec<SourceDocument>) -> Vec<SourceDocument> {
    documents.sort_by(|a, b| a.path.cmp(&b.path));
    documents
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIVE COMPILER
// ═══════════════════════════════════════════════════════════════════════════════

/// Issued by `LiveCompiler::begin`; identifies one compile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ticket(u64);

pub struct LiveCompiler {
    compiler: Compiler,
    store: ComponentStore,
    generation: AtomicU64,
    published: Mutex<Option<(Ticket, Arc<CompiledOutput>)>>,
}

impl LiveCompiler {
    pub fn new(options: CompileOptions, store: ComponentStore) -> Self {
        Self {
            compiler: Compiler::new(options),
            store,
            generation: AtomicU64::new(0),
            published: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &ComponentStore {
        &self.store
    }

    /// Start a pass. Any pass started earlier becomes stale.
    pub fn begin(&self) -> Ticket {
        Ticket(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, ticket: Ticket) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket.0
    }

    /// Keep `output` only if no newer pass was started since `ticket`.
    pub fn publish(&self, ticket: Ticket, output: CompiledOutput) -> bool {
        let mut published = self.published.lock().unwrap_or_else(PoisonError::into_inner);
        let newer_published = matches!(&*published, Some((seen, _)) if *seen >= ticket);
        if !self.is_current(ticket) || newer_published {
            tracing::debug!(ticket = ticket.0, "discarding superseded compile result");
            return false;
        }
        *published = Some((ticket, Arc::new(output)));
        true
    }

    pub fn latest(&self) -> Option<Arc<CompiledOutput>> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(_, output)| output.clone())
    }

    /// Compile the current document set. Returns `None` when a newer pass
    /// started before this one finished.
    pub fn recompile(&self, data: &DataContext) -> Result<Option<Arc<CompiledOutput>>, CompileError> {
        let ticket = self.begin();
        let documents = self.store.documents();
        let output = self.compiler.compile(&documents, data)?;
        if self.publish(ticket, output) {
            tracing::info!(ticket = ticket.0, "live recompile published");
            Ok(self.latest())
        } else {
            Ok(None)
        }
    }

    /// Apply debounced edits that are due and recompile once for all of them.
    pub fn process_edits(
        &self,
        debouncer: &EditDebouncer,
        now: Instant,
        data: &DataContext,
    ) -> Result<Option<Arc<CompiledOutput>>, CompileError> {
        let edits = debouncer.drain_ready(now);
        if edits.is_empty() {
            return Ok(None);
        }
        tracing::info!(edits = edits.len(), "applying debounced edits");
        self.store.apply_edits(edits);
        self.recompile(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn page(markup: &str) -> SourceDocument {
        SourceDocument::new("index.ncl", markup)
    }

    #[test]
    fn test_debouncer_coalesces_bursts() {
        let debouncer = EditDebouncer::new(Duration::from_millis(50));
        let start = Instant::now();
        debouncer.record_at("index.ncl", "<p>a</p>", start);
        debouncer.record_at("Card.ncl", "<div></div>", start + Duration::from_millis(10));
        debouncer.record_at("index.ncl", "<p>ab</p>", start + Duration::from_millis(20));

        assert_eq!(debouncer.next_deadline(), Some(start + Duration::from_millis(70)));
        assert!(debouncer.drain_ready(start + Duration::from_millis(65)).is_empty());

        debouncer.record_at("Card.ncl", "<div>x</div>", start + Duration::from_millis(68));
        assert!(debouncer.drain_ready(start + Duration::from_millis(100)).is_empty());
        assert_eq!(debouncer.next_deadline(), Some(start + Duration::from_millis(118)));

        let ready = debouncer.drain_ready(start + Duration::from_millis(120));
        assert_eq!(
            ready,
            vec![
                Edit { path: "Card.ncl".into(), markup: "<div>x</div>".into() },
                Edit { path: "index.ncl".into(), markup: "<p>ab</p>".into() },
            ]
        );
        assert!(debouncer.is_empty());
        assert_eq!(debouncer.next_deadline(), None);
        assert!(debouncer.drain_ready(start + Duration::from_millis(500)).is_empty());
    }

    #[test]
    fn test_burst_across_files_compiles_once() {
        let live = LiveCompiler::new(
            CompileOptions {
                entry: Some("index.ncl".into()),
                ..CompileOptions::default()
            },
            ComponentStore::new(vec![page("<Card/>")]),
        );
        let data = DataContext::new();
        let debouncer = EditDebouncer::new(Duration::from_millis(50));
        let start = Instant::now();
        debouncer.record_at("components/Card.ncl", "<div class=\"card\"></div>", start + Duration::from_millis(10));
        debouncer.record_at("index.ncl", "<Card/><p>v2</p>", start + Duration::from_millis(20));

        assert!(live.process_edits(&debouncer, start + Duration::from_millis(65), &data).unwrap().is_none());
        let output = live
            .process_edits(&debouncer, start + Duration::from_millis(70), &data)
            .unwrap()
            .unwrap();
        assert!(output.html.contains("<div class=\"card\"></div><p>v2</p>"));
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        assert_eq!(live.generation.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_store_swaps_whole_set() {
        let store = ComponentStore::new(vec![page("<p>one</p>")]);
        let before = store.documents();
        let after = store.apply_edits(vec![
            Edit { path: "index.ncl".into(), markup: "<p>two</p>".into() },
            Edit { path: "Badge.ncl".into(), markup: "<b></b>".into() },
        ]);

        assert_eq!(before.len(), 1);
        assert_eq!(before[0].markup, "<p>one</p>");
        assert_eq!(after.iter().map(|d| d.path.as_str()).collect::<Vec<_>>(), vec!["Badge.ncl", "index.ncl"]);
        assert_eq!(store.documents()[1].markup, "<p>two</p>");
    }

    #[test]
    fn test_load_dir_keeps_store_on_failure() {
        let store = ComponentStore::new(vec![page("<p>kept</p>")]);
        let missing = std::env::temp_dir().join("ncl-live-missing-dir-for-test");
        assert!(store.load_dir(&missing).is_err());
        assert_eq!(store.documents()[0].markup, "<p>kept</p>");

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.ncl"), "<p>disk</p>").unwrap();
        assert_eq!(store.load_dir(dir.path()).unwrap(), 1);
        assert_eq!(store.documents()[0].markup, "<p>disk</p>");
    }

    #[test]
    fn test_last_edit_wins() {
        let live = LiveCompiler::new(CompileOptions::default(), ComponentStore::default());
        let first = live.begin();
        let second = live.begin();

        assert!(live.publish(second, CompiledOutput { html: "new".into(), ..Default::default() }));
        assert!(!live.publish(first, CompiledOutput { html: "old".into(), ..Default::default() }));
        assert_eq!(live.latest().unwrap().html, "new");
    }

    #[test]
    fn test_process_edits_recompiles_once() {
        let live = LiveCompiler::new(CompileOptions::default(), ComponentStore::new(vec![page("<p>v1</p>")]));
        let data = DataContext::new();
        let first = live.recompile(&data).unwrap().unwrap();
        assert!(first.html.contains("<p>v1</p>"));

        let debouncer = EditDebouncer::new(Duration::from_millis(5));
        let now = Instant::now();
        debouncer.record_at("index.ncl", "<p>v2</p>", now);
        debouncer.record_at("index.ncl", "<p>v3</p>", now);

        assert!(live.process_edits(&debouncer, now, &data).unwrap().is_none());
        let latest = live
            .process_edits(&debouncer, now + Duration::from_millis(10), &data)
            .unwrap()
            .unwrap();
        assert!(latest.html.contains("<p>v3</p>"));
    }
}
