//! Two-phase DOM change watcher.
//!
//! Phase one observes a broad container that is likely to hold the message
//! list once it renders. As soon as user messages exist the watcher narrows to
//! the smallest common ancestor of the message nodes, so unrelated page chrome
//! stops waking it up. Every relevant batch is debounced into one callback.
//!
//! Mutations inside the page's own injected UI root are ignored, otherwise
//! re-rendering that UI would trigger extraction forever.

use crate::adapters::SiteRules;
use crate::debounce::{DebouncedFn, Debouncer};
use crate::dom::{Document, MutationKind, MutationObserver, MutationRecord, NodeId, ObserveInit, Page};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Default id of the injected UI root whose mutations are ignored
pub const DEFAULT_UI_ROOT_ID: &str = "ph-sidebar-root";

/// Callback invoked after a debounced burst of relevant mutations
pub type ChangeCallback = DebouncedFn;

/// The watcher's view of the extraction coordinator
pub trait ExtractionMonitor: Send + Sync {
    fn is_extracting(&self) -> bool;

    /// A relevant mutation arrived during an extraction
    fn mark_pending_mutation(&self);

    /// The DOM changed; cached results are stale
    fn invalidate_cache(&self);
}

#[derive(Clone, Default)]
pub struct ObserveOptions {
    /// Start in the broad phase even if messages already exist
    pub force_initial: bool,
    pub monitor: Option<Arc<dyn ExtractionMonitor>>,
}

impl std::fmt::Debug for ObserveOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserveOptions")
            .field("force_initial", &self.force_initial)
            .field("monitor", &self.monitor.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchPhase {
    Broad,
    Precise,
}

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub debounce: Duration,
    pub ui_root_id: String,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            ui_root_id: DEFAULT_UI_ROOT_ID.to_string(),
        }
    }
}

#[derive(Default)]
struct WatchState {
    /// Bumped whenever the observer is replaced; stale pump tasks exit
    generation: u64,
    phase: Option<WatchPhase>,
    observer: Option<MutationObserver>,
    task: Option<JoinHandle<()>>,
    debouncer: Option<Arc<Debouncer>>,
    monitor: Option<Arc<dyn ExtractionMonitor>>,
}

/// Mutation watcher for one document and one set of site rules
#[derive(Clone)]
pub struct ChangeWatcher {
    document: Document,
    rules: Arc<SiteRules>,
    settings: WatcherSettings,
    state: Arc<Mutex<WatchState>>,
}

impl ChangeWatcher {
    pub fn new(document: Document, rules: Arc<SiteRules>, settings: WatcherSettings) -> Self {
        Self {
            document,
            rules,
            settings,
            state: Arc::new(Mutex::new(WatchState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin (or restart) observation.
    ///
    /// Without `force_initial`, a page that already shows user messages goes
    /// straight to the precise phase.
    pub fn start(&self, callback: ChangeCallback, options: ObserveOptions) {
        let mut state = self.lock();
        Self::detach(&mut state, true);
        if let Some(debouncer) = state.debouncer.take() {
            debouncer.cancel();
        }
        state.debouncer = Some(Arc::new(Debouncer::new(self.settings.debounce, callback)));
        state.monitor = options.monitor;

        let phase = if !options.force_initial && self.has_user_messages() {
            WatchPhase::Precise
        } else {
            WatchPhase::Broad
        };
        debug!(?phase, force_initial = options.force_initial, "starting change watcher");
        self.attach(&mut state, phase);
    }

    /// Forced return to the broad phase, e.g. after a conversation switch
    pub fn reset(&self, callback: ChangeCallback, monitor: Option<Arc<dyn ExtractionMonitor>>) {
        self.start(
            callback,
            ObserveOptions {
                force_initial: true,
                monitor,
            },
        );
    }

    /// Stop observing and drop any pending callback
    pub fn disconnect(&self) {
        let mut state = self.lock();
        Self::detach(&mut state, true);
        if let Some(debouncer) = state.debouncer.take() {
            debouncer.cancel();
        }
        state.monitor = None;
        state.phase = None;
        debug!("change watcher disconnected");
    }

    /// Fire the pending debounced callback now
    pub fn flush_pending(&self) -> bool {
        let debouncer = self.lock().debouncer.clone();
        debouncer.map_or(false, |d| d.flush())
    }

    pub fn has_pending(&self) -> bool {
        self.lock()
            .debouncer
            .as_ref()
            .map_or(false, |d| d.is_pending())
    }

    /// `None` until started or after disconnect
    pub fn phase(&self) -> Option<WatchPhase> {
        self.lock().phase
    }

    pub fn observed_container(&self) -> Option<NodeId> {
        self.lock().observer.as_ref().and_then(MutationObserver::target)
    }

    fn has_user_messages(&self) -> bool {
        self.rules.has_user_messages(&self.document.read())
    }

    fn detach(state: &mut WatchState, abort_task: bool) {
        state.generation += 1;
        state.observer = None;
        if let Some(task) = state.task.take() {
            if abort_task {
                task.abort();
            }
        }
    }

    fn broad_container(&self, page: &Page) -> NodeId {
        match self.rules.broad_container(page) {
            Some(container) => container,
            None => {
                warn!(
                    platform = %self.rules.kind(),
                    "no known message container, observing <body> (degraded)"
                );
                page.body()
            }
        }
    }

    fn precise_container(&self, page: &Page) -> Option<NodeId> {
        let candidates = self.rules.find_candidates(page);
        page.common_ancestor(&candidates)
    }

    /// Observe the container for `phase`; requires a detached state
    fn attach(&self, state: &mut WatchState, phase: WatchPhase) {
        let (container, phase) = {
            let page = self.document.read();
            match phase {
                WatchPhase::Precise => match self.precise_container(&page) {
                    Some(container) => (container, WatchPhase::Precise),
                    None => {
                        debug!("precise container unresolved, staying broad");
                        (self.broad_container(&page), WatchPhase::Broad)
                    }
                },
                WatchPhase::Broad => (self.broad_container(&page), WatchPhase::Broad),
            }
        };

        let (observer, rx) = self
            .document
            .observe(container, ObserveInit::subtree_child_list());
        let generation = state.generation;
        let watcher = self.clone();
        state.task = Some(tokio::spawn(async move {
            watcher.pump(generation, rx).await;
        }));
        state.observer = Some(observer);
        state.phase = Some(phase);

        info!(
            ?phase,
            container = %self.document.read().describe(container),
            "observing message container"
        );
    }

    async fn pump(self, generation: u64, mut rx: mpsc::UnboundedReceiver<Vec<MutationRecord>>) {
        while let Some(batch) = rx.recv().await {
            if !self.handle_batch(generation, &batch) {
                break;
            }
        }
        trace!(generation, "mutation pump finished");
    }

    /// Returns `false` once this pump's observer has been replaced
    fn handle_batch(&self, generation: u64, batch: &[MutationRecord]) -> bool {
        let relevant = {
            let page = self.document.read();
            batch
                .iter()
                .filter(|r| r.kind == MutationKind::ChildList && !r.added.is_empty())
                .filter(|r| !self.touches_own_ui(&page, r))
                .count()
        };

        let mut state = self.lock();
        if state.generation != generation {
            return false;
        }
        if relevant == 0 {
            trace!(records = batch.len(), "ignoring irrelevant mutations");
            return true;
        }

        match &state.monitor {
            Some(monitor) if monitor.is_extracting() => {
                trace!("mutation during extraction, marking pending");
                monitor.mark_pending_mutation();
            }
            monitor => {
                if let Some(monitor) = monitor {
                    monitor.invalidate_cache();
                }
                if let Some(debouncer) = &state.debouncer {
                    debouncer.schedule();
                }
            }
        }

        // Narrowing does not wait for the extraction to finish
        if state.phase == Some(WatchPhase::Broad) && self.has_user_messages() {
            info!("messages present, switching to precise container");
            Self::detach(&mut state, false);
            self.attach(&mut state, WatchPhase::Precise);
            return false;
        }
        true
    }

    fn touches_own_ui(&self, page: &Page, record: &MutationRecord) -> bool {
        let id = self.settings.ui_root_id.as_str();
        if page.ancestor_with_id(record.target, id).is_some() {
            return true;
        }
        record
            .added
            .iter()
            .chain(record.removed.iter())
            .any(|node| page.find_id_within(*node, id).is_some())
    }
}

impl std::fmt::Debug for ChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("platform", &self.rules.kind())
            .field("phase", &self.phase())
            .finish()
    }
}
