//! Extraction coordinator.
//!
//! Serializes every extraction for one page: concurrent callers share the
//! in-flight scan, repeat calls inside the freshness window are answered from
//! the last result, and results are forwarded to the store according to the
//! strategy. All bookkeeping happens inside one critical section per step so
//! the check-then-set of the state machine never spans an `.await`.

use crate::adapters::PlatformAdapter;
use crate::config::CoordinatorConfig;
use crate::events::AppEvent;
use crate::store::PromptStore;
use crate::types::{
    now_millis, ExtractionError, ExtractionOptions, ExtractionResult, ExtractionState,
    ExtractionStrategy, Prompt, ResultSource,
};
use crate::watcher::ExtractionMonitor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

type Outcome = Result<Vec<Prompt>, ExtractionError>;
type InFlight = watch::Receiver<Option<Outcome>>;

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    /// Freshness window of the last full result
    pub cache_ttl: Duration,
    /// Default per-extraction timeout
    pub timeout: Duration,
    /// Delay before a settled state falls back to idle
    pub idle_reset: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&CoordinatorConfig::default())
    }
}

impl From<&CoordinatorConfig> for CoordinatorSettings {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            cache_ttl: Duration::from_millis(config.cache_ttl_ms),
            timeout: Duration::from_millis(config.timeout_ms),
            idle_reset: Duration::from_millis(config.idle_reset_ms),
        }
    }
}

#[derive(Default)]
struct Inner {
    state: ExtractionState,
    in_flight: Option<InFlight>,
    last_completed: Option<Instant>,
    last_result: Vec<Prompt>,
    /// Bumped per scan and on reset; stale scans leave no trace
    generation: u64,
    pending_mutation: bool,
    /// A relevant DOM change arrived after the last scan started
    dom_dirty: bool,
}

struct Shared {
    adapter: Arc<dyn PlatformAdapter>,
    store: Arc<PromptStore>,
    settings: CoordinatorSettings,
    inner: Mutex<Inner>,
}

/// Single-flight extraction front end for one adapter and one store
#[derive(Clone)]
pub struct ExtractionCoordinator {
    shared: Arc<Shared>,
}

impl ExtractionCoordinator {
    pub fn new(
        adapter: Arc<dyn PlatformAdapter>,
        store: Arc<PromptStore>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                adapter,
                store,
                settings,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run (or join, or answer from cache) an extraction
    pub async fn extract(&self, options: ExtractionOptions) -> Result<ExtractionResult, ExtractionError> {
        let started = Instant::now();
        let is_incremental = options.strategy == ExtractionStrategy::Incremental;

        let (rx, source) = {
            let mut inner = self.lock();
            if let Some(rx) = &inner.in_flight {
                trace!("extraction in flight, queueing caller");
                (rx.clone(), ResultSource::Queued)
            } else if let Some(prompts) = self.cached(&inner, &options) {
                debug!(count = prompts.len(), "serving cached extraction");
                return Ok(ExtractionResult {
                    prompts,
                    source: ResultSource::Cached,
                    is_incremental,
                    duration: Duration::ZERO,
                    timestamp: now_millis(),
                });
            } else {
                (self.begin_scan(&mut inner, options, false), ResultSource::Fresh)
            }
        };

        let prompts = Self::wait(rx).await?;
        Ok(ExtractionResult {
            prompts,
            source,
            is_incremental,
            duration: started.elapsed(),
            timestamp: now_millis(),
        })
    }

    fn cached(&self, inner: &Inner, options: &ExtractionOptions) -> Option<Vec<Prompt>> {
        if options.force || options.strategy != ExtractionStrategy::Full || inner.dom_dirty {
            return None;
        }
        if inner.last_result.is_empty() {
            return None;
        }
        let completed = inner.last_completed?;
        (completed.elapsed() < self.shared.settings.cache_ttl).then(|| inner.last_result.clone())
    }

    async fn wait(mut rx: InFlight) -> Outcome {
        let settled = rx.wait_for(Option::is_some).await.map(|outcome| outcome.clone());
        match settled {
            Ok(Some(outcome)) => outcome,
            Ok(None) | Err(_) => Err(ExtractionError::Unknown(
                "extraction task ended without a result".into(),
            )),
        }
    }

    /// Mark the coordinator busy and spawn the scan; caller holds the lock.
    ///
    /// A `follow_up` scan has no caller waiting on it, so its failure is
    /// published on the event bus instead.
    fn begin_scan(&self, inner: &mut Inner, options: ExtractionOptions, follow_up: bool) -> InFlight {
        let (tx, rx) = watch::channel(None);
        inner.state = ExtractionState::Extracting;
        inner.generation += 1;
        inner.pending_mutation = false;
        inner.dom_dirty = false;
        inner.in_flight = Some(rx.clone());

        let generation = inner.generation;
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.run_scan(generation, options, follow_up, tx).await;
        });
        rx
    }

    async fn run_scan(
        self,
        generation: u64,
        options: ExtractionOptions,
        follow_up: bool,
        tx: watch::Sender<Option<Outcome>>,
    ) {
        if options.strategy != ExtractionStrategy::Full {
            warn!(
                strategy = ?options.strategy,
                "partial scans are not supported, running a full scan"
            );
        }

        let limit = options.timeout.unwrap_or(self.shared.settings.timeout);
        let started = Instant::now();
        let outcome = match tokio::time::timeout(limit, self.shared.adapter.extract_prompts()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ExtractionError::Timeout(limit)),
        };

        let settled = {
            let mut inner = self.lock();
            if inner.generation != generation {
                debug!(generation, "discarding result of a superseded extraction");
                false
            } else {
                match &outcome {
                    Ok(prompts) => {
                        inner.state = ExtractionState::Completed;
                        if options.strategy == ExtractionStrategy::Full {
                            inner.last_result = prompts.clone();
                            inner.last_completed = Some(Instant::now());
                        }
                        if !options.silent {
                            self.apply_to_store(options.strategy, prompts);
                        }
                        info!(
                            count = prompts.len(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "extraction completed"
                        );
                    }
                    Err(e) => {
                        inner.state = ExtractionState::Error;
                        warn!(code = e.code().as_str(), follow_up, "extraction failed: {}", e);
                        if follow_up {
                            self.shared.store.events().emit(AppEvent::ExtractionFailed {
                                code: e.code(),
                                message: e.to_string(),
                            });
                        }
                    }
                }

                if std::mem::take(&mut inner.pending_mutation) {
                    debug!("page changed during extraction, running follow-up");
                    self.begin_scan(&mut inner, ExtractionOptions::forced(), true);
                    false
                } else {
                    inner.in_flight = None;
                    true
                }
            }
        };

        // Receivers may all be gone; the bookkeeping above already happened.
        let _ = tx.send(Some(outcome));

        if settled {
            self.schedule_idle_reset(generation);
        }
    }

    fn apply_to_store(&self, strategy: ExtractionStrategy, prompts: &[Prompt]) {
        let store = &self.shared.store;
        match strategy {
            ExtractionStrategy::Full if !prompts.is_empty() => store.replace_all(prompts.to_vec()),
            ExtractionStrategy::Incremental if !prompts.is_empty() => {
                store.append(prompts.to_vec());
            }
            ExtractionStrategy::Full | ExtractionStrategy::Incremental => {
                debug!("empty scan, keeping stored prompts");
            }
            ExtractionStrategy::Viewport => {}
        }
    }

    fn schedule_idle_reset(&self, generation: u64) {
        let coordinator = self.clone();
        let delay = self.shared.settings.idle_reset;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut inner = coordinator.lock();
            if inner.generation == generation && inner.in_flight.is_none() {
                trace!(from = ?inner.state, "coordinator back to idle");
                inner.state = ExtractionState::Idle;
            }
        });
    }

    pub fn state(&self) -> ExtractionState {
        self.lock().state
    }

    /// Forget everything, including any scan still running
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.state = ExtractionState::Idle;
        inner.in_flight = None;
        inner.pending_mutation = false;
        inner.dom_dirty = false;
        inner.last_result.clear();
        inner.last_completed = None;
        debug!("coordinator reset");
    }

    pub fn clear_cache(&self) {
        let mut inner = self.lock();
        inner.last_result.clear();
        inner.last_completed = None;
    }

    pub fn store(&self) -> &Arc<PromptStore> {
        &self.shared.store
    }

    pub fn adapter(&self) -> &Arc<dyn PlatformAdapter> {
        &self.shared.adapter
    }

    pub fn settings(&self) -> CoordinatorSettings {
        self.shared.settings
    }
}

impl ExtractionMonitor for ExtractionCoordinator {
    fn is_extracting(&self) -> bool {
        self.lock().in_flight.is_some()
    }

    fn mark_pending_mutation(&self) {
        let mut inner = self.lock();
        if inner.in_flight.is_some() {
            inner.pending_mutation = true;
        }
        inner.dom_dirty = true;
    }

    fn invalidate_cache(&self) {
        self.lock().dom_dirty = true;
    }
}

impl std::fmt::Debug for ExtractionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionCoordinator")
            .field("platform", &self.shared.adapter.kind())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::Document;
    use crate::events::EventBus;
    use crate::types::{ExtractionErrorCode, PlatformKind};
    use crate::watcher::{ChangeCallback, ObserveOptions};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    struct MockAdapter {
        calls: AtomicUsize,
        delay: Duration,
        responses: Mutex<VecDeque<Outcome>>,
        fallback: Vec<Prompt>,
    }

    impl MockAdapter {
        fn new(delay: Duration, fallback: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                responses: Mutex::new(VecDeque::new()),
                fallback: prompts(fallback),
            })
        }

        fn respond(&self, outcome: Outcome) {
            self.responses.lock().unwrap().push_back(outcome);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl PlatformAdapter for MockAdapter {
        fn kind(&self) -> PlatformKind {
            PlatformKind::ChatGpt
        }

        fn detect(&self, _url: &str, _document: &Document) -> bool {
            true
        }

        fn initialize(&self) -> Result<(), ExtractionError> {
            Ok(())
        }

        async fn extract_prompts(&self) -> Result<Vec<Prompt>, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sleep(self.delay).await;
            let queued = self.responses.lock().unwrap().pop_front();
            queued.unwrap_or_else(|| Ok(self.fallback.clone()))
        }

        fn observe_changes(&self, _callback: ChangeCallback, _options: ObserveOptions) {}

        fn destroy(&self) {}
    }

    fn prompts(contents: &[&str]) -> Vec<Prompt> {
        contents
            .iter()
            .enumerate()
            .filter_map(|(i, c)| Prompt::new(c, 1000 + i as i64, Some(i)))
            .collect()
    }

    fn coordinator(adapter: &Arc<MockAdapter>) -> ExtractionCoordinator {
        let store = Arc::new(PromptStore::new(EventBus::new()));
        ExtractionCoordinator::new(adapter.clone(), store, CoordinatorSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_share_one_scan() {
        let adapter = MockAdapter::new(Duration::from_millis(100), &["a", "b"]);
        let coordinator = coordinator(&adapter);

        let (first, second, third) = tokio::join!(
            coordinator.extract(ExtractionOptions::forced()),
            coordinator.extract(ExtractionOptions::forced()),
            coordinator.extract(ExtractionOptions::default()),
        );
        let sources: Vec<ResultSource> = [first, second, third]
            .into_iter()
            .map(|r| r.unwrap().source)
            .collect();

        assert_eq!(adapter.calls(), 1);
        assert_eq!(sources.iter().filter(|s| **s == ResultSource::Fresh).count(), 1);
        assert_eq!(sources.iter().filter(|s| **s == ResultSource::Queued).count(), 2);
        assert_eq!(coordinator.store().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_result_is_cached() {
        let adapter = MockAdapter::new(Duration::from_millis(50), &["a"]);
        let coordinator = coordinator(&adapter);

        let fresh = coordinator.extract(ExtractionOptions::default()).await.unwrap();
        assert_eq!(fresh.source, ResultSource::Fresh);

        sleep(Duration::from_secs(1)).await;
        let cached = coordinator.extract(ExtractionOptions::default()).await.unwrap();
        assert_eq!(cached.source, ResultSource::Cached);
        assert_eq!(cached.duration, Duration::ZERO);
        assert_eq!(cached.prompts, fresh.prompts);
        assert_eq!(adapter.calls(), 1);

        let forced = coordinator.extract(ExtractionOptions::forced()).await.unwrap();
        assert_eq!(forced.source, ResultSource::Fresh);

        sleep(Duration::from_secs(6)).await;
        let expired = coordinator.extract(ExtractionOptions::default()).await.unwrap();
        assert_eq!(expired.source, ResultSource::Fresh);
        assert_eq!(adapter.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dom_change_invalidates_cache() {
        let adapter = MockAdapter::new(Duration::from_millis(10), &["a"]);
        let coordinator = coordinator(&adapter);

        coordinator.extract(ExtractionOptions::default()).await.unwrap();
        coordinator.invalidate_cache();
        let next = coordinator.extract(ExtractionOptions::default()).await.unwrap();
        assert_eq!(next.source, ResultSource::Fresh);

        coordinator.clear_cache();
        let after_clear = coordinator.extract(ExtractionOptions::default()).await.unwrap();
        assert_eq!(after_clear.source, ResultSource::Fresh);
        assert_eq!(adapter.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_scan_keeps_store() {
        let adapter = MockAdapter::new(Duration::from_millis(10), &[]);
        let coordinator = coordinator(&adapter);
        coordinator.store().replace_all(prompts(&["kept one", "kept two"]));

        let result = coordinator.extract(ExtractionOptions::forced()).await.unwrap();
        assert!(result.prompts.is_empty());
        assert_eq!(coordinator.store().len(), 2);

        let again = coordinator.extract(ExtractionOptions::default()).await.unwrap();
        assert_eq!(again.source, ResultSource::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strategies_apply_merge_policy() {
        let adapter = MockAdapter::new(Duration::from_millis(10), &["x"]);
        let coordinator = coordinator(&adapter);
        coordinator.store().replace_all(prompts(&["a"]));

        adapter.respond(Ok(prompts(&["a", "b"])));
        let viewport = coordinator
            .extract(ExtractionOptions::forced().with_strategy(ExtractionStrategy::Viewport))
            .await
            .unwrap();
        assert_eq!(viewport.prompts.len(), 2);
        assert_eq!(coordinator.store().len(), 1);

        adapter.respond(Ok(prompts(&["a", "b"])));
        let incremental = coordinator
            .extract(ExtractionOptions::forced().with_strategy(ExtractionStrategy::Incremental))
            .await
            .unwrap();
        assert!(incremental.is_incremental);
        assert_eq!(coordinator.store().len(), 2);

        adapter.respond(Ok(prompts(&["z"])));
        coordinator
            .extract(ExtractionOptions::forced().silent())
            .await
            .unwrap();
        assert_eq!(coordinator.store().len(), 2);

        coordinator.extract(ExtractionOptions::forced()).await.unwrap();
        let contents: Vec<String> = coordinator.store().all().into_iter().map(|p| p.content).collect();
        assert_eq!(contents, vec!["x".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_during_scan_runs_one_follow_up() {
        let adapter = MockAdapter::new(Duration::from_millis(100), &["a"]);
        let coordinator = coordinator(&adapter);

        let running = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.extract(ExtractionOptions::forced()).await }
        });
        sleep(Duration::from_millis(10)).await;
        assert!(coordinator.is_extracting());
        coordinator.mark_pending_mutation();
        coordinator.mark_pending_mutation();

        let first = running.await.unwrap().unwrap();
        assert_eq!(first.source, ResultSource::Fresh);
        assert!(coordinator.is_extracting());

        sleep(Duration::from_millis(150)).await;
        assert_eq!(adapter.calls(), 2);
        assert!(!coordinator.is_extracting());

        sleep(Duration::from_secs(2)).await;
        assert_eq!(adapter.calls(), 2);
        assert_eq!(coordinator.state(), ExtractionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_follow_up_is_published() {
        let adapter = MockAdapter::new(Duration::from_millis(100), &["a"]);
        adapter.respond(Ok(prompts(&["a"])));
        adapter.respond(Err(ExtractionError::DomNotReady("thread re-rendering".into())));
        let coordinator = coordinator(&adapter);

        let running = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.extract(ExtractionOptions::forced()).await }
        });
        sleep(Duration::from_millis(10)).await;
        coordinator.mark_pending_mutation();

        assert!(running.await.unwrap().is_ok());
        sleep(Duration::from_millis(150)).await;
        assert_eq!(adapter.calls(), 2);
        assert_eq!(coordinator.state(), ExtractionState::Error);

        let failures: Vec<AppEvent> = coordinator
            .store()
            .events()
            .history()
            .into_iter()
            .filter(|e| matches!(e, AppEvent::ExtractionFailed { .. }))
            .collect();
        assert_eq!(
            failures,
            vec![AppEvent::ExtractionFailed {
                code: ExtractionErrorCode::DomNotReady,
                message: ExtractionError::DomNotReady("thread re-rendering".into()).to_string(),
            }]
        );
        assert_eq!(coordinator.store().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_caller_failure_is_not_published() {
        let adapter = MockAdapter::new(Duration::from_millis(10), &["a"]);
        adapter.respond(Err(ExtractionError::DomNotReady("no thread".into())));
        let coordinator = coordinator(&adapter);

        assert!(coordinator.extract(ExtractionOptions::forced()).await.is_err());
        assert!(coordinator
            .store()
            .events()
            .history()
            .iter()
            .all(|e| !matches!(e, AppEvent::ExtractionFailed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_while_idle_only_dirties_cache() {
        let adapter = MockAdapter::new(Duration::from_millis(10), &["a"]);
        let coordinator = coordinator(&adapter);

        coordinator.extract(ExtractionOptions::default()).await.unwrap();
        coordinator.mark_pending_mutation();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(adapter.calls(), 1);

        let next = coordinator.extract(ExtractionOptions::default()).await.unwrap();
        assert_eq!(next.source, ResultSource::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_idle() {
        let adapter = MockAdapter::new(Duration::from_secs(20), &["a"]);
        let coordinator = coordinator(&adapter);
        coordinator.store().replace_all(prompts(&["kept"]));

        let err = coordinator.extract(ExtractionOptions::forced()).await.unwrap_err();
        assert_eq!(err, ExtractionError::Timeout(Duration::from_secs(10)));
        assert_eq!(coordinator.state(), ExtractionState::Error);
        assert_eq!(coordinator.store().len(), 1);

        sleep(Duration::from_millis(1100)).await;
        assert_eq!(coordinator.state(), ExtractionState::Idle);

        let short = coordinator
            .extract(ExtractionOptions::forced().with_timeout(Duration::from_millis(5)))
            .await
            .unwrap_err();
        assert_eq!(short.code(), ExtractionErrorCode::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_caller_gets_same_error() {
        let adapter = MockAdapter::new(Duration::from_millis(50), &["a"]);
        adapter.respond(Err(ExtractionError::DomNotReady("no thread".into())));
        let coordinator = coordinator(&adapter);

        let (first, second) = tokio::join!(
            coordinator.extract(ExtractionOptions::forced()),
            coordinator.extract(ExtractionOptions::forced()),
        );
        assert_eq!(first.unwrap_err(), ExtractionError::DomNotReady("no thread".into()));
        assert_eq!(second.unwrap_err(), ExtractionError::DomNotReady("no thread".into()));
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_state_resets_to_idle() {
        let adapter = MockAdapter::new(Duration::from_millis(10), &["a"]);
        let coordinator = coordinator(&adapter);

        coordinator.extract(ExtractionOptions::forced()).await.unwrap();
        assert_eq!(coordinator.state(), ExtractionState::Completed);
        sleep(Duration::from_millis(500)).await;
        assert_eq!(coordinator.state(), ExtractionState::Completed);
        sleep(Duration::from_millis(600)).await;
        assert_eq!(coordinator.state(), ExtractionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_discards_running_scan() {
        let adapter = MockAdapter::new(Duration::from_millis(100), &["stale"]);
        let coordinator = coordinator(&adapter);

        let running = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.extract(ExtractionOptions::forced()).await }
        });
        sleep(Duration::from_millis(10)).await;
        coordinator.reset();
        assert!(!coordinator.is_extracting());

        let result = running.await.unwrap().unwrap();
        assert_eq!(result.prompts.len(), 1);
        assert!(coordinator.store().is_empty());
        assert_eq!(coordinator.state(), ExtractionState::Idle);
    }
}
