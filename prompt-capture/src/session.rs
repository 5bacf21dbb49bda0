//! Page session: everything that runs for one chat page.
//!
//! The session detects the platform, builds the adapter, store and
//! coordinator, runs the initial extraction, and keeps the page in sync
//! afterwards through DOM observation, periodic extraction and conversation
//! switch handling.

use crate::adapters::{create_adapter, AdapterError, PlatformAdapter};
use crate::config::Config;
use crate::coordinator::{CoordinatorSettings, ExtractionCoordinator};
use crate::detector::{DetectionResult, PlatformDetector};
use crate::dom::Document;
use crate::events::{AppEvent, EventBus};
use crate::navigation::{NavigationWatcher, PathChange};
use crate::store::PromptStore;
use crate::types::{ExtractionError, ExtractionOptions, ExtractionResult, PlatformKind};
use crate::watcher::{ChangeCallback, ExtractionMonitor, ObserveOptions};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::{sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Prompt capture is disabled in configuration")]
    Disabled,

    #[error("No supported platform detected at {0}")]
    NoPlatformDetected(String),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

pub struct PageSession {
    config: Config,
    document: Document,
    events: EventBus,
    store: Arc<PromptStore>,
    adapter: Arc<dyn PlatformAdapter>,
    coordinator: ExtractionCoordinator,
    detection: DetectionResult,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    navigation: Mutex<Option<NavigationWatcher>>,
}

fn report_failure(events: &EventBus, error: &ExtractionError) {
    warn!(code = error.code().as_str(), "extraction failed: {}", error);
    events.emit(AppEvent::ExtractionFailed {
        code: error.code(),
        message: error.to_string(),
    });
}

impl PageSession {
    /// Set up capture for `document` and run the initial extraction
    pub async fn start(
        config: Config,
        document: Document,
        events: EventBus,
    ) -> Result<Arc<Self>, SessionError> {
        if !config.general.enabled {
            return Err(SessionError::Disabled);
        }

        let url = document.url();
        let detection = match config.general.platform {
            Some(kind) => DetectionResult::configured(kind),
            None => PlatformDetector::new()?.detect(&url, &document),
        };
        let kind = match detection.platform {
            Some(kind) if detection.detected => kind,
            _ => return Err(SessionError::NoPlatformDetected(url)),
        };
        info!(
            platform = %kind,
            method = ?detection.method,
            confidence = detection.confidence,
            "starting page session"
        );

        let adapter = create_adapter(kind, document.clone(), &config)?;
        adapter.initialize()?;

        let store = Arc::new(
            PromptStore::new(events.clone()).with_auto_deduplicate(config.store.auto_deduplicate),
        );
        let coordinator = ExtractionCoordinator::new(
            Arc::clone(&adapter),
            Arc::clone(&store),
            CoordinatorSettings::from(&config.coordinator),
        );

        let session = Arc::new(Self {
            config,
            document,
            events,
            store,
            adapter,
            coordinator,
            detection,
            tasks: Mutex::new(Vec::new()),
            navigation: Mutex::new(None),
        });

        session.extract_with_retry().await;
        session.observe(false);
        session.spawn_navigation();
        session.spawn_periodic_extraction();
        Ok(session)
    }

    /// Explicit extraction through the coordinator
    pub async fn extract(&self, options: ExtractionOptions) -> Result<ExtractionResult, SessionError> {
        Ok(self.coordinator.extract(options).await?)
    }

    /// Initial extraction with one bounded retry when nothing is found
    async fn extract_with_retry(&self) -> usize {
        sleep(self.config.timing.extract_delay()).await;
        let found = self.forced_extraction().await;
        if found > 0 {
            return found;
        }

        debug!(
            delay_ms = self.config.timing.retry_delay_ms,
            "no prompts found, retrying once"
        );
        sleep(self.config.timing.retry_delay()).await;
        self.forced_extraction().await
    }

    async fn forced_extraction(&self) -> usize {
        match self.coordinator.extract(ExtractionOptions::forced()).await {
            Ok(result) => result.prompts.len(),
            Err(e) => {
                report_failure(&self.events, &e);
                0
            }
        }
    }

    fn observe(&self, force_initial: bool) {
        let coordinator = self.coordinator.clone();
        let events = self.events.clone();
        let callback: ChangeCallback = Arc::new(move || {
            let coordinator = coordinator.clone();
            let events = events.clone();
            tokio::spawn(async move {
                if let Err(e) = coordinator.extract(ExtractionOptions::default()).await {
                    report_failure(&events, &e);
                }
            });
        });
        let monitor: Arc<dyn ExtractionMonitor> = Arc::new(self.coordinator.clone());
        self.adapter.observe_changes(
            callback,
            ObserveOptions {
                force_initial,
                monitor: Some(monitor),
            },
        );
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    fn spawn_navigation(self: &Arc<Self>) {
        let (watcher, mut changes) = NavigationWatcher::spawn(
            self.document.clone(),
            self.config.timing.url_check_interval(),
        );
        let session = Arc::downgrade(self);
        self.track(tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                match session.upgrade() {
                    Some(session) => session.switch_conversation(&change).await,
                    None => break,
                }
            }
        }));
        *self.navigation.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
    }

    fn spawn_periodic_extraction(&self) {
        let Some(period) = self.config.timing.periodic_extraction() else {
            return;
        };
        let coordinator = self.coordinator.clone();
        let events = self.events.clone();
        self.track(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = coordinator.extract(ExtractionOptions::default()).await {
                    report_failure(&events, &e);
                }
            }
        }));
    }

    /// Drop everything belonging to the previous conversation and capture the
    /// new one
    pub async fn switch_conversation(&self, change: &PathChange) {
        info!(
            from = %change.from,
            to = %change.to,
            conversation = change.conversation_id.as_deref().unwrap_or("-"),
            "conversation switched"
        );
        self.store.clear();
        self.adapter.clear_cache();
        self.coordinator.reset();
        // Old node ids are gone with the store and the cache
        let reclaimed = self.document.compact();
        if reclaimed > 0 {
            debug!(reclaimed, "released detached nodes");
        }
        self.observe(true);
        self.events.emit(AppEvent::UrlChanged {
            from: change.from.clone(),
            to: change.to.clone(),
        });

        let found = self.extract_with_retry().await;
        debug!(found, "conversation capture finished");
    }

    /// Stop every task, release the page and empty the store
    pub fn shutdown(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        if let Some(navigation) = self
            .navigation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            navigation.stop();
        }
        self.adapter.destroy();
        self.coordinator.reset();
        self.store.clear();
        info!(platform = %self.platform(), "page session shut down");
    }

    pub fn platform(&self) -> PlatformKind {
        self.adapter.kind()
    }

    pub fn detection(&self) -> &DetectionResult {
        &self.detection
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<PromptStore> {
        &self.store
    }

    pub fn adapter(&self) -> &Arc<dyn PlatformAdapter> {
        &self.adapter
    }

    pub fn coordinator(&self) -> &ExtractionCoordinator {
        &self.coordinator
    }
}

impl Drop for PageSession {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
        // The watcher holds the coordinator through its callback.
        self.adapter.destroy();
    }
}

impl std::fmt::Debug for PageSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageSession")
            .field("platform", &self.platform())
            .field("url", &self.document.url())
            .field("prompts", &self.store.len())
            .finish()
    }
}
