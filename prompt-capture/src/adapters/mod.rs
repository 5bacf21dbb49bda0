//! Platform adapters.
//!
//! An adapter is the facade the coordinator and the session talk to: it scans
//! the page for user prompts and wires up change observation. Every built-in
//! platform shares [`DomPlatformAdapter`] and differs only in its
//! [`SiteRules`] table.

pub mod sites;

pub use sites::{SiteRules, UserMarker};

use crate::config::Config;
use crate::dom::{Document, SelectorError};
use crate::types::{now_millis, ExtractionError, PlatformKind, Prompt};
use crate::watcher::{ChangeCallback, ChangeWatcher, ObserveOptions, WatchPhase, WatcherSettings};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Invalid site rule for {platform}: {source}")]
    InvalidRule {
        platform: PlatformKind,
        #[source]
        source: SelectorError,
    },
}

/// Trait for platform adapters
#[async_trait::async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn kind(&self) -> PlatformKind;

    fn name(&self) -> &'static str {
        self.kind().display_name()
    }

    /// Whether this adapter recognises the page
    fn detect(&self, url: &str, document: &Document) -> bool;

    fn initialize(&self) -> Result<(), ExtractionError>;

    /// Full scan of the page for user prompts
    async fn extract_prompts(&self) -> Result<Vec<Prompt>, ExtractionError>;

    /// Start (or restart) change observation
    fn observe_changes(&self, callback: ChangeCallback, options: ObserveOptions);

    /// Stop observation and release page resources
    fn destroy(&self);

    /// Drop any adapter-side caches
    fn clear_cache(&self) {}
}

/// Rule-driven adapter shared by all built-in platforms
pub struct DomPlatformAdapter {
    rules: Arc<SiteRules>,
    document: Document,
    watcher: ChangeWatcher,
    initialized: AtomicBool,
    min_content_chars: usize,
}

impl DomPlatformAdapter {
    pub fn new(rules: SiteRules, document: Document, config: &Config) -> Self {
        let rules = Arc::new(rules);
        let settings = WatcherSettings {
            debounce: Duration::from_millis(config.watcher.debounce_ms),
            ui_root_id: config.watcher.ui_root_id.clone(),
        };
        let watcher = ChangeWatcher::new(document.clone(), Arc::clone(&rules), settings);
        Self {
            rules,
            document,
            watcher,
            initialized: AtomicBool::new(false),
            min_content_chars: config.extraction.min_content_chars,
        }
    }

    pub fn rules(&self) -> &SiteRules {
        &self.rules
    }

    pub fn watcher(&self) -> &ChangeWatcher {
        &self.watcher
    }

    pub fn watch_phase(&self) -> Option<WatchPhase> {
        self.watcher.phase()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn scan(&self) -> Vec<Prompt> {
        let page = self.document.read();
        let now = now_millis();
        let mut prompts: Vec<Prompt> = Vec::new();

        for candidate in self.rules.find_user_messages(&page) {
            let message = self.rules.message_node(&page, candidate);
            let text = self.rules.extract_text(&page, message);
            if text.chars().count() < self.min_content_chars {
                trace!(chars = text.chars().count(), "skipping short message");
                continue;
            }
            let timestamp = self
                .rules
                .extract_timestamp(&page, candidate, message)
                .unwrap_or(now);
            if let Some(prompt) = Prompt::new(&text, timestamp, Some(prompts.len())) {
                prompts.push(prompt.with_source_element(message));
            }
        }

        prompts.sort_by_key(|p| (p.timestamp, p.dom_index));
        prompts
    }
}

#[async_trait::async_trait]
impl PlatformAdapter for DomPlatformAdapter {
    fn kind(&self) -> PlatformKind {
        self.rules.kind()
    }

    fn detect(&self, url: &str, document: &Document) -> bool {
        self.rules.matches_url(url) || self.rules.dom_feature_score(&document.read()) > 0.5
    }

    fn initialize(&self) -> Result<(), ExtractionError> {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            info!(platform = self.name(), "adapter initialized");
        }
        Ok(())
    }

    async fn extract_prompts(&self) -> Result<Vec<Prompt>, ExtractionError> {
        if !self.is_initialized() {
            return Err(ExtractionError::AdapterNotInitialized(self.name().to_string()));
        }
        let prompts = self.scan();
        debug!(platform = self.name(), count = prompts.len(), "scanned page");
        Ok(prompts)
    }

    fn observe_changes(&self, callback: ChangeCallback, options: ObserveOptions) {
        self.watcher.start(callback, options);
    }

    fn destroy(&self) {
        self.watcher.disconnect();
        self.initialized.store(false, Ordering::SeqCst);
        debug!(platform = self.name(), "adapter destroyed");
    }
}

/// Build the adapter for `kind` over `document`
pub fn create_adapter(
    kind: PlatformKind,
    document: Document,
    config: &Config,
) -> Result<Arc<dyn PlatformAdapter>, AdapterError> {
    let rules = SiteRules::for_platform(kind)
        .map_err(|source| AdapterError::InvalidRule {
            platform: kind,
            source,
        })?
        .with_extra_ignored_tags(&config.extraction.extra_ignored_tags);
    Ok(Arc::new(DomPlatformAdapter::new(rules, document, config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn turn(role: &str, text: &str) -> String {
        format!(
            r#"<article data-turn="{role}"><div data-message-author-role="{role}">{text}</div></article>"#
        )
    }

    fn chatgpt_page(turns: Vec<String>) -> Document {
        Document::parse(
            "https://chatgpt.com/c/abc",
            &format!(r#"<main id="main">{}</main>"#, turns.concat()),
        )
    }

    fn adapter(doc: &Document, config: &Config) -> DomPlatformAdapter {
        let rules = SiteRules::for_platform(PlatformKind::ChatGpt).unwrap();
        DomPlatformAdapter::new(rules, doc.clone(), config)
    }

    #[tokio::test]
    async fn test_extract_requires_initialize() {
        let doc = chatgpt_page(vec![turn("user", "hello there")]);
        let adapter = adapter(&doc, &Config::default());

        let err = adapter.extract_prompts().await.unwrap_err();
        assert_eq!(err.code(), crate::types::ExtractionErrorCode::AdapterNotInitialized);

        adapter.initialize().unwrap();
        assert_eq!(adapter.extract_prompts().await.unwrap().len(), 1);

        adapter.destroy();
        assert!(adapter.extract_prompts().await.is_err());
    }

    #[tokio::test]
    async fn test_scan_keeps_user_turns_in_order() {
        let doc = chatgpt_page(vec![
            turn("user", "first question"),
            turn("assistant", "an answer"),
            turn("user", "x"),
            turn("user", "second question"),
        ]);
        let adapter = adapter(&doc, &Config::default());
        adapter.initialize().unwrap();

        let prompts = adapter.extract_prompts().await.unwrap();
        let contents: Vec<&str> = prompts.iter().map(|p| p.content.as_str()).collect();
        assert_eq!(contents, vec!["first question", "second question"]);
        assert_eq!(prompts[0].dom_index, Some(0));
        assert_eq!(prompts[1].dom_index, Some(1));
        assert!(prompts.iter().all(|p| p.source_element.is_some()));
    }

    #[tokio::test]
    async fn test_min_content_chars_is_configurable() {
        let doc = chatgpt_page(vec![turn("user", "ok"), turn("user", "hello")]);
        let mut config = Config::default();
        config.extraction.min_content_chars = 3;
        let adapter = adapter(&doc, &config);
        adapter.initialize().unwrap();

        let prompts = adapter.extract_prompts().await.unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].content, "hello");
    }

    #[tokio::test]
    async fn test_page_timestamps_order_prompts() {
        let doc = chatgpt_page(vec![
            turn("user", "later").replace("<article ", r#"<article data-timestamp="2000" "#),
            turn("user", "earlier").replace("<article ", r#"<article data-timestamp="1000" "#),
        ]);
        let adapter = adapter(&doc, &Config::default());
        adapter.initialize().unwrap();

        let prompts = adapter.extract_prompts().await.unwrap();
        assert_eq!(prompts[0].content, "earlier");
        assert_eq!(prompts[0].timestamp, 1000);
        assert_eq!(prompts[0].dom_index, Some(1));
        assert_eq!(prompts[1].content, "later");
    }

    #[test]
    fn test_detect_by_url_or_dom() {
        let config = Config::default();
        let doc = chatgpt_page(Vec::new());
        let adapter = adapter(&doc, &config);
        assert!(adapter.detect("https://chatgpt.com/c/abc", &doc));

        let elsewhere = Document::parse(
            "https://example.com/",
            &format!(
                r#"<div class="react-scroll-to-bottom--css">{}</div>"#,
                turn("user", "hi")
            ),
        );
        assert!(adapter.detect("https://example.com/", &elsewhere));

        let blank = Document::new("https://example.com/");
        assert!(!adapter.detect("https://example.com/", &blank));
    }

    #[test]
    fn test_factory_builds_every_platform() {
        let config = Config::default();
        for kind in PlatformKind::ALL {
            let adapter = create_adapter(kind, Document::new("about:blank"), &config).unwrap();
            assert_eq!(adapter.kind(), kind);
            assert_eq!(adapter.name(), kind.display_name());
        }
    }
}
