//! Prompt Capture - prompt extraction for AI chat pages
//!
//! This crate finds the prompts a user typed into a chat web page and keeps an
//! authoritative, deduplicated list of them while the page changes:
//!
//! - **Adapters**: per-site scraping rules behind one adapter trait
//! - **Coordinator**: single-flight extraction with a freshness cache
//! - **Store**: reconciliation, filtering and change notification
//! - **Watcher**: two-phase DOM observation with debouncing
//!
//! # Architecture
//!
//! A [`PageSession`] owns one page. DOM mutations are observed by the change
//! watcher, debounced, and turned into extraction requests; the coordinator
//! serializes those requests and forwards results to the store, which
//! publishes [`AppEvent::PromptsUpdated`] on the [`EventBus`].

pub mod adapters;
pub mod config;
pub mod coordinator;
pub mod debounce;
pub mod detector;
pub mod dom;
pub mod events;
pub mod export;
pub mod navigation;
pub mod replay;
pub mod session;
pub mod store;
pub mod text;
pub mod types;
pub mod watcher;

// Re-export commonly used types
pub use adapters::{create_adapter, AdapterError, DomPlatformAdapter, PlatformAdapter, SiteRules};
pub use config::{Config, ConfigError};
pub use coordinator::{CoordinatorSettings, ExtractionCoordinator};
pub use debounce::Debouncer;
pub use detector::{DetectionMethod, DetectionResult, PlatformDetector};
pub use dom::{parse_selector, Document, NodeId, Page, Selector, SelectorError};
pub use events::{AppEvent, EventBus};
pub use navigation::{NavigationWatcher, PathChange};
pub use session::{PageSession, SessionError};
pub use store::{PromptStore, StoreStats};
pub use types::{
    ExtractionError, ExtractionErrorCode, ExtractionOptions, ExtractionResult, ExtractionState,
    ExtractionStrategy, FilterOptions, MergeOptions, PlatformKind, Prompt, PromptOrigin,
    ResultSource,
};
pub use watcher::{ChangeWatcher, ExtractionMonitor, ObserveOptions, WatchPhase};
