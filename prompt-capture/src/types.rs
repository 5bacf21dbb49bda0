//! Core types used throughout prompt capture.
//!
//! This module defines the prompt record, the extraction state machine, the
//! options and results exchanged with the coordinator, and the typed
//! extraction error.

use crate::dom::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Supported chat platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlatformKind {
    #[serde(rename = "chatgpt")]
    ChatGpt,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "claude")]
    Claude,
    #[serde(rename = "deepseek")]
    DeepSeek,
    #[serde(rename = "qwen-cn")]
    QwenCn,
    #[serde(rename = "qwen-intl")]
    QwenIntl,
    #[serde(rename = "kimi")]
    Kimi,
    #[serde(rename = "doubao")]
    Doubao,
}

impl PlatformKind {
    pub const ALL: [PlatformKind; 8] = [
        PlatformKind::ChatGpt,
        PlatformKind::Gemini,
        PlatformKind::Claude,
        PlatformKind::DeepSeek,
        PlatformKind::QwenCn,
        PlatformKind::QwenIntl,
        PlatformKind::Kimi,
        PlatformKind::Doubao,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformKind::ChatGpt => "chatgpt",
            PlatformKind::Gemini => "gemini",
            PlatformKind::Claude => "claude",
            PlatformKind::DeepSeek => "deepseek",
            PlatformKind::QwenCn => "qwen-cn",
            PlatformKind::QwenIntl => "qwen-intl",
            PlatformKind::Kimi => "kimi",
            PlatformKind::Doubao => "doubao",
        }
    }

    /// Human readable name used in logs
    pub fn display_name(&self) -> &'static str {
        match self {
            PlatformKind::ChatGpt => "ChatGPT",
            PlatformKind::Gemini => "Gemini",
            PlatformKind::Claude => "Claude",
            PlatformKind::DeepSeek => "DeepSeek",
            PlatformKind::QwenCn => "Qwen (CN)",
            PlatformKind::QwenIntl => "Qwen",
            PlatformKind::Kimi => "Kimi",
            PlatformKind::Doubao => "Doubao",
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for PlatformKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        PlatformKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == needle)
            .ok_or_else(|| format!("unknown platform: {}", s))
    }
}

/// Where a prompt came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptOrigin {
    /// Scraped from the page DOM
    #[default]
    Dom,
    /// Intercepted from network traffic (reserved, nothing produces it yet)
    Network,
}

/// A single extracted user message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    /// `prompt_<timestamp>_<dom_index>_<hash>`
    pub id: String,
    /// Trimmed, never empty
    pub content: String,
    /// Unix milliseconds, best effort
    pub timestamp: i64,
    /// Position among the prompts of the scan that produced it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_index: Option<usize>,
    /// Node the content was read from, only used for scroll-to
    #[serde(skip)]
    pub source_element: Option<NodeId>,
    #[serde(default)]
    pub origin: PromptOrigin,
}

impl Prompt {
    /// Build a prompt from raw text.
    ///
    /// Returns `None` when the text is empty after trimming.
    pub fn new(content: &str, timestamp: i64, dom_index: Option<usize>) -> Option<Self> {
        let content = content.trim();
        if content.is_empty() {
            return None;
        }

        let id = format!(
            "prompt_{}_{}_{}",
            timestamp,
            dom_index.map(|i| i.to_string()).unwrap_or_else(|| "x".to_string()),
            compute_short_hash(content)
        );

        Some(Self {
            id,
            content: content.to_string(),
            timestamp,
            dom_index,
            source_element: None,
            origin: PromptOrigin::Dom,
        })
    }

    pub fn with_source_element(mut self, node: NodeId) -> Self {
        self.source_element = Some(node);
        self
    }

    pub fn with_origin(mut self, origin: PromptOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Content length in characters
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

// The node reference is a navigation aid and never part of identity.
impl PartialEq for Prompt {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.content == other.content
            && self.timestamp == other.timestamp
            && self.dom_index == other.dom_index
            && self.origin == other.origin
    }
}

impl Eq for Prompt {}

/// Compute a short hash of content for prompt ids
/// Uses first 12 chars of SHA-256 hex (48 bits of entropy)
pub fn compute_short_hash(content: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let hash = hasher.finalize();
    hash[..6].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Wall clock in Unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Coordinator state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionState {
    #[default]
    Idle,
    Extracting,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStrategy {
    /// Complete re-scan, replaces the store when non-empty
    #[default]
    Full,
    /// Scan and append to the store
    Incremental,
    /// Read-only scan, never touches the store
    Viewport,
}

/// Options for a single `extract` call
#[derive(Debug, Clone, Default)]
pub struct ExtractionOptions {
    pub strategy: ExtractionStrategy,
    /// Bypass the freshness cache
    pub force: bool,
    /// Overrides the coordinator's default timeout
    pub timeout: Option<Duration>,
    /// Do not forward the result to the store
    pub silent: bool,
}

impl ExtractionOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: ExtractionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

/// How an extraction result was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    /// This call ran the DOM scan
    Fresh,
    /// This call joined a scan that was already in flight
    Queued,
    /// Served from the freshness cache
    Cached,
}

#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub prompts: Vec<Prompt>,
    pub source: ResultSource,
    pub is_incremental: bool,
    pub duration: Duration,
    /// Unix milliseconds at which the result was handed out
    pub timestamp: i64,
}

/// Discriminant of [`ExtractionError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionErrorCode {
    Timeout,
    AdapterNotInitialized,
    DomNotReady,
    Unknown,
}

impl ExtractionErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionErrorCode::Timeout => "timeout",
            ExtractionErrorCode::AdapterNotInitialized => "adapter_not_initialized",
            ExtractionErrorCode::DomNotReady => "dom_not_ready",
            ExtractionErrorCode::Unknown => "unknown",
        }
    }
}

/// Errors that can occur during extraction
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("Extraction timed out after {0:?}")]
    Timeout(Duration),

    #[error("Adapter not initialized: {0}")]
    AdapterNotInitialized(String),

    #[error("DOM not ready: {0}")]
    DomNotReady(String),

    #[error("Extraction failed: {0}")]
    Unknown(String),
}

impl ExtractionError {
    pub fn code(&self) -> ExtractionErrorCode {
        match self {
            ExtractionError::Timeout(_) => ExtractionErrorCode::Timeout,
            ExtractionError::AdapterNotInitialized(_) => ExtractionErrorCode::AdapterNotInitialized,
            ExtractionError::DomNotReady(_) => ExtractionErrorCode::DomNotReady,
            ExtractionError::Unknown(_) => ExtractionErrorCode::Unknown,
        }
    }
}

/// Reconciliation options for [`crate::store::PromptStore::merge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    pub dedupe: bool,
    /// Milliseconds; zero compares content only
    pub time_window: i64,
    /// Append in arrival order, otherwise re-sort newest first
    pub preserve_order: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            dedupe: true,
            time_window: 0,
            preserve_order: true,
        }
    }
}

/// Filtered view criteria
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

impl FilterOptions {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
