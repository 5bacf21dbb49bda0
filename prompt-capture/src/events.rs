//! In-process event bus.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: slow receivers may miss events
//!   (`RecvError::Lagged`)
//! - **Bounded history**: the last few events are kept for late inspection
//!
//! The bus is constructed explicitly and handed to whoever needs it; clones
//! share the same channel.

use crate::types::{ExtractionErrorCode, Prompt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity for the event bus.
const DEFAULT_CAPACITY: usize = 256;

/// Events kept in [`EventBus::history`]
const HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// The store changed; carries the current filtered view
    PromptsUpdated(Arc<[Prompt]>),
    /// The conversation path changed
    UrlChanged { from: String, to: String },
    /// An extraction failed and was not retried
    ExtractionFailed {
        code: ExtractionErrorCode,
        message: String,
    },
}

impl AppEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AppEvent::PromptsUpdated(_) => "prompts_updated",
            AppEvent::UrlChanged { .. } => "url_changed",
            AppEvent::ExtractionFailed { .. } => "extraction_failed",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AppEvent>,
    history: Arc<Mutex<VecDeque<AppEvent>>>,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            history: Arc::new(Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT))),
        }
    }

    /// Publish to all current subscribers.
    ///
    /// Returns the number of receivers that received the event.
    pub fn emit(&self, event: AppEvent) -> usize {
        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        trace!(event = event.name(), "emitting event");
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Most recent events, oldest first
    pub fn history(&self) -> Vec<AppEvent> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear_history(&self) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let delivered = bus.emit(AppEvent::UrlChanged {
            from: "/c/1".into(),
            to: "/c/2".into(),
        });
        assert_eq!(delivered, 1);

        match rx.recv().await.unwrap() {
            AppEvent::UrlChanged { from, to } => {
                assert_eq!(from, "/c/1");
                assert_eq!(to, "/c/2");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.emit(AppEvent::PromptsUpdated(Arc::from(Vec::new()))), 0);
        assert_eq!(bus.history().len(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = EventBus::new();
        for i in 0..15 {
            bus.emit(AppEvent::UrlChanged {
                from: format!("/c/{}", i),
                to: format!("/c/{}", i + 1),
            });
        }
        let history = bus.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(
            history[0],
            AppEvent::UrlChanged {
                from: "/c/5".into(),
                to: "/c/6".into()
            }
        );

        bus.clear_history();
        assert!(bus.history().is_empty());
    }

    #[test]
    fn test_clones_share_channel() {
        let bus = EventBus::new();
        let _rx = bus.subscribe();
        let clone = bus.clone();
        assert_eq!(clone.subscriber_count(), 1);
    }
}
