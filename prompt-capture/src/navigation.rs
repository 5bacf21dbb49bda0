//! Conversation switch detection by URL path polling.

use crate::dom::Document;
use lazy_static::lazy_static;
use regex::Regex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

lazy_static! {
    /// Path shapes that carry a conversation id, across the supported sites
    static ref CONVERSATION_PATHS: Vec<Regex> = vec![
        Regex::new(r"^/c/([A-Za-z0-9_-]+)").unwrap(),
        Regex::new(r"^/g/[^/]+/c/([A-Za-z0-9_-]+)").unwrap(),
        Regex::new(r"^/a/chat/s/([A-Za-z0-9_-]+)").unwrap(),
        Regex::new(r"^/chat/([A-Za-z0-9_-]+)").unwrap(),
        Regex::new(r"^/app/([A-Za-z0-9_-]+)").unwrap(),
    ];
}

/// The page moved to a different path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChange {
    pub from: String,
    pub to: String,
    pub conversation_id: Option<String>,
}

/// Path component of a URL; unparseable input is returned as-is
pub fn url_path(raw: &str) -> String {
    url::Url::parse(raw)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| raw.to_string())
}

/// Conversation id embedded in a path, if the path has a known shape
pub fn conversation_id(path: &str) -> Option<String> {
    CONVERSATION_PATHS
        .iter()
        .find_map(|re| re.captures(path))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Background task polling the document URL
pub struct NavigationWatcher {
    task: JoinHandle<()>,
}

impl NavigationWatcher {
    pub fn spawn(document: Document, interval: Duration) -> (Self, mpsc::Receiver<PathChange>) {
        let (tx, rx) = mpsc::channel(16);
        let period = interval.max(Duration::from_millis(1));
        let mut current = url_path(&document.url());
        debug!(path = %current, ?period, "watching navigation");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let path = url_path(&document.url());
                if path == current {
                    continue;
                }
                let change = PathChange {
                    from: std::mem::replace(&mut current, path.clone()),
                    conversation_id: conversation_id(&path),
                    to: path,
                };
                info!(from = %change.from, to = %change.to, "conversation path changed");
                if tx.send(change).await.is_err() {
                    break;
                }
            }
        });

        (Self { task }, rx)
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for NavigationWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
