//! Scripted page fixtures.
//!
//! A fixture describes a page (URL plus initial HTML) and a list of steps that
//! mutate it over time. Replaying a fixture runs a full [`PageSession`]
//! against the page and returns whatever the store holds at the end.

use crate::config::Config;
use crate::dom::{parse_selector, Document, NodeId, SelectorError};
use crate::events::EventBus;
use crate::session::{PageSession, SessionError};
use crate::types::Prompt;
use crate::watcher::ExtractionMonitor;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("Failed to read fixture: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid fixture: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid selector in fixture: {0}")]
    Selector(#[from] SelectorError),

    #[error("No node matches `{0}`")]
    MissingNode(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageFixture {
    pub url: String,
    /// Page markup, a full document or just the body content
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub steps: Vec<FixtureStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FixtureStep {
    Wait {
        ms: u64,
    },
    Append {
        /// Selector of the parent element
        parent: String,
        html: String,
    },
    Remove {
        selector: String,
    },
    SetAttribute {
        selector: String,
        name: String,
        value: String,
    },
    /// Change the URL and optionally swap the body content
    Navigate {
        url: String,
        #[serde(default)]
        body: Option<String>,
    },
}

impl PageFixture {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self, ReplayError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn build_document(&self) -> Document {
        Document::parse(&self.url, &self.html)
    }
}

fn resolve(document: &Document, selector: &str) -> Result<NodeId, ReplayError> {
    let compiled = parse_selector(selector)?;
    let page = document.read();
    page.query(page.root(), &compiled)
        .ok_or_else(|| ReplayError::MissingNode(selector.to_string()))
}

async fn apply_step(document: &Document, step: &FixtureStep) -> Result<(), ReplayError> {
    debug!(?step, "applying fixture step");
    match step {
        FixtureStep::Wait { ms } => sleep(Duration::from_millis(*ms)).await,
        FixtureStep::Append { parent, html } => {
            let parent = resolve(document, parent)?;
            document.append(parent, html);
        }
        FixtureStep::Remove { selector } => {
            let node = resolve(document, selector)?;
            document.remove(node);
        }
        FixtureStep::SetAttribute {
            selector,
            name,
            value,
        } => {
            let node = resolve(document, selector)?;
            document.set_attribute(node, name, value);
        }
        FixtureStep::Navigate { url, body } => {
            document.set_url(url);
            if let Some(body) = body {
                let root = document.read().body();
                document.replace_children(root, body);
            }
        }
    }
    Ok(())
}

/// Run a session over the fixture and return the final store contents
pub async fn replay(
    config: Config,
    fixture: &PageFixture,
    events: EventBus,
) -> Result<Vec<Prompt>, ReplayError> {
    let settle = Duration::from_millis(config.watcher.debounce_ms + 50);
    let document = fixture.build_document();
    let session = PageSession::start(config, document.clone(), events).await?;
    info!(
        platform = %session.platform(),
        steps = fixture.steps.len(),
        "replaying fixture"
    );

    for step in &fixture.steps {
        apply_step(&document, step).await?;
    }

    sleep(settle).await;
    while session.coordinator().is_extracting() {
        sleep(Duration::from_millis(10)).await;
    }

    let prompts = session.store().all();
    session.shutdown();
    Ok(prompts)
}
