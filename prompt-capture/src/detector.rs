//! Platform detection from the page URL and DOM.

use crate::adapters::{AdapterError, SiteRules};
use crate::dom::Document;
use crate::types::PlatformKind;
use serde::Serialize;
use tracing::debug;

/// Minimum DOM feature score for a DOM-only match
pub const DOM_CONFIDENCE_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Url,
    Dom,
    Configured,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub platform: Option<PlatformKind>,
    pub detected: bool,
    /// 0.0 to 1.0
    pub confidence: f64,
    pub method: DetectionMethod,
}

impl DetectionResult {
    /// Platform forced by configuration
    pub fn configured(kind: PlatformKind) -> Self {
        Self {
            platform: Some(kind),
            detected: true,
            confidence: 1.0,
            method: DetectionMethod::Configured,
        }
    }
}

pub struct PlatformDetector {
    rules: Vec<SiteRules>,
}

impl PlatformDetector {
    /// Detector over every built-in platform
    pub fn new() -> Result<Self, AdapterError> {
        let rules = PlatformKind::ALL
            .iter()
            .map(|kind| {
                SiteRules::for_platform(*kind).map_err(|source| AdapterError::InvalidRule {
                    platform: *kind,
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn detect(&self, url: &str, document: &Document) -> DetectionResult {
        if let Some(rules) = self.rules.iter().find(|r| r.matches_url(url)) {
            debug!(platform = %rules.kind(), url, "platform detected from URL");
            return DetectionResult {
                platform: Some(rules.kind()),
                detected: true,
                confidence: 1.0,
                method: DetectionMethod::Url,
            };
        }

        let page = document.read();
        let mut best: Option<(PlatformKind, f64)> = None;
        for rules in &self.rules {
            let score = rules.dom_feature_score(&page);
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((rules.kind(), score));
            }
        }

        match best {
            Some((kind, score)) if score > DOM_CONFIDENCE_THRESHOLD => {
                debug!(platform = %kind, score, "platform detected from DOM");
                DetectionResult {
                    platform: Some(kind),
                    detected: true,
                    confidence: score,
                    method: DetectionMethod::Dom,
                }
            }
            best => DetectionResult {
                platform: None,
                detected: false,
                confidence: best.map_or(0.0, |(_, score)| score),
                method: DetectionMethod::Dom,
            },
        }
    }
}
