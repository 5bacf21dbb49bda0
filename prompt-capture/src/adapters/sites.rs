//! Declarative per-site scraping rules.
//!
//! Each supported platform is described by a [`RuleSpec`] table of selector
//! strings which is compiled once into [`SiteRules`]. The compiled rules are
//! pure functions over a [`Page`]: they find candidate message nodes, decide
//! which ones the user wrote, and pull plain text and timestamps out of them.

use crate::dom::{parse_selector, NodeId, Page, Selector, SelectorError};
use crate::text::TextExtractor;
use crate::types::PlatformKind;
use tracing::trace;

/// How a candidate node is recognised as a user message
#[derive(Debug, Clone)]
pub enum UserMarker {
    /// Every candidate is a user message
    AllCandidates,
    /// Attribute on the candidate itself
    SelfAttribute { name: String, value: String },
    /// The candidate itself matches
    SelfMatches(Selector),
    /// Some descendant matches
    Descendant(Selector),
    /// A heading inside the candidate mentions one of the keywords
    HeadingKeywords {
        headings: Selector,
        keywords: Vec<String>,
    },
}

impl UserMarker {
    fn matches(&self, page: &Page, node: NodeId) -> bool {
        match self {
            UserMarker::AllCandidates => true,
            UserMarker::SelfAttribute { name, value } => {
                page.attr(node, name) == Some(value.as_str())
            }
            UserMarker::SelfMatches(selector) => page.matches(node, selector),
            UserMarker::Descendant(selector) => page.query(node, selector).is_some(),
            UserMarker::HeadingKeywords { headings, keywords } => {
                page.query_all(node, headings).into_iter().any(|heading| {
                    let text = page.text_content(heading);
                    keywords.iter().any(|k| text.contains(k.as_str()))
                })
            }
        }
    }
}

enum MarkerSpec {
    All,
    Attr(&'static str, &'static str),
    SelfMatches(&'static str),
    Descendant(&'static str),
    Headings(&'static str, &'static [&'static str]),
}

struct RuleSpec {
    kind: PlatformKind,
    message: &'static str,
    user: &'static [MarkerSpec],
    /// Preferred sub-node holding the message, else the candidate itself
    body: &'static [&'static str],
    /// First selector with matches wins; all its matches are joined
    text: &'static [&'static str],
    ignored_tags: &'static [&'static str],
    ignored_selectors: &'static [&'static str],
    broad_containers: &'static [&'static str],
    timestamp_attributes: &'static [&'static str],
    url_patterns: &'static [&'static str],
    dom_features: &'static [&'static str],
}

const TIMESTAMP_ATTRIBUTES: &[&str] = &["data-timestamp", "data-message-time"];

static CHATGPT: RuleSpec = RuleSpec {
    kind: PlatformKind::ChatGpt,
    message: "article",
    user: &[
        MarkerSpec::Attr("data-turn", "user"),
        MarkerSpec::Descendant(r#"[data-message-author-role="user"]"#),
        MarkerSpec::Descendant(".user-message-bubble-color"),
        MarkerSpec::Headings("h5, h6", &["你说", "You said", "You:", "你："]),
    ],
    body: &[
        ".user-message-bubble-color",
        r#"[data-message-author-role="user"]"#,
    ],
    text: &[],
    ignored_tags: &[],
    ignored_selectors: &[".sr-only"],
    broad_containers: &[
        r#"div[role="presentation"].composer-parent"#,
        "main#main",
        "main",
    ],
    timestamp_attributes: TIMESTAMP_ATTRIBUTES,
    url_patterns: &["https://chatgpt.com/*", "https://chat.openai.com/*"],
    dom_features: &[r#"[class*="react-scroll-to-bottom"]"#, "article"],
};

static GEMINI: RuleSpec = RuleSpec {
    kind: PlatformKind::Gemini,
    message: ".conversation-container",
    user: &[MarkerSpec::Descendant("user-query")],
    body: &["user-query"],
    text: &["user-query .horizontal-container", ".query-text"],
    ignored_tags: &["mat-icon", "noscript", "tts-control", "message-actions"],
    ignored_selectors: &[".cdk-visually-hidden"],
    broad_containers: &["infinite-scroller", "chat-window", "main"],
    timestamp_attributes: TIMESTAMP_ATTRIBUTES,
    url_patterns: &["https://gemini.google.com/*"],
    dom_features: &["user-query", "model-response", ".conversation-container"],
};

static CLAUDE: RuleSpec = RuleSpec {
    kind: PlatformKind::Claude,
    message: r#"[data-testid="user-message"]"#,
    user: &[MarkerSpec::All],
    body: &[],
    text: &["p"],
    ignored_tags: &[],
    ignored_selectors: &[],
    broad_containers: &["main"],
    timestamp_attributes: TIMESTAMP_ATTRIBUTES,
    url_patterns: &["https://claude.ai/*"],
    dom_features: &[r#"[data-testid="user-message"]"#, ".font-claude-message"],
};

static DEEPSEEK: RuleSpec = RuleSpec {
    kind: PlatformKind::DeepSeek,
    message: "[data-um-id]",
    user: &[MarkerSpec::All],
    body: &[],
    text: &[".fbb737a4"],
    ignored_tags: &[],
    ignored_selectors: &["._11d6b3a", "._0a3d93b", r#"[class*="icon"]"#],
    broad_containers: &["#root", "main"],
    timestamp_attributes: TIMESTAMP_ATTRIBUTES,
    url_patterns: &["https://chat.deepseek.com/*"],
    dom_features: &["[data-um-id]", ".fbb737a4"],
};

static QWEN_CN: RuleSpec = RuleSpec {
    kind: PlatformKind::QwenCn,
    message: ".questionItem-MPmrIl",
    user: &[MarkerSpec::All],
    body: &[".bubble-uo23is"],
    text: &[".contentBox-t7l7vJ"],
    ignored_tags: &[],
    ignored_selectors: &[],
    broad_containers: &["main"],
    timestamp_attributes: TIMESTAMP_ATTRIBUTES,
    url_patterns: &["https://tongyi.com/*", "https://*.tongyi.com/*"],
    dom_features: &[".questionItem-MPmrIl", ".bubble-uo23is"],
};

static QWEN_INTL: RuleSpec = RuleSpec {
    kind: PlatformKind::QwenIntl,
    message: ".chat-user",
    user: &[MarkerSpec::All],
    body: &[".user-message-content"],
    text: &[".user-message-text-content"],
    ignored_tags: &[],
    ignored_selectors: &[],
    broad_containers: &["#chat-message-container", "main"],
    timestamp_attributes: TIMESTAMP_ATTRIBUTES,
    url_patterns: &["https://chat.qwen.ai/*"],
    dom_features: &[".chat-user", ".user-message-content"],
};

static KIMI: RuleSpec = RuleSpec {
    kind: PlatformKind::Kimi,
    message: ".segment-user",
    user: &[MarkerSpec::All],
    body: &[],
    text: &[".segment-content-box"],
    ignored_tags: &[],
    ignored_selectors: &[".segment-assistant-actions"],
    broad_containers: &[".chat-content-list", "main"],
    timestamp_attributes: TIMESTAMP_ATTRIBUTES,
    url_patterns: &[
        "https://kimi.com/*",
        "https://www.kimi.com/*",
        "https://kimi.moonshot.cn/*",
    ],
    dom_features: &[".segment-user", ".segment-content-box"],
};

static DOUBAO: RuleSpec = RuleSpec {
    kind: PlatformKind::Doubao,
    message: "[data-message-id]",
    user: &[
        MarkerSpec::SelfMatches(".justify-end"),
        MarkerSpec::Descendant(".justify-end"),
    ],
    body: &[],
    text: &[r#"[data-testid="message_text_content"]"#],
    ignored_tags: &[],
    ignored_selectors: &[],
    broad_containers: &[r#"[data-testid="message-list"]"#, "main"],
    timestamp_attributes: TIMESTAMP_ATTRIBUTES,
    url_patterns: &["https://www.doubao.com/*", "https://doubao.com/*"],
    dom_features: &["[data-message-id]", ".justify-end"],
};

fn rule_spec(kind: PlatformKind) -> &'static RuleSpec {
    match kind {
        PlatformKind::ChatGpt => &CHATGPT,
        PlatformKind::Gemini => &GEMINI,
        PlatformKind::Claude => &CLAUDE,
        PlatformKind::DeepSeek => &DEEPSEEK,
        PlatformKind::QwenCn => &QWEN_CN,
        PlatformKind::QwenIntl => &QWEN_INTL,
        PlatformKind::Kimi => &KIMI,
        PlatformKind::Doubao => &DOUBAO,
    }
}

/// Compiled scraping rules for one platform
#[derive(Debug, Clone)]
pub struct SiteRules {
    kind: PlatformKind,
    message: Selector,
    user_markers: Vec<UserMarker>,
    body: Vec<Selector>,
    text_selectors: Vec<Selector>,
    text: TextExtractor,
    broad_containers: Vec<Selector>,
    timestamp_attributes: Vec<String>,
    time_element: Selector,
    url_patterns: Vec<glob::Pattern>,
    dom_features: Vec<Selector>,
}

fn compile_all(selectors: &[&str]) -> Result<Vec<Selector>, SelectorError> {
    selectors.iter().map(|s| parse_selector(s)).collect()
}

impl SiteRules {
    /// Built-in rules for `kind`
    pub fn for_platform(kind: PlatformKind) -> Result<Self, SelectorError> {
        Self::compile(rule_spec(kind))
    }

    fn compile(spec: &RuleSpec) -> Result<Self, SelectorError> {
        let user_markers = spec
            .user
            .iter()
            .map(|marker| -> Result<UserMarker, SelectorError> {
                Ok(match marker {
                    MarkerSpec::All => UserMarker::AllCandidates,
                    MarkerSpec::Attr(name, value) => UserMarker::SelfAttribute {
                        name: name.to_string(),
                        value: value.to_string(),
                    },
                    MarkerSpec::SelfMatches(s) => UserMarker::SelfMatches(parse_selector(s)?),
                    MarkerSpec::Descendant(s) => UserMarker::Descendant(parse_selector(s)?),
                    MarkerSpec::Headings(s, keywords) => UserMarker::HeadingKeywords {
                        headings: parse_selector(s)?,
                        keywords: keywords.iter().map(|k| k.to_string()).collect(),
                    },
                })
            })
            .collect::<Result<Vec<_>, SelectorError>>()?;

        let mut text = TextExtractor::new().ignore_tags(spec.ignored_tags.iter().copied());
        for selector in compile_all(spec.ignored_selectors)? {
            text = text.ignore_selector(selector);
        }

        let url_patterns = spec
            .url_patterns
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect();

        Ok(Self {
            kind: spec.kind,
            message: parse_selector(spec.message)?,
            user_markers,
            body: compile_all(spec.body)?,
            text_selectors: compile_all(spec.text)?,
            text,
            broad_containers: compile_all(spec.broad_containers)?,
            timestamp_attributes: spec
                .timestamp_attributes
                .iter()
                .map(|a| a.to_string())
                .collect(),
            time_element: parse_selector("time[datetime]")?,
            url_patterns,
            dom_features: compile_all(spec.dom_features)?,
        })
    }

    /// Add tags to the text extractor's ignore list
    pub fn with_extra_ignored_tags(mut self, tags: &[String]) -> Self {
        self.text = self.text.ignore_tags(tags.iter().map(String::as_str));
        self
    }

    pub fn kind(&self) -> PlatformKind {
        self.kind
    }

    /// All message nodes in document order, user or not
    pub fn find_candidates(&self, page: &Page) -> Vec<NodeId> {
        page.query_all(page.root(), &self.message)
    }

    pub fn is_user_message(&self, page: &Page, node: NodeId) -> bool {
        self.user_markers.iter().any(|m| m.matches(page, node))
    }

    /// Candidates the user wrote, in document order
    pub fn find_user_messages(&self, page: &Page) -> Vec<NodeId> {
        self.find_candidates(page)
            .into_iter()
            .filter(|node| self.is_user_message(page, *node))
            .collect()
    }

    pub fn has_user_messages(&self, page: &Page) -> bool {
        self.find_candidates(page)
            .into_iter()
            .any(|node| self.is_user_message(page, node))
    }

    /// Node holding the message body for a candidate
    pub fn message_node(&self, page: &Page, candidate: NodeId) -> NodeId {
        self.body
            .iter()
            .find_map(|selector| {
                if page.matches(candidate, selector) {
                    Some(candidate)
                } else {
                    page.query(candidate, selector)
                }
            })
            .unwrap_or(candidate)
    }

    /// Plain text of a message node
    pub fn extract_text(&self, page: &Page, node: NodeId) -> String {
        for (index, selector) in self.text_selectors.iter().enumerate() {
            let matches = page.query_all(node, selector);
            if matches.is_empty() {
                continue;
            }
            let mut parts: Vec<String> = Vec::new();
            let mut taken: Vec<NodeId> = Vec::new();
            for found in matches {
                if taken.iter().any(|outer| page.contains(*outer, found)) {
                    continue;
                }
                taken.push(found);
                let part = self.text.extract(page, found);
                if !part.is_empty() {
                    parts.push(part);
                }
            }
            trace!(selector = index, parts = parts.len(), "text selector matched");
            return parts.join("\n");
        }
        self.text.extract(page, node)
    }

    /// Creation time in Unix milliseconds, if the page exposes one
    pub fn extract_timestamp(&self, page: &Page, candidate: NodeId, message: NodeId) -> Option<i64> {
        for node in [message, candidate] {
            for name in &self.timestamp_attributes {
                if let Some(ms) = page.attr(node, name).and_then(|v| v.trim().parse::<i64>().ok()) {
                    return Some(ms);
                }
            }
        }
        let time = page.query(candidate, &self.time_element)?;
        let value = page.attr(time, "datetime")?;
        chrono::DateTime::parse_from_rfc3339(value.trim())
            .ok()
            .map(|dt| dt.timestamp_millis())
    }

    /// First broad container present on the page
    pub fn broad_container(&self, page: &Page) -> Option<NodeId> {
        self.broad_containers
            .iter()
            .find_map(|selector| page.query(page.root(), selector))
    }

    pub fn matches_url(&self, url: &str) -> bool {
        self.url_patterns.iter().any(|p| p.matches(url))
    }

    /// Fraction of this platform's DOM features present, 0.0 to 1.0
    pub fn dom_feature_score(&self, page: &Page) -> f64 {
        if self.dom_features.is_empty() {
            return 0.0;
        }
        let present = self
            .dom_features
            .iter()
            .filter(|f| page.query(page.root(), f).is_some())
            .count();
        present as f64 / self.dom_features.len() as f64
    }
}
