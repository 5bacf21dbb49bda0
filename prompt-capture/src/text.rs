//! Plain-text extraction from DOM subtrees.
//!
//! Decorative subtrees (buttons, icons, scripts) are skipped entirely, `<br>`
//! becomes a newline and block elements are separated by newlines.

use crate::dom::{NodeId, Page, Selector};
use std::collections::HashSet;

/// Maximum recursion depth to prevent stack overflow
const MAX_RECURSION_DEPTH: usize = 100;

/// Element kinds that never carry message text
pub const DEFAULT_IGNORED_TAGS: &[&str] = &["button", "svg", "script", "style"];

/// Elements whose text starts on a new line
const BLOCK_TAGS: &[&str] = &[
    "address", "article", "blockquote", "dd", "div", "dl", "dt", "figcaption", "figure",
    "footer", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "main", "ol", "p",
    "pre", "section", "table", "tr", "ul",
];

#[derive(Debug, Clone)]
pub struct TextExtractor {
    ignored_tags: HashSet<String>,
    ignored_selectors: Vec<Selector>,
}

impl Default for TextExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl TextExtractor {
    /// Extractor with [`DEFAULT_IGNORED_TAGS`]
    pub fn new() -> Self {
        Self {
            ignored_tags: DEFAULT_IGNORED_TAGS.iter().map(|t| t.to_string()).collect(),
            ignored_selectors: Vec::new(),
        }
    }

    /// Case-insensitive
    pub fn ignore_tag(mut self, tag: &str) -> Self {
        self.ignored_tags.insert(tag.trim().to_ascii_lowercase());
        self
    }

    pub fn ignore_tags<'a>(self, tags: impl IntoIterator<Item = &'a str>) -> Self {
        tags.into_iter().fold(self, |extractor, tag| extractor.ignore_tag(tag))
    }

    pub fn ignore_selector(mut self, selector: Selector) -> Self {
        self.ignored_selectors.push(selector);
        self
    }

    pub fn is_ignored(&self, page: &Page, node: NodeId) -> bool {
        match page.tag(node) {
            Some(tag) => {
                self.ignored_tags.contains(tag)
                    || self.ignored_selectors.iter().any(|s| page.matches(node, s))
            }
            None => false,
        }
    }

    /// Trimmed text of `node`, empty if nothing survives filtering
    pub fn extract(&self, page: &Page, node: NodeId) -> String {
        if self.is_ignored(page, node) {
            return String::new();
        }
        let mut out = String::new();
        self.collect(page, node, 0, &mut out);
        out.trim().to_string()
    }

    fn collect(&self, page: &Page, node: NodeId, depth: usize, out: &mut String) {
        if depth > MAX_RECURSION_DEPTH {
            return;
        }

        if let Some(text) = page.text(node) {
            // Layout whitespace between blocks
            if text.trim().is_empty() && (out.is_empty() || out.ends_with('\n')) {
                return;
            }
            out.push_str(text);
            return;
        }

        for child in page.children(node) {
            let Some(tag) = page.tag(child) else {
                self.collect(page, child, depth + 1, out);
                continue;
            };
            if self.is_ignored(page, child) {
                continue;
            }
            if tag == "br" {
                out.push('\n');
                continue;
            }

            let block = BLOCK_TAGS.contains(&tag);
            if block {
                break_line(out);
            }
            self.collect(page, child, depth + 1, out);
            if block {
                break_line(out);
            }
        }
    }
}

fn break_line(out: &mut String) {
    let kept = out.trim_end_matches([' ', '\t']).len();
    out.truncate(kept);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{parse_selector, Document};
    use pretty_assertions::assert_eq;

    fn extract_with(extractor: &TextExtractor, markup: &str) -> String {
        let doc = Document::parse("https://x/", markup);
        let page = doc.read();
        let node = page.child_elements(page.body())[0];
        extractor.extract(&page, node)
    }

    #[test]
    fn test_skips_default_ignored_tags() {
        let markup = "<div><button>Copy</button>What is Rust?\
            <svg><path></path></svg><SCRIPT>var x = 1;</SCRIPT></div>";
        assert_eq!(extract_with(&TextExtractor::new(), markup), "What is Rust?");
    }

    #[test]
    fn test_br_and_blocks_become_newlines() {
        let markup = "<div><p>line one</p><p>line two<br>line three</p></div>";
        assert_eq!(
            extract_with(&TextExtractor::new(), markup),
            "line one\nline two\nline three"
        );
    }

    #[test]
    fn test_layout_whitespace_between_blocks() {
        let markup = "<div>
            <p>first</p>
            <p>second </p>
        </div>";
        assert_eq!(extract_with(&TextExtractor::new(), markup), "first\nsecond");
    }

    #[test]
    fn test_inline_elements_concatenate() {
        let markup = "<p>use <code>cargo</code> here</p>";
        assert_eq!(extract_with(&TextExtractor::new(), markup), "use cargo here");
    }

    #[test]
    fn test_extra_tags_and_selectors() {
        let extractor = TextExtractor::new()
            .ignore_tags(["MAT-ICON", "tts-control"])
            .ignore_selector(parse_selector(r#"[class*="icon"], ._11d6b3a"#).unwrap());
        let markup = r#"<div><mat-icon>edit</mat-icon><tts-control>listen</tts-control><span class="ds-icon-wrapper">x</span><span class="_11d6b3a">retry</span>kept</div>"#;
        assert_eq!(extract_with(&extractor, markup), "kept");
    }

    #[test]
    fn test_ignored_root_yields_empty() {
        assert_eq!(extract_with(&TextExtractor::new(), "<button>Send</button>"), "");
    }

    #[test]
    fn test_depth_limit() {
        let nested = format!("{}deep{}", "<span>".repeat(150), "</span>".repeat(150));
        let markup = format!("<div>top{nested}</div>");
        assert_eq!(extract_with(&TextExtractor::new(), &markup), "top");
    }
}
