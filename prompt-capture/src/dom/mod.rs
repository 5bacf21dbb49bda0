//! In-process document model.
//!
//! A [`Document`] is a cheaply clonable handle to a parsed HTML page with a
//! URL and mutation observation. Reads go through [`Document::read`], which
//! hands out the [`Page`] behind a lock; writes go through
//! [`Document::mutate`], which batches the resulting [`MutationRecord`]s and
//! delivers them to matching observers once the batch completes.
//!
//! Parsing and selector matching are done by `scraper`; nodes live in its
//! `ego_tree` arena and are addressed by [`NodeId`]. New content is always
//! given as HTML markup.

mod observer;

pub use ego_tree::NodeId;
pub use observer::{MutationKind, MutationObserver, MutationRecord, ObserveInit};
pub use scraper::Selector;

use ego_tree::{NodeRef, Tree};
use observer::ObserverRegistry;
use scraper::node::Element;
use scraper::{ElementRef, Html, Node};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// A CSS selector that failed to compile
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid selector `{selector}`: {reason}")]
pub struct SelectorError {
    pub selector: String,
    pub reason: String,
}

/// Compile `selector`, keeping its source text in the error
pub fn parse_selector(selector: &str) -> Result<Selector, SelectorError> {
    Selector::parse(selector).map_err(|e| SelectorError {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

/// Copy `source` and its subtree under `parent`, recording old to new ids
fn graft(
    tree: &mut Tree<Node>,
    parent: NodeId,
    source: NodeRef<'_, Node>,
    ids: &mut HashMap<NodeId, NodeId>,
) -> Option<NodeId> {
    let id = tree.get_mut(parent)?.append(source.value().clone()).id();
    ids.insert(source.id(), id);
    for child in source.children() {
        graft(tree, id, child, ids);
    }
    Some(id)
}

fn find_body(html: &Html) -> NodeId {
    let root = html.root_element();
    root.children()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().name() == "body")
        .map_or_else(|| root.id(), |e| e.id())
}

fn escape_attribute(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

/// `element` with `name` set to `value`, re-parsed from a start tag
fn rebuild_element(element: &Element, name: &str, value: &str) -> Option<Node> {
    let mut markup = format!("<{}", element.name());
    let mut replaced = false;
    for (key, current) in element.attrs() {
        let current = if key == name {
            replaced = true;
            value
        } else {
            current
        };
        let _ = write!(markup, " {}=\"{}\"", key, escape_attribute(current));
    }
    if !replaced {
        let _ = write!(markup, " {}=\"{}\"", name, escape_attribute(value));
    }
    markup.push('>');

    let fragment = Html::parse_fragment(&markup);
    let rebuilt = fragment.root_element().first_child()?;
    match rebuilt.value() {
        Node::Element(e) if e.name() == element.name() => Some(rebuilt.value().clone()),
        _ => None,
    }
}

/// The parsed page. Obtained through [`Document::read`].
pub struct Page {
    html: Html,
    body: NodeId,
    /// Nodes ever added to the arena, attached or not
    allocated: usize,
}

impl Page {
    fn parse(markup: &str) -> Self {
        let html = Html::parse_document(markup);
        let body = find_body(&html);
        let allocated = html.tree.root().descendants().count();
        Self {
            html,
            body,
            allocated,
        }
    }

    /// Rebuild the arena from the attached nodes only
    fn compact(&mut self) -> HashMap<NodeId, NodeId> {
        let mut fresh = Html::new_document();
        fresh.quirks_mode = self.html.quirks_mode;
        let mut ids = HashMap::new();
        let old_root = self.html.tree.root();
        let new_root = fresh.tree.root().id();
        ids.insert(old_root.id(), new_root);
        for child in old_root.children() {
            graft(&mut fresh.tree, new_root, child, &mut ids);
        }
        self.html = fresh;
        self.body = find_body(&self.html);
        self.allocated = ids.len();
        ids
    }

    pub fn html(&self) -> &Html {
        &self.html
    }

    /// The `<html>` element
    pub fn root(&self) -> NodeId {
        self.html.root_element().id()
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    fn node(&self, id: NodeId) -> Option<NodeRef<'_, Node>> {
        self.html.tree.get(id)
    }

    pub fn element(&self, id: NodeId) -> Option<ElementRef<'_>> {
        self.node(id).and_then(ElementRef::wrap)
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        self.element(id).is_some()
    }

    /// Lowercase tag name, `None` for text nodes
    pub fn tag(&self, id: NodeId) -> Option<&str> {
        self.element(id).map(|e| e.value().name())
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.element(id)?.value().attr(name)
    }

    pub fn has_class(&self, id: NodeId, class: &str) -> bool {
        self.element(id)
            .map_or(false, |e| e.value().classes().any(|c| c == class))
    }

    /// Character data of a text node
    pub fn text(&self, id: NodeId) -> Option<&str> {
        match self.node(id)?.value() {
            Node::Text(text) => Some(&**text),
            _ => None,
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id)?.parent().map(|p| p.id())
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.node(id)
            .map(|n| n.children().map(|c| c.id()).collect())
            .unwrap_or_default()
    }

    /// Child elements only, skipping text and comments
    pub fn child_elements(&self, id: NodeId) -> Vec<NodeId> {
        self.node(id)
            .map(|n| n.children().filter(|c| c.value().is_element()).map(|c| c.id()).collect())
            .unwrap_or_default()
    }

    /// Inclusive: a node contains itself
    pub fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.parent(id);
        }
        false
    }

    /// Whether the node is attached to the document
    pub fn is_connected(&self, id: NodeId) -> bool {
        self.contains(self.html.tree.root().id(), id)
    }

    /// Descendants in document order, excluding `id` itself
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        self.node(id)
            .map(|n| n.descendants().skip(1).map(|d| d.id()).collect())
            .unwrap_or_default()
    }

    pub fn matches(&self, id: NodeId, selector: &Selector) -> bool {
        self.element(id).map_or(false, |e| selector.matches(&e))
    }

    /// Matching descendants of `scope` in document order
    pub fn query_all(&self, scope: NodeId, selector: &Selector) -> Vec<NodeId> {
        self.element(scope)
            .map(|e| e.select(selector).map(|m| m.id()).collect())
            .unwrap_or_default()
    }

    pub fn query(&self, scope: NodeId, selector: &Selector) -> Option<NodeId> {
        self.element(scope)?.select(selector).next().map(|m| m.id())
    }

    /// Nearest inclusive ancestor matching `selector`
    pub fn closest(&self, id: NodeId, selector: &Selector) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(node) = current {
            if self.matches(node, selector) {
                return Some(node);
            }
            current = self.parent(node);
        }
        None
    }

    /// Connected element with the given `id` attribute
    pub fn element_by_id(&self, value: &str) -> Option<NodeId> {
        self.find_id_within(self.html.tree.root().id(), value)
    }

    /// Inclusive search of a subtree (connected or not) for an `id` attribute
    pub fn find_id_within(&self, scope: NodeId, value: &str) -> Option<NodeId> {
        self.node(scope)?
            .descendants()
            .filter_map(ElementRef::wrap)
            .find(|e| e.value().id() == Some(value))
            .map(|e| e.id())
    }

    /// Nearest inclusive ancestor carrying the given `id` attribute
    pub fn ancestor_with_id(&self, id: NodeId, value: &str) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(node) = current {
            if self.attr(node, "id") == Some(value) {
                return Some(node);
            }
            current = self.parent(node);
        }
        None
    }

    /// Raw concatenation of descendant text, like `textContent`
    pub fn text_content(&self, id: NodeId) -> String {
        self.node(id)
            .map(|n| {
                n.descendants()
                    .filter_map(|d| d.value().as_text().map(|t| &**t))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Narrowest element containing every node in `nodes`.
    ///
    /// Walks up from the first node's parent. Returns `None` for an empty
    /// slice or when the nodes share no ancestor.
    pub fn common_ancestor(&self, nodes: &[NodeId]) -> Option<NodeId> {
        let first = *nodes.first()?;
        let mut candidate = self.parent(first);
        while let Some(container) = candidate {
            if nodes.iter().all(|n| self.contains(container, *n)) {
                return Some(container);
            }
            candidate = self.parent(container);
        }
        None
    }

    /// Short `tag#id.class` label for logs
    pub fn describe(&self, id: NodeId) -> String {
        let Some(element) = self.element(id) else {
            return "#text".to_string();
        };
        let element = element.value();
        let mut label = element.name().to_string();
        if let Some(element_id) = element.id() {
            label.push('#');
            label.push_str(element_id);
        }
        for class in element.classes() {
            label.push('.');
            label.push_str(class);
        }
        label
    }

    /// Arena size, including detached subtrees
    pub fn arena_len(&self) -> usize {
        self.allocated
    }

    /// Nodes reachable from the document root
    pub fn connected_len(&self) -> usize {
        self.html.tree.root().descendants().count()
    }

    /// Nodes still held by the arena after being removed
    pub fn detached_len(&self) -> usize {
        self.allocated.saturating_sub(self.connected_len())
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("body", &self.body)
            .field("arena", &self.allocated)
            .finish()
    }
}

/// Write access handed to [`Document::mutate`]. Every change is recorded.
pub struct Mutator<'a> {
    page: &'a mut Page,
    records: Vec<MutationRecord>,
}

impl Mutator<'_> {
    /// Read access to the page being mutated
    pub fn page(&self) -> &Page {
        &*self.page
    }

    /// Parse `markup` as a fragment and append its top-level nodes under
    /// `parent`
    pub fn append(&mut self, parent: NodeId, markup: &str) -> Vec<NodeId> {
        let fragment = Html::parse_fragment(markup);
        let mut ids = HashMap::new();
        let added: Vec<NodeId> = fragment
            .root_element()
            .children()
            .filter_map(|child| graft(&mut self.page.html.tree, parent, child, &mut ids))
            .collect();
        self.page.allocated += ids.len();
        if !added.is_empty() {
            self.records
                .push(MutationRecord::child_list(parent, added.clone(), Vec::new()));
        }
        added
    }

    /// Detach a node (and its subtree) from its parent
    pub fn remove(&mut self, node: NodeId) -> bool {
        let Some(parent) = self.page.parent(node) else {
            return false;
        };
        if let Some(mut target) = self.page.html.tree.get_mut(node) {
            target.detach();
        }
        self.records
            .push(MutationRecord::child_list(parent, Vec::new(), vec![node]));
        true
    }

    /// Remove every child of `parent`
    pub fn clear_children(&mut self, parent: NodeId) {
        let removed = self.page.children(parent);
        if removed.is_empty() {
            return;
        }
        for child in &removed {
            if let Some(mut target) = self.page.html.tree.get_mut(*child) {
                target.detach();
            }
        }
        self.records
            .push(MutationRecord::child_list(parent, Vec::new(), removed));
    }

    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        let Some(replacement) = self
            .page
            .element(node)
            .and_then(|e| rebuild_element(e.value(), &name, value))
        else {
            warn!(attribute = %name, "attribute not applied");
            return;
        };
        if let Some(mut target) = self.page.html.tree.get_mut(node) {
            *target.value() = replacement;
            self.records.push(MutationRecord::attribute(node, name));
        }
    }
}

struct Inner {
    page: Mutex<Page>,
    url: RwLock<String>,
    observers: ObserverRegistry,
}

/// Shared handle to a live document
#[derive(Clone)]
pub struct Document {
    inner: Arc<Inner>,
}

impl Document {
    /// Empty `<html><body></body></html>` document at `url`
    pub fn new(url: &str) -> Self {
        Self::parse(url, "")
    }

    /// Document parsed from `markup` (no mutation records are produced)
    pub fn parse(url: &str, markup: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                page: Mutex::new(Page::parse(markup)),
                url: RwLock::new(url.to_string()),
                observers: ObserverRegistry::default(),
            }),
        }
    }

    pub fn url(&self) -> String {
        self.inner
            .url
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Simulates history navigation; no mutation records
    pub fn set_url(&self, url: &str) {
        let mut current = self
            .inner
            .url
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        trace!(from = %current, to = url, "document url changed");
        *current = url.to_string();
    }

    /// Access to the page. Do not hold across an await point, and do not
    /// call back into the document while holding it.
    pub fn read(&self) -> MutexGuard<'_, Page> {
        self.inner
            .page
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a batch of changes and notify observers once it completes
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Mutator<'_>) -> R) -> R {
        let mut page = self.read();
        let mut mutator = Mutator {
            page: &mut page,
            records: Vec::new(),
        };
        let result = f(&mut mutator);
        let records = mutator.records;
        if !records.is_empty() {
            self.inner.observers.dispatch(&page, records);
        }
        result
    }

    /// Parse `markup` and append it under `parent`
    pub fn append(&self, parent: NodeId, markup: &str) -> Vec<NodeId> {
        self.mutate(|m| m.append(parent, markup))
    }

    pub fn remove(&self, node: NodeId) -> bool {
        self.mutate(|m| m.remove(node))
    }

    pub fn set_attribute(&self, node: NodeId, name: &str, value: &str) {
        self.mutate(|m| m.set_attribute(node, name, value))
    }

    /// Swap the children of `parent` for freshly parsed `markup`
    pub fn replace_children(&self, parent: NodeId, markup: &str) {
        self.mutate(|m| {
            m.clear_children(parent);
            m.append(parent, markup);
        })
    }

    /// Start observing `target`. Dropping the returned handle disconnects.
    pub fn observe(
        &self,
        target: NodeId,
        init: ObserveInit,
    ) -> (MutationObserver, mpsc::UnboundedReceiver<Vec<MutationRecord>>) {
        self.inner.observers.register(target, init)
    }

    /// Number of live observers
    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }

    /// Nodes kept alive by the arena after removal
    pub fn detached_len(&self) -> usize {
        self.read().detached_len()
    }

    /// Drop detached subtrees from the arena.
    ///
    /// Every [`NodeId`] handed out before the call is invalid afterwards.
    /// Observers are moved to their target's new id, or dropped when the
    /// target was detached. Returns the number of nodes reclaimed.
    pub fn compact(&self) -> usize {
        let mut page = self.read();
        let reclaimed = page.detached_len();
        if reclaimed == 0 {
            return 0;
        }
        let ids = page.compact();
        self.inner.observers.remap(&ids);
        debug!(reclaimed, nodes = page.arena_len(), "document compacted");
        reclaimed
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("url", &self.url())
            .field("observers", &self.observer_count())
            .finish()
    }
}
