//! Authoritative prompt collection.
//!
//! The store is the single owner of deduplication. It keeps the reconciled
//! prompts, a derived filtered view, and publishes
//! [`AppEvent::PromptsUpdated`] with that view after every change.

use crate::events::{AppEvent, EventBus};
use crate::types::{FilterOptions, MergeOptions, Prompt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Content fingerprints seen so far, with the timestamps they were seen at
#[derive(Debug, Default)]
struct FingerprintIndex {
    seen: HashMap<String, Vec<i64>>,
}

impl FingerprintIndex {
    fn from_prompts(prompts: &[Prompt]) -> Self {
        let mut index = Self::default();
        for prompt in prompts {
            index.insert(prompt);
        }
        index
    }

    /// A seen fingerprint blocks the prompt unless every earlier sighting is
    /// at least `window` ms away. A zero window compares content only.
    fn accepts(&self, prompt: &Prompt, window: i64) -> bool {
        match self.seen.get(prompt.content.trim()) {
            None => true,
            Some(_) if window <= 0 => false,
            Some(times) => times
                .iter()
                .all(|t| (prompt.timestamp - t).abs() >= window),
        }
    }

    fn insert(&mut self, prompt: &Prompt) {
        self.seen
            .entry(prompt.content.trim().to_string())
            .or_default()
            .push(prompt.timestamp);
    }
}

/// Keep the first occurrence of each trimmed content
fn dedupe_by_content(prompts: Vec<Prompt>) -> Vec<Prompt> {
    let mut seen = HashSet::new();
    prompts
        .into_iter()
        .filter(|p| seen.insert(p.content.trim().to_string()))
        .collect()
}

/// Filter bounds with malformed parts dropped
fn sanitize(mut filter: FilterOptions) -> FilterOptions {
    if filter
        .search_query
        .as_deref()
        .map_or(false, |q| q.trim().is_empty())
    {
        filter.search_query = None;
    }
    if let (Some(start), Some(end)) = (filter.start_time, filter.end_time) {
        if start > end {
            debug!(start, end, "ignoring inverted time range");
            filter.start_time = None;
            filter.end_time = None;
        }
    }
    if let (Some(min), Some(max)) = (filter.min_length, filter.max_length) {
        if min > max {
            debug!(min, max, "ignoring inverted length range");
            filter.min_length = None;
            filter.max_length = None;
        }
    }
    filter
}

fn apply_filter(prompts: &[Prompt], filter: &FilterOptions) -> Vec<Prompt> {
    if filter.is_empty() {
        return prompts.to_vec();
    }
    let query = filter
        .search_query
        .as_deref()
        .map(|q| q.trim().to_lowercase());

    prompts
        .iter()
        .filter(|p| {
            query
                .as_deref()
                .map_or(true, |q| p.content.to_lowercase().contains(q))
        })
        .filter(|p| filter.start_time.map_or(true, |start| p.timestamp >= start))
        .filter(|p| filter.end_time.map_or(true, |end| p.timestamp <= end))
        .filter(|p| filter.min_length.map_or(true, |min| p.char_len() >= min))
        .filter(|p| filter.max_length.map_or(true, |max| p.char_len() <= max))
        .cloned()
        .collect()
}

/// Summary numbers for the current collection
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub filtered: usize,
    pub avg_length: f64,
    pub min_length: usize,
    pub max_length: usize,
}

struct StoreInner {
    prompts: Vec<Prompt>,
    filter: FilterOptions,
    filtered: Vec<Prompt>,
    auto_deduplicate: bool,
}

impl StoreInner {
    fn refilter(&mut self) {
        self.filtered = apply_filter(&self.prompts, &self.filter);
    }
}

pub struct PromptStore {
    inner: Mutex<StoreInner>,
    events: EventBus,
}

impl PromptStore {
    /// Empty store with auto-deduplication on
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                prompts: Vec::new(),
                filter: FilterOptions::default(),
                filtered: Vec::new(),
                auto_deduplicate: true,
            }),
            events,
        }
    }

    pub fn with_auto_deduplicate(self, enabled: bool) -> Self {
        self.set_auto_deduplicate(enabled);
        self
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a mutation, refresh the filtered view and publish it.
    /// The closure returns `false` to signal that nothing changed.
    fn update(&self, operation: &str, f: impl FnOnce(&mut StoreInner) -> bool) -> bool {
        let snapshot: Arc<[Prompt]> = {
            let mut inner = self.lock();
            if !f(&mut inner) {
                return false;
            }
            inner.refilter();
            debug!(
                operation,
                total = inner.prompts.len(),
                visible = inner.filtered.len(),
                "prompt store updated"
            );
            Arc::from(inner.filtered.as_slice())
        };
        self.events.emit(AppEvent::PromptsUpdated(snapshot));
        true
    }

    /// Replace the whole collection
    pub fn replace_all(&self, prompts: Vec<Prompt>) {
        self.update("replace_all", |inner| {
            inner.prompts = if inner.auto_deduplicate {
                dedupe_by_content(prompts)
            } else {
                prompts
            };
            true
        });
    }

    /// Raw append. With auto-deduplication on, content already present is
    /// dropped so the collection never holds two identical prompts.
    pub fn append(&self, prompts: Vec<Prompt>) -> usize {
        if prompts.is_empty() {
            return 0;
        }
        let mut added = 0;
        self.update("append", |inner| {
            if inner.auto_deduplicate {
                let mut index = FingerprintIndex::from_prompts(&inner.prompts);
                for prompt in prompts {
                    if index.accepts(&prompt, 0) {
                        index.insert(&prompt);
                        inner.prompts.push(prompt);
                        added += 1;
                    }
                }
            } else {
                added = prompts.len();
                inner.prompts.extend(prompts);
            }
            added > 0
        });
        added
    }

    /// Reconcile `prompts` against the collection. Returns how many were
    /// accepted. An empty input never changes anything.
    pub fn merge(&self, prompts: Vec<Prompt>, options: MergeOptions) -> usize {
        if prompts.is_empty() {
            debug!("merge with empty input ignored");
            return 0;
        }

        let mut accepted = 0;
        self.update("merge", |inner| {
            let incoming = if inner.prompts.is_empty() {
                let adopted = if options.dedupe {
                    dedupe_by_content(prompts)
                } else {
                    prompts
                };
                accepted = adopted.len();
                adopted
            } else if options.dedupe {
                let mut index = FingerprintIndex::from_prompts(&inner.prompts);
                let fresh: Vec<Prompt> = prompts
                    .into_iter()
                    .filter(|p| {
                        let keep = index.accepts(p, options.time_window);
                        if keep {
                            index.insert(p);
                        }
                        keep
                    })
                    .collect();
                accepted = fresh.len();
                fresh
            } else {
                accepted = prompts.len();
                prompts
            };

            if accepted == 0 {
                return false;
            }
            inner.prompts.extend(incoming);
            if !options.preserve_order {
                inner.prompts.sort_by(|a, b| {
                    b.timestamp
                        .cmp(&a.timestamp)
                        .then_with(|| b.dom_index.cmp(&a.dom_index))
                });
            }
            true
        });
        accepted
    }

    /// Drop every prompt and every filter
    pub fn clear(&self) {
        self.update("clear", |inner| {
            inner.prompts.clear();
            inner.filter = FilterOptions::default();
            true
        });
    }

    /// Replace the active filter. Malformed bounds are ignored.
    pub fn set_filter(&self, filter: FilterOptions) {
        let filter = sanitize(filter);
        self.update("set_filter", |inner| {
            inner.filter = filter;
            true
        });
    }

    pub fn clear_filter(&self) {
        self.set_filter(FilterOptions::default());
    }

    /// Set the search query, keeping the other filter fields
    pub fn search(&self, query: &str) -> Vec<Prompt> {
        let mut filter = self.filter();
        filter.search_query = Some(query.to_string());
        self.set_filter(filter);
        self.filtered()
    }

    pub fn filter(&self) -> FilterOptions {
        self.lock().filter.clone()
    }

    pub fn all(&self) -> Vec<Prompt> {
        self.lock().prompts.clone()
    }

    /// Current filtered view
    pub fn filtered(&self) -> Vec<Prompt> {
        self.lock().filtered.clone()
    }

    pub fn get(&self, id: &str) -> Option<Prompt> {
        self.lock().prompts.iter().find(|p| p.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn filtered_len(&self) -> usize {
        self.lock().filtered.len()
    }

    /// Affects later writes only
    pub fn set_auto_deduplicate(&self, enabled: bool) {
        self.lock().auto_deduplicate = enabled;
    }

    pub fn sort_by_time(&self, ascending: bool) {
        self.update("sort_by_time", |inner| {
            inner.prompts.sort_by(|a, b| {
                let order = a
                    .timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| a.dom_index.cmp(&b.dom_index));
                if ascending {
                    order
                } else {
                    order.reverse()
                }
            });
            true
        });
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.lock();
        let lengths: Vec<usize> = inner.prompts.iter().map(Prompt::char_len).collect();
        if lengths.is_empty() {
            return StoreStats {
                filtered: inner.filtered.len(),
                ..StoreStats::default()
            };
        }
        StoreStats {
            total: lengths.len(),
            filtered: inner.filtered.len(),
            avg_length: lengths.iter().sum::<usize>() as f64 / lengths.len() as f64,
            min_length: lengths.iter().copied().min().unwrap_or(0),
            max_length: lengths.iter().copied().max().unwrap_or(0),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

impl std::fmt::Debug for PromptStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("PromptStore")
            .field("prompts", &inner.prompts.len())
            .field("filtered", &inner.filtered.len())
            .field("auto_deduplicate", &inner.auto_deduplicate)
            .finish()
    }
}
