//! Fleet search: in-RAM fielded index over agents and configurations.
//! Single flat document map with facet counts; queries evaluate under a read lock.

#![forbid(unsafe_code)]

pub mod query;

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use fleet_core::{Indexed, Labels};
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::trace;

pub use query::{Operator, Query, Token};

pub const SCORE_EXACT: u32 = 100;
pub const SCORE_PREFIX: u32 = 50;

const VALUE_SEP: char = '\u{1f}';
const LATEST: &str = "latest";

/// Supplies the value substituted for `version:latest`.
pub trait VersionProvider: Send + Sync {
    fn latest_version(&self) -> Option<String>;
}

/// Swappable latest-version holder.
#[derive(Default)]
pub struct LatestVersion(ArcSwapOption<String>);

impl LatestVersion {
    pub fn new(v: impl Into<String>) -> Self { Self(ArcSwapOption::from_pointee(v.into())) }
    pub fn set(&self, v: impl Into<String>) { self.0.store(Some(Arc::new(v.into()))); }
}

impl VersionProvider for LatestVersion {
    fn latest_version(&self) -> Option<String> { self.0.load_full().map(|v| v.as_ref().clone()) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
    pub label: String,
    /// Full query with the last token completed.
    pub query: String,
    pub score: u32,
}

/// One indexed entity. Names and values are lowercase; `raw` keeps the labels as given
/// for selector matching.
#[derive(Debug, Clone, Default)]
struct Document {
    fields: FxHashMap<String, SmallVec<[String; 2]>>,
    labels: FxHashMap<String, String>,
    raw: Labels,
    values: String,
}

impl Document {
    fn from_indexed<I: Indexed + ?Sized>(item: &I) -> Self {
        let mut doc = Document::default();
        let mut values: Vec<String> = Vec::new();
        for (name, value) in item.index_fields() {
            if value.is_empty() {
                continue;
            }
            let v = value.to_lowercase();
            values.push(v.clone());
            let slot = doc.fields.entry(name.to_lowercase()).or_default();
            if !slot.contains(&v) {
                slot.push(v);
            }
        }
        for (k, v) in item.index_labels().iter() {
            let v = v.to_lowercase();
            values.push(v.clone());
            doc.labels.insert(k.to_lowercase(), v);
        }
        doc.raw = item.index_labels().clone();
        doc.values = values.join(&VALUE_SEP.to_string());
        doc
    }

    /// Every `(name, value)` pair, fields first.
    fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .flat_map(|(n, vs)| vs.iter().map(move |v| (n.as_str(), v.as_str())))
            .chain(self.labels.iter().map(|(n, v)| (n.as_str(), v.as_str())))
    }

    fn has_name(&self, name: &str) -> bool { self.fields.contains_key(name) || self.labels.contains_key(name) }

    fn has_value(&self, name: &str, value: &str) -> bool {
        self.fields.get(name).map(|vs| vs.iter().any(|v| v == value)).unwrap_or(false)
            || self.labels.get(name).map(|v| v == value).unwrap_or(false)
    }

    fn matches(&self, token: &Token) -> bool {
        let hit = match (&token.name, token.value.is_empty()) {
            (Some(name), true) => self.has_name(name),
            (Some(name), false) => self.has_value(name, &token.value),
            (None, true) => true,
            (None, false) => self.values.contains(token.value.as_str()),
        };
        hit != token.is_negated()
    }
}

#[derive(Default)]
struct Facets {
    names: FxHashMap<String, usize>,
    values: FxHashMap<String, FxHashMap<String, usize>>,
}

impl Facets {
    fn add(&mut self, doc: &Document) {
        for (n, v) in doc.pairs() {
            *self.names.entry(n.to_string()).or_default() += 1;
            *self.values.entry(n.to_string()).or_default().entry(v.to_string()).or_default() += 1;
        }
    }

    fn remove(&mut self, doc: &Document) {
        for (n, v) in doc.pairs() {
            if let Some(c) = self.names.get_mut(n) {
                *c = c.saturating_sub(1);
                if *c == 0 { self.names.remove(n); }
            }
            if let Some(vals) = self.values.get_mut(n) {
                if let Some(c) = vals.get_mut(v) {
                    *c = c.saturating_sub(1);
                    if *c == 0 { vals.remove(v); }
                }
                if vals.is_empty() { self.values.remove(n); }
            }
        }
    }
}

#[derive(Default)]
struct State {
    docs: FxHashMap<String, Document>,
    facets: Facets,
}

/// Fielded search index with facet-based suggestions.
pub struct SearchIndex {
    name: &'static str,
    state: RwLock<State>,
    versions: Option<Arc<dyn VersionProvider>>,
}

impl SearchIndex {
    pub fn new(name: &'static str) -> Self { Self { name, state: RwLock::new(State::default()), versions: None } }

    pub fn with_version_provider(mut self, provider: Arc<dyn VersionProvider>) -> Self {
        self.versions = Some(provider);
        self
    }

    pub fn name(&self) -> &'static str { self.name }

    /// Insert or replace the document for `item.index_id()`.
    pub fn upsert<I: Indexed + ?Sized>(&self, item: &I) {
        let doc = Document::from_indexed(item);
        let mut st = self.state.write();
        if let Some(old) = st.docs.remove(item.index_id()) {
            st.facets.remove(&old);
        }
        st.facets.add(&doc);
        st.docs.insert(item.index_id().to_string(), doc);
        metrics::gauge!("index_docs", st.docs.len() as f64, "index" => self.name);
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut st = self.state.write();
        let Some(old) = st.docs.remove(id) else { return false };
        st.facets.remove(&old);
        metrics::gauge!("index_docs", st.docs.len() as f64, "index" => self.name);
        true
    }

    pub fn len(&self) -> usize { self.state.read().docs.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn contains(&self, id: &str) -> bool { self.state.read().docs.contains_key(id) }

    /// Ids of documents whose labels include every pair of `labels`. Case-sensitive, the
    /// same comparison as `Selector::matches`.
    pub fn select(&self, labels: &Labels) -> Vec<String> {
        let st = self.state.read();
        let mut ids: Vec<String> =
            st.docs.iter().filter(|(_, d)| d.raw.is_superset_of(labels)).map(|(id, _)| id.clone()).collect();
        ids.sort();
        ids
    }

    /// Ids of documents carrying the label `key`, exact case.
    pub fn labeled(&self, key: &str) -> Vec<String> {
        let st = self.state.read();
        let mut ids: Vec<String> =
            st.docs.iter().filter(|(_, d)| d.raw.get(key).is_some()).map(|(id, _)| id.clone()).collect();
        ids.sort();
        ids
    }

    /// Ids whose field or label `name` equals `value` exactly.
    pub fn field(&self, name: &str, value: &str) -> Vec<String> {
        let (name, value) = (name.to_lowercase(), value.to_lowercase());
        let st = self.state.read();
        let mut ids: Vec<String> =
            st.docs.iter().filter(|(_, d)| d.has_value(&name, &value)).map(|(id, _)| id.clone()).collect();
        ids.sort();
        ids
    }

    /// Matching ids, ascending. An empty query matches everything.
    pub fn search(&self, query: &str) -> Vec<String> { self.search_query(&Query::parse(query)) }

    pub fn search_query(&self, query: &Query) -> Vec<String> {
        let started = Instant::now();
        let tokens: Vec<Token> = query.tokens.iter().map(|t| self.normalize(t)).collect();
        let st = self.state.read();
        let mut ids: Vec<String> = st
            .docs
            .iter()
            .filter(|(_, d)| tokens.iter().all(|t| d.matches(t)))
            .map(|(id, _)| id.clone())
            .collect();
        drop(st);
        ids.sort();
        metrics::histogram!("search_eval_ms", started.elapsed().as_secs_f64() * 1_000.0);
        trace!(index = self.name, query = %query, hits = ids.len(), "search");
        ids
    }

    /// True if the document `id` satisfies `query`.
    pub fn matches(&self, id: &str, query: &str) -> bool {
        let q = Query::parse(query);
        let tokens: Vec<Token> = q.tokens.iter().map(|t| self.normalize(t)).collect();
        let st = self.state.read();
        st.docs.get(id).map(|d| tokens.iter().all(|t| d.matches(t))).unwrap_or(false)
    }

    /// Every field and label name present, sorted.
    pub fn names(&self) -> Vec<String> {
        let st = self.state.read();
        let mut out: Vec<String> = st.facets.names.keys().cloned().collect();
        out.sort();
        out
    }

    /// Every value recorded for `name`, sorted.
    pub fn values(&self, name: &str) -> Vec<String> {
        let st = self.state.read();
        let mut out: Vec<String> =
            st.facets.values.get(&name.to_lowercase()).map(|m| m.keys().cloned().collect()).unwrap_or_default();
        out.sort();
        out
    }

    /// Completions for the last token of `query`: names when no `name:` was typed yet,
    /// otherwise values for that name. Falls back to fuzzy matching below prefix score.
    pub fn suggestions(&self, query: &str) -> Vec<Suggestion> {
        let q = Query::parse(query);
        let last = q.last_token().cloned().unwrap_or_default();
        let mut out = match &last.name {
            None => self.name_suggestions(&q, &last),
            Some(name) => self.value_suggestions(&q, &last, name),
        };
        out.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.label.cmp(&b.label)));
        out
    }

    fn name_suggestions(&self, q: &Query, last: &Token) -> Vec<Suggestion> {
        let typed = last.value.to_lowercase();
        let candidates = self.names();
        let make = |name: &str, score: u32| {
            let token = Token { operator: last.operator, name: Some(name.to_string()), value: String::new() };
            Suggestion { label: format!("{}:", name), query: q.replace_last(&token), score }
        };
        rank(&candidates, &typed, make)
    }

    fn value_suggestions(&self, q: &Query, last: &Token, name: &str) -> Vec<Suggestion> {
        let typed = last.value.to_lowercase();
        let candidates = self.values(name);
        let make = |value: &str, score: u32| {
            let bare = Token { operator: Operator::None, name: Some(name.to_string()), value: value.to_string() };
            let token = Token { operator: last.operator, ..bare.clone() };
            Suggestion { label: bare.to_string(), query: q.replace_last(&token), score }
        };
        rank(&candidates, &typed, make)
    }

    fn normalize(&self, token: &Token) -> Token {
        let mut t = Token {
            operator: token.operator,
            name: token.name.as_ref().map(|n| n.to_lowercase()),
            value: token.value.to_lowercase(),
        };
        if t.name.as_deref() == Some("version") && t.value == LATEST {
            if let Some(v) = self.versions.as_ref().and_then(|p| p.latest_version()) {
                t.value = v.to_lowercase();
            }
        }
        t
    }
}

/// Exact and prefix matches; fuzzy matches scored below prefix when none hit.
fn rank<F>(candidates: &[String], typed: &str, make: F) -> Vec<Suggestion>
where
    F: Fn(&str, u32) -> Suggestion,
{
    let mut out: Vec<Suggestion> = candidates
        .iter()
        .filter_map(|c| {
            if c == typed {
                Some(make(c, SCORE_EXACT))
            } else if c.starts_with(typed) {
                Some(make(c, SCORE_PREFIX))
            } else {
                None
            }
        })
        .collect();
    if out.is_empty() && !typed.is_empty() {
        let matcher = SkimMatcherV2::default();
        out = candidates
            .iter()
            .filter_map(|c| matcher.fuzzy_match(c, typed).map(|s| make(c, s.clamp(1, SCORE_PREFIX as i64 - 1) as u32)))
            .collect();
    }
    out
}
