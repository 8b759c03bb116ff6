//! Evidence Store
//!
//! Cumulative, deduplicated collection of sources and the evidence items
//! extracted from them for one research session.
//!
//! Sources live in a growable table and are keyed by a normalized canonical
//! id, so a second sighting of the same page (different scheme, `www.`,
//! fragment, tracking parameters, trailing slash) resolves to the existing
//! entry. Evidence items point at their source by index and never own it.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Query parameters that never change page identity.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_cid", "mc_eid", "ref", "ref_src"];

/// Citation id of a source (`src-1`, `src-2`, ...), assigned in discovery order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    fn for_index(index: usize) -> Self {
        SourceId(format!("src-{}", index + 1))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Table index encoded in the id, if it is well formed.
    fn index(&self) -> Option<usize> {
        parse_source_index(&self.0)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of a source in the store's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceIndex(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchStatus {
    /// Known from search results, page not fetched yet.
    Pending,
    Fetched,
    Failed,
    /// Not fetched: the round's fetch budget or deadline ran out first.
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub canonical_id: String,
    pub url: String,
    pub title: String,
    pub domain: String,
    pub fetch_status: FetchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_error: Option<String>,
    pub discovered_round: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvidenceItem {
    #[serde(skip)]
    source: SourceIndex,
    pub source_id: SourceId,
    /// Query that surfaced this evidence.
    pub query: String,
    pub round: u32,
    pub text: String,
    /// Query-term overlap in `[0, 1]`; snippets start at a fixed baseline.
    pub relevance: f32,
}

impl EvidenceItem {
    pub fn source_index(&self) -> SourceIndex {
        self.source
    }
}

/// Counts reported in session snapshots.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EvidenceSummary {
    pub sources: usize,
    pub evidence_items: usize,
}

#[derive(Debug, Clone, Default)]
pub struct EvidenceStore {
    sources: Vec<Source>,
    by_canonical: HashMap<String, SourceIndex>,
    items: Vec<EvidenceItem>,
    seen_items: HashSet<(usize, String)>,
}

impl EvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source, returning its index and whether it was new.
    /// Returns `None` when the identifier is empty.
    pub fn register_source(&mut self, url: &str, title: &str, round: u32) -> Option<(SourceIndex, bool)> {
        let canonical = canonical_id(url)?;
        if let Some(&index) = self.by_canonical.get(&canonical) {
            return Some((index, false));
        }

        let index = SourceIndex(self.sources.len());
        let domain = domain_of(url);
        let title = title.trim();
        let title = if title.is_empty() || title.eq_ignore_ascii_case(&domain) {
            if domain.is_empty() { url.trim().to_string() } else { domain.clone() }
        } else {
            title.to_string()
        };

        self.sources.push(Source {
            id: SourceId::for_index(index.0),
            canonical_id: canonical.clone(),
            url: url.trim().to_string(),
            title,
            domain,
            fetch_status: FetchStatus::Pending,
            fetch_error: None,
            discovered_round: round,
        });
        self.by_canonical.insert(canonical, index);
        Some((index, true))
    }

    pub fn source(&self, index: SourceIndex) -> &Source {
        &self.sources[index.0]
    }

    pub fn set_fetch_status(&mut self, index: SourceIndex, status: FetchStatus, error: Option<String>) {
        let source = &mut self.sources[index.0];
        source.fetch_status = status;
        source.fetch_error = error;
    }

    /// Add an evidence item. Identical text (ignoring case and spacing) for
    /// the same source is stored once; returns whether the item was added.
    pub fn add_evidence(&mut self, source: SourceIndex, query: &str, round: u32, text: &str, relevance: f32) -> bool {
        let text = collapse_whitespace(text);
        if text.is_empty() {
            return false;
        }
        if !self.seen_items.insert((source.0, text.to_lowercase())) {
            return false;
        }

        self.items.push(EvidenceItem {
            source,
            source_id: self.sources[source.0].id.clone(),
            query: query.to_string(),
            round,
            text,
            relevance: relevance.clamp(0.0, 1.0),
        });
        true
    }

    /// Look up a source by citation id (`src-N`).
    pub fn resolve(&self, id: &str) -> Option<&Source> {
        parse_source_index(id).and_then(|i| self.sources.get(i))
    }

    pub fn resolve_id(&self, id: &SourceId) -> Option<&Source> {
        id.index().and_then(|i| self.sources.get(i))
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn items(&self) -> &[EvidenceItem] {
        &self.items
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn evidence_count(&self) -> usize {
        self.items.len()
    }

    /// No evidence has been gathered (sources without items do not count).
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn summary(&self) -> EvidenceSummary {
        EvidenceSummary {
            sources: self.sources.len(),
            evidence_items: self.items.len(),
        }
    }

    /// Render evidence grouped by source for a model prompt. At most
    /// `max_items` items are included, most relevant first within each source.
    pub fn format_for_prompt(&self, max_items: usize) -> String {
        if self.items.is_empty() {
            return "No evidence gathered yet.".to_string();
        }

        let mut ranked: Vec<&EvidenceItem> = self.items.iter().collect();
        ranked.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        ranked.truncate(max_items);

        let mut grouped: Vec<(SourceIndex, Vec<&EvidenceItem>)> = Vec::new();
        for item in ranked {
            match grouped.iter_mut().find(|(idx, _)| *idx == item.source) {
                Some((_, items)) => items.push(item),
                None => grouped.push((item.source, vec![item])),
            }
        }
        grouped.sort_by_key(|(idx, _)| idx.0);

        let mut output = String::new();
        for (idx, items) in grouped {
            let source = self.source(idx);
            output.push_str(&format!("[{}] {} ({})\n", source.id, source.title, source.url));
            for item in items {
                output.push_str(&format!("  - {}\n", item.text));
            }
        }
        output
    }
}

/// Normalize a URL (or opaque document id) into the dedup key.
///
/// For http(s) URLs the scheme, a leading `www.`, the fragment, a trailing
/// slash and tracking parameters are ignored and the remaining query
/// parameters are sorted.
pub fn canonical_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let url = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(_) => return Some(trimmed.to_lowercase()),
    };
    if !matches!(url.scheme(), "http" | "https") {
        return Some(url.as_str().to_string());
    }

    let host = url.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    let mut canonical = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    canonical.push_str(url.path().trim_end_matches('/'));

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !pairs.is_empty() {
        pairs.sort();
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        canonical.push('?');
        canonical.push_str(&query);
    }

    Some(canonical)
}

fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key)
}

fn domain_of(raw: &str) -> String {
    Url::parse(raw.trim())
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_lowercase()))
        .unwrap_or_default()
}

fn parse_source_index(id: &str) -> Option<usize> {
    id.trim()
        .strip_prefix("src-")
        .and_then(|n| n.parse::<usize>().ok())
        .and_then(|n| n.checked_sub(1))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
