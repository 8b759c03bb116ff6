//! Search Executor
//!
//! Runs one round's queries through the gateway, bounded by the round
//! concurrency limit and an aggregate round deadline. Newly seen sources are
//! fetched (up to the per-round fetch budget) and reduced to evidence items.
//!
//! Tool calls run concurrently; the Evidence Store is only written between
//! them, on the calling task, so it has a single writer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::Query;
use crate::config::ResearchConfig;
use crate::evidence::{EvidenceStore, FetchStatus, SourceIndex};
use crate::gateway::{CallContext, ToolGateway};
use crate::search::SearchHit;

/// Relevance floor for search snippets.
const SNIPPET_RELEVANCE: f32 = 0.3;
const MIN_PASSAGE_CHARS: usize = 40;
const MAX_PASSAGE_CHARS: usize = 400;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "what", "which", "from", "that", "this", "are", "was", "were", "how", "why",
    "when", "who", "about", "into", "over", "latest", "report", "does", "did", "have", "has",
];

#[derive(Debug, Clone, Serialize)]
pub struct QueryFailure {
    pub query: String,
    pub reason: String,
}

/// Tolerated failures inside a round.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PartialRoundFailure {
    pub failed_queries: Vec<QueryFailure>,
    pub failed_fetches: usize,
    pub deadline_exceeded: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RoundOutcome {
    pub searches_attempted: usize,
    pub new_sources: usize,
    pub new_evidence: usize,
    pub failed_queries: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_failure: Option<PartialRoundFailure>,
}

struct PendingFetch {
    source: SourceIndex,
    url: String,
    query: usize,
}

pub struct SearchExecutor {
    round_timeout: Duration,
    concurrency: usize,
    max_fetches: usize,
    evidence_per_source: usize,
}

impl SearchExecutor {
    pub fn new(config: &ResearchConfig) -> Self {
        Self {
            round_timeout: config.round_timeout,
            concurrency: config.round_concurrency.max(1),
            max_fetches: config.max_fetches_per_round,
            evidence_per_source: config.evidence_per_source.max(1),
        }
    }

    pub async fn execute(
        &self,
        gateway: &ToolGateway,
        ctx: &CallContext,
        store: &mut EvidenceStore,
        queries: &[Query],
        round: u32,
    ) -> RoundOutcome {
        let deadline = Instant::now() + self.round_timeout;
        let mut failure = PartialRoundFailure::default();
        let mut search_errors: HashMap<usize, String> = HashMap::new();
        let mut evidence_per_query = vec![0usize; queries.len()];
        let mut fetch_failures_per_query = vec![(0usize, 0usize); queries.len()];

        // Search fan-out
        let texts: Vec<(usize, String)> = queries.iter().map(|q| q.text.clone()).enumerate().collect();
        let mut searches = stream::iter(texts)
            .map(|(i, text)| async move { (i, gateway.search(ctx, &text).await) })
            .buffer_unordered(self.concurrency);

        let mut results: Vec<(usize, Vec<SearchHit>)> = Vec::new();
        loop {
            match timeout_at(deadline, searches.next()).await {
                Ok(Some((i, Ok(hits)))) => results.push((i, hits)),
                Ok(Some((i, Err(e)))) => {
                    search_errors.insert(i, e.to_string());
                }
                Ok(None) => break,
                Err(_) => {
                    failure.deadline_exceeded = true;
                    break;
                }
            }
        }
        drop(searches);

        for i in 0..queries.len() {
            let answered = results.iter().any(|(j, _)| *j == i) || search_errors.contains_key(&i);
            if !answered {
                search_errors.insert(i, "round deadline exceeded".to_string());
            }
        }

        // Register sources in query order so ids do not depend on completion order
        results.sort_by_key(|(i, _)| *i);
        let mut new_sources = 0;
        let mut to_fetch: Vec<PendingFetch> = Vec::new();
        for (i, hits) in &results {
            let query = &queries[*i].text;
            for hit in hits {
                let Some((index, is_new)) = store.register_source(&hit.url, &hit.title, round) else {
                    continue;
                };
                if is_new {
                    new_sources += 1;
                    if to_fetch.len() < self.max_fetches {
                        to_fetch.push(PendingFetch {
                            source: index,
                            url: store.source(index).url.clone(),
                            query: *i,
                        });
                    } else {
                        store.set_fetch_status(index, FetchStatus::Skipped, None);
                    }
                }
                let relevance = relevance(query, &hit.snippet).max(SNIPPET_RELEVANCE);
                if store.add_evidence(index, query, round, &hit.snippet, relevance) {
                    evidence_per_query[*i] += 1;
                }
            }
        }

        // Page fetches for new sources
        let started: Vec<AtomicBool> = to_fetch.iter().map(|_| AtomicBool::new(false)).collect();
        let urls: Vec<(usize, String)> = to_fetch.iter().map(|p| p.url.clone()).enumerate().collect();
        let mut fetches = stream::iter(urls)
            .map(|(j, url)| {
                let started = &started;
                async move {
                    started[j].store(true, Ordering::Relaxed);
                    (j, gateway.fetch(ctx, &url).await)
                }
            })
            .buffer_unordered(self.concurrency);

        let mut fetched = 0usize;
        let mut completed: Vec<SourceIndex> = Vec::new();
        loop {
            match timeout_at(deadline, fetches.next()).await {
                Ok(Some((j, result))) => {
                    let pending = &to_fetch[j];
                    completed.push(pending.source);
                    let query = &queries[pending.query].text;
                    fetch_failures_per_query[pending.query].0 += 1;
                    match result {
                        Ok(page) => {
                            fetched += 1;
                            store.set_fetch_status(pending.source, FetchStatus::Fetched, None);
                            for (passage, score) in extract_passages(&page, query, self.evidence_per_source) {
                                if store.add_evidence(pending.source, query, round, &passage, score) {
                                    evidence_per_query[pending.query] += 1;
                                }
                            }
                        }
                        Err(e) => {
                            debug!(url = %pending.url, error = %e, "Fetch failed");
                            failure.failed_fetches += 1;
                            fetch_failures_per_query[pending.query].1 += 1;
                            store.set_fetch_status(pending.source, FetchStatus::Failed, Some(e.to_string()));
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    failure.deadline_exceeded = true;
                    break;
                }
            }
        }
        drop(fetches);

        // Fetches cut off by the deadline failed; ones never started were skipped.
        for (j, pending) in to_fetch.iter().enumerate().filter(|(_, p)| !completed.contains(&p.source)) {
            if started[j].load(Ordering::Relaxed) {
                failure.failed_fetches += 1;
                fetch_failures_per_query[pending.query].0 += 1;
                fetch_failures_per_query[pending.query].1 += 1;
                store.set_fetch_status(
                    pending.source,
                    FetchStatus::Failed,
                    Some("round deadline exceeded".to_string()),
                );
            } else {
                store.set_fetch_status(
                    pending.source,
                    FetchStatus::Skipped,
                    Some("round deadline reached before fetch".to_string()),
                );
            }
        }

        // A query failed if its search failed, or if every page it needed
        // failed and it contributed nothing.
        for (i, query) in queries.iter().enumerate() {
            let reason = match search_errors.remove(&i) {
                Some(reason) => Some(reason),
                None => {
                    let (attempted, failed) = fetch_failures_per_query[i];
                    (evidence_per_query[i] == 0 && attempted > 0 && attempted == failed)
                        .then(|| "all page fetches failed".to_string())
                }
            };
            if let Some(reason) = reason {
                failure.failed_queries.push(QueryFailure {
                    query: query.text.clone(),
                    reason,
                });
            }
        }

        let new_evidence: usize = evidence_per_query.iter().sum();
        let failed_queries: Vec<String> = failure.failed_queries.iter().map(|f| f.query.clone()).collect();

        if !failed_queries.is_empty() || failure.failed_fetches > 0 || failure.deadline_exceeded {
            warn!(
                session_id = %ctx.session_id,
                round,
                failed_queries = failed_queries.len(),
                failed_fetches = failure.failed_fetches,
                deadline_exceeded = failure.deadline_exceeded,
                "Round completed with partial failures"
            );
        }
        info!(
            session_id = %ctx.session_id,
            round,
            queries = queries.len(),
            new_sources,
            fetched,
            new_evidence,
            "Search round complete"
        );

        let partial_failure = (!failure.failed_queries.is_empty() || failure.failed_fetches > 0 || failure.deadline_exceeded)
            .then_some(failure);

        RoundOutcome {
            searches_attempted: queries.len(),
            new_sources,
            new_evidence,
            failed_queries,
            partial_failure,
        }
    }
}

fn terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

/// Share of the query's terms present in `text`, in `[0, 1]`.
pub fn relevance(query: &str, text: &str) -> f32 {
    let query_terms = terms(query);
    if query_terms.is_empty() {
        return 0.0;
    }
    let text_terms = terms(text);
    let hits = query_terms.iter().filter(|t| text_terms.binary_search(t).is_ok()).count();
    hits as f32 / query_terms.len() as f32
}

/// Pick the `limit` sentences of a page that best match the query.
/// Ties keep page order.
pub fn extract_passages(page: &str, query: &str, limit: usize) -> Vec<(String, f32)> {
    let mut scored: Vec<(usize, String, f32)> = split_sentences(page)
        .into_iter()
        .filter(|s| (MIN_PASSAGE_CHARS..=MAX_PASSAGE_CHARS).contains(&s.chars().count()))
        .enumerate()
        .map(|(i, s)| {
            let score = relevance(query, &s);
            (i, s, score)
        })
        .filter(|(_, _, score)| *score > 0.0)
        .collect();

    scored.sort_by(|a, b| b.2.total_cmp(&a.2).then(a.0.cmp(&b.0)));
    scored.truncate(limit);
    scored.into_iter().map(|(_, s, score)| (s, score)).collect()
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    for line in text.lines() {
        let mut current = String::new();
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            current.push(c);
            let boundary = matches!(c, '.' | '!' | '?') && chars.peek().map_or(true, |next| next.is_whitespace());
            if boundary {
                let sentence = current.trim().to_string();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                current.clear();
            }
        }
        let rest = current.trim();
        if !rest.is_empty() {
            sentences.push(rest.to_string());
        }
    }
    sentences
}
