//! Deterministic fakes for the external capabilities, shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::agents::{Query, RoundOutcome};
use crate::config::{Config, GatewayConfig, LLMConfig, ResearchConfig, SearchConfig, ServerConfig, SessionConfig};
use crate::controller::{Phase, ProgressSink, RoundRecord};
use crate::evidence::EvidenceStore;
use crate::fetch::PageFetcher;
use crate::gateway::{ToolError, ToolGateway};
use crate::llm::{CompletionProvider, ModelRole};
use crate::models::AppState;
use crate::search::{SearchHit, SearchProvider};
use crate::session::SessionManager;

pub fn fast_gateway_config() -> GatewayConfig {
    GatewayConfig {
        call_timeout_secs: 5,
        max_attempts: 3,
        backoff_base_ms: 1,
        backoff_max_ms: 2,
        ..GatewayConfig::default()
    }
}

pub fn fast_research_config() -> ResearchConfig {
    ResearchConfig {
        max_rounds: 3,
        max_queries_per_round: 3,
        round_timeout: Duration::from_secs(5),
        session_timeout: Duration::from_secs(60),
        round_concurrency: 4,
        max_fetches_per_round: 32,
        evidence_per_source: 2,
        prompt_evidence_limit: 40,
        cancel_grace: Duration::from_millis(200),
    }
}

pub fn gateway_with(
    llm: Arc<dyn CompletionProvider>,
    search: Arc<dyn SearchProvider>,
    fetcher: Arc<dyn PageFetcher>,
) -> ToolGateway {
    ToolGateway::new(llm, search, fetcher, &fast_gateway_config())
}

/// Application state over fakes, for router tests.
pub fn test_state(llm: Arc<ScriptedLlm>, search: FakeSearch, max_concurrent: usize) -> AppState {
    let config = Config {
        server: ServerConfig {
            port: 0,
            host: "127.0.0.1".to_string(),
            cors_allowed_origins: Vec::new(),
        },
        llm: LLMConfig {
            provider: "openai".to_string(),
            api_key: String::new(),
            worker_model: "worker".to_string(),
            critic_model: "critic".to_string(),
            base_url: None,
            max_tokens: 1024,
        },
        search: SearchConfig {
            serpapi_key: String::new(),
            engine: "google_light".to_string(),
            max_results: 3,
            base_url: None,
        },
        gateway: fast_gateway_config(),
        research: fast_research_config(),
        sessions: SessionConfig {
            max_concurrent,
            ..SessionConfig::default()
        },
        log_dir: None,
    };

    let gateway = Arc::new(gateway_with(llm, Arc::new(search), Arc::new(FakeFetcher::new())));
    let sessions = SessionManager::new(gateway, config.research.clone(), config.sessions.clone());
    AppState { config, sessions }
}

fn slug(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

/// Language model that answers by prompt marker.
///
/// Each marker owns a queue of replies; the last reply repeats once the
/// queue is down to one. Prompts matching no marker fail permanently.
#[derive(Default)]
pub struct ScriptedLlm {
    rules: Mutex<Vec<(String, VecDeque<Result<String, ToolError>>)>>,
    calls: Mutex<Vec<(ModelRole, String)>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, marker: &str, reply: Result<String, ToolError>) -> Self {
        {
            let mut rules = self.rules.lock().unwrap();
            match rules.iter_mut().find(|(m, _)| m == marker) {
                Some((_, replies)) => replies.push_back(reply),
                None => rules.push((marker.to_string(), VecDeque::from([reply]))),
            }
        }
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn roles(&self) -> Vec<ModelRole> {
        self.calls.lock().unwrap().iter().map(|(role, _)| *role).collect()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(_, prompt)| prompt.clone()).collect()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedLlm {
    async fn complete(&self, role: ModelRole, prompt: &str, _context: &str) -> Result<String, ToolError> {
        self.calls.lock().unwrap().push((role, prompt.to_string()));

        let mut rules = self.rules.lock().unwrap();
        let Some((_, replies)) = rules.iter_mut().find(|(marker, _)| prompt.contains(marker.as_str())) else {
            return Err(ToolError::permanent("no scripted reply for prompt"));
        };
        if replies.len() > 1 {
            replies.pop_front().unwrap_or_else(|| Err(ToolError::permanent("empty script")))
        } else {
            replies.front().cloned().unwrap_or_else(|| Err(ToolError::permanent("empty script")))
        }
    }
}

/// Decrements the in-flight counter even when the call is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Search that returns three hits per query at `https://example.com/<slug>/<i>`.
#[derive(Default)]
pub struct FakeSearch {
    pub calls: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    in_flight: AtomicUsize,
    delay: Option<Duration>,
    fail_all: Option<ToolError>,
    fail_first: Option<(usize, ToolError)>,
    fail_query: Option<(String, ToolError)>,
    shared_hit: Option<String>,
}

impl FakeSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_all(mut self, error: ToolError) -> Self {
        self.fail_all = Some(error);
        self
    }

    pub fn fail_first(mut self, count: usize, error: ToolError) -> Self {
        self.fail_first = Some((count, error));
        self
    }

    /// Fail every query containing `marker`.
    pub fn fail_query(mut self, marker: &str, error: ToolError) -> Self {
        self.fail_query = Some((marker.to_string(), error));
        self
    }

    /// Add the same page to every query's results.
    pub fn with_shared_hit(mut self, url: &str) -> Self {
        self.shared_hit = Some(url.to_string());
        self
    }
}

#[async_trait]
impl SearchProvider for FakeSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, ToolError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight::enter(&self.in_flight, &self.max_in_flight);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.fail_all {
            return Err(error.clone());
        }
        if let Some((count, error)) = &self.fail_first {
            if call < *count {
                return Err(error.clone());
            }
        }
        if let Some((marker, error)) = &self.fail_query {
            if query.contains(marker.as_str()) {
                return Err(error.clone());
            }
        }

        let slug = slug(query);
        let mut hits: Vec<SearchHit> = (1..=3)
            .map(|i| SearchHit {
                url: format!("https://example.com/{}/{}", slug, i),
                title: format!("{} result {}", query, i),
                snippet: format!("Result {} reports details about {}.", i, query),
            })
            .collect();
        if let Some(url) = &self.shared_hit {
            hits.push(SearchHit {
                url: url.clone(),
                title: "Shared page".to_string(),
                snippet: format!("A shared page that also mentions {}.", query),
            });
        }
        Ok(hits)
    }
}

/// Fetcher that returns a short article built from the URL's path.
#[derive(Default)]
pub struct FakeFetcher {
    pub calls: AtomicUsize,
    delay: Option<Duration>,
    fail_all: Option<ToolError>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_all(mut self, error: ToolError) -> Self {
        self.fail_all = Some(error);
        self
    }
}

#[async_trait]
impl PageFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<String, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.fail_all {
            return Err(error.clone());
        }

        let topic = url
            .trim_end_matches('/')
            .rsplit('/')
            .nth(1)
            .unwrap_or("topic")
            .replace('-', " ");
        Ok(format!(
            "Skip to content.\n\
             The article on {topic} opens with a summary of the main announcements.\n\
             Analysts said the {topic} figures were broadly in line with expectations.\n\
             Unrelated footer text about cookies and privacy settings on this website.",
            topic = topic
        ))
    }
}

/// Progress sink that records what it was told.
#[derive(Default)]
pub struct CollectingSink {
    phases: Mutex<Vec<(Phase, u32)>>,
    started: Mutex<Vec<(u32, Vec<String>)>>,
    completed: Mutex<Vec<(u32, usize)>>,
    critiques: Mutex<Vec<u32>>,
}

impl CollectingSink {
    pub fn started_rounds(&self) -> Vec<u32> {
        self.started.lock().unwrap().iter().map(|(round, _)| *round).collect()
    }

    pub fn completed_rounds(&self) -> Vec<(u32, usize)> {
        self.completed.lock().unwrap().clone()
    }

    pub fn critiqued_rounds(&self) -> Vec<u32> {
        self.critiques.lock().unwrap().clone()
    }

    pub fn last_phase(&self) -> Option<Phase> {
        self.phases.lock().unwrap().last().map(|(phase, _)| *phase)
    }
}

impl ProgressSink for CollectingSink {
    fn phase_changed(&self, phase: Phase, round: u32) {
        self.phases.lock().unwrap().push((phase, round));
    }

    fn round_started(&self, round: u32, queries: &[Query]) {
        let texts = queries.iter().map(|q| q.text.clone()).collect();
        self.started.lock().unwrap().push((round, texts));
    }

    fn round_completed(&self, round: u32, outcome: &RoundOutcome, _store: &EvidenceStore) {
        self.completed.lock().unwrap().push((round, outcome.new_evidence));
    }

    fn critique_ready(&self, record: &RoundRecord) {
        self.critiques.lock().unwrap().push(record.number);
    }
}
