use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::utils::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LLMConfig,
    pub search: SearchConfig,
    pub gateway: GatewayConfig,
    pub research: ResearchConfig,
    pub sessions: SessionConfig,
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LLMConfig {
    pub provider: String,
    pub api_key: String,
    /// Model used for query planning.
    pub worker_model: String,
    /// Model used for sufficiency critique and report composition.
    pub critic_model: String,
    pub base_url: Option<String>,
    pub max_tokens: u32,
}

impl LLMConfig {
    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub serpapi_key: String,
    /// SerpAPI engine, e.g. `google_light` or `google`.
    pub engine: String,
    pub max_results: usize,
    pub base_url: Option<String>,
}

/// Tool Gateway knobs: per-call timeout, retry budget, provider limits.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub call_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub llm_concurrency: usize,
    pub search_concurrency: usize,
    pub fetch_concurrency: usize,
    pub search_rate_per_second: Option<u32>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            llm_concurrency: 8,
            search_concurrency: 8,
            fetch_concurrency: 16,
            search_rate_per_second: None,
        }
    }
}

impl GatewayConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            jitter: true,
        }
    }
}

/// Research loop budget and fan-out limits.
#[derive(Debug, Clone)]
pub struct ResearchConfig {
    pub max_rounds: u32,
    pub max_queries_per_round: usize,
    /// Aggregate deadline for one round's searches and fetches.
    pub round_timeout: Duration,
    /// Overall deadline; checked at round boundaries.
    pub session_timeout: Duration,
    /// Concurrent tool calls issued by one round.
    pub round_concurrency: usize,
    pub max_fetches_per_round: usize,
    pub evidence_per_source: usize,
    /// Evidence items shown to the critic and the composer.
    pub prompt_evidence_limit: usize,
    pub cancel_grace: Duration,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            max_queries_per_round: 4,
            round_timeout: Duration::from_secs(90),
            session_timeout: Duration::from_secs(600),
            round_concurrency: 4,
            max_fetches_per_round: 8,
            evidence_per_source: 3,
            prompt_evidence_limit: 60,
            cancel_grace: Duration::from_millis(2_000),
        }
    }
}

impl ResearchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_rounds == 0 {
            bail!("RESEARCH_MAX_ROUNDS must be at least 1");
        }
        if self.max_queries_per_round == 0 {
            bail!("RESEARCH_MAX_QUERIES must be at least 1");
        }
        if self.round_concurrency == 0 {
            bail!("RESEARCH_ROUND_CONCURRENCY must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_concurrent: usize,
    /// Finished sessions are dropped once idle for this long.
    pub ttl: Duration,
    pub archive_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            ttl: Duration::from_secs(3_600),
            archive_dir: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let provider = env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let provider_key = format!("{}_API_KEY", provider.to_uppercase());
        let api_key = env::var(&provider_key)
            .or_else(|_| env::var("LLM_API_KEY"))
            .unwrap_or_default();
        let worker_model = env::var("LLM_MODEL").unwrap_or_else(|_| default_model(&provider).to_string());
        let critic_model = env::var("LLM_CRITIC_MODEL").unwrap_or_else(|_| worker_model.clone());

        let research = ResearchConfig {
            max_rounds: var_or("RESEARCH_MAX_ROUNDS", 3)?,
            max_queries_per_round: var_or("RESEARCH_MAX_QUERIES", 4)?,
            round_timeout: Duration::from_secs(var_or("RESEARCH_ROUND_TIMEOUT_SECS", 90)?),
            session_timeout: Duration::from_secs(var_or("RESEARCH_SESSION_TIMEOUT_SECS", 600)?),
            round_concurrency: var_or("RESEARCH_ROUND_CONCURRENCY", 4)?,
            max_fetches_per_round: var_or("RESEARCH_MAX_FETCHES_PER_ROUND", 8)?,
            evidence_per_source: var_or("RESEARCH_EVIDENCE_PER_SOURCE", 3)?,
            prompt_evidence_limit: var_or("RESEARCH_PROMPT_EVIDENCE_LIMIT", 60)?,
            cancel_grace: Duration::from_millis(var_or("RESEARCH_CANCEL_GRACE_MS", 2_000)?),
        };
        research.validate()?;

        Ok(Self {
            server: ServerConfig {
                port: var_or("PORT", 3000)?,
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                cors_allowed_origins: env::var("ALLOWED_ORIGINS")
                    .unwrap_or_else(|_| "http://localhost:3000,http://localhost:5173".to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            llm: LLMConfig {
                provider,
                api_key,
                worker_model,
                critic_model,
                base_url: env::var("LLM_BASE_URL").ok().filter(|s| !s.is_empty()),
                max_tokens: var_or("LLM_MAX_TOKENS", 4096)?,
            },
            search: SearchConfig {
                serpapi_key: env::var("SERPAPI_API_KEY").unwrap_or_default(),
                engine: env::var("SEARCH_ENGINE").unwrap_or_else(|_| "google_light".to_string()),
                max_results: var_or("SEARCH_MAX_RESULTS", 8)?,
                base_url: env::var("SEARCH_BASE_URL").ok().filter(|s| !s.is_empty()),
            },
            gateway: GatewayConfig {
                call_timeout_secs: var_or("TOOL_CALL_TIMEOUT_SECS", 30)?,
                max_attempts: var_or("TOOL_MAX_ATTEMPTS", 3)?,
                backoff_base_ms: var_or("TOOL_BACKOFF_BASE_MS", 500)?,
                backoff_max_ms: var_or("TOOL_BACKOFF_MAX_MS", 8_000)?,
                llm_concurrency: var_or("LLM_MAX_CONCURRENCY", 8)?,
                search_concurrency: var_or("SEARCH_MAX_CONCURRENCY", 8)?,
                fetch_concurrency: var_or("FETCH_MAX_CONCURRENCY", 16)?,
                search_rate_per_second: optional_var("SEARCH_RATE_PER_SECOND")?,
            },
            research,
            sessions: SessionConfig {
                max_concurrent: var_or("MAX_CONCURRENT_SESSIONS", 4)?,
                ttl: Duration::from_secs(var_or("SESSION_TTL_SECS", 3_600)?),
                archive_dir: env::var("SESSION_ARCHIVE_DIR").ok().filter(|s| !s.is_empty()).map(PathBuf::from),
            },
            log_dir: env::var("LOG_DIR").ok().filter(|s| !s.is_empty()).map(PathBuf::from),
        })
    }
}

fn default_model(provider: &str) -> &'static str {
    match provider {
        "anthropic" => "claude-sonnet-4-5",
        "groq" => "llama-3.3-70b-versatile",
        "openrouter" => "openai/gpt-4o-mini",
        "glm" => "glm-4.7",
        _ => "gpt-4o-mini",
    }
}

/// Parse an environment variable, falling back to `default` when unset.
fn var_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        _ => Ok(default),
    }
}

fn optional_var<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        _ => Ok(None),
    }
}
