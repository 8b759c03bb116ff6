//! Tool Gateway
//!
//! Uniform wrapper around every external capability (model completion,
//! web search, page fetch). Each call gets:
//!
//! - a per-call timeout
//! - jittered exponential-backoff retries (everything except `PERMANENT`)
//! - cancellation tied to the owning session
//! - a global per-capability concurrency limit (counting semaphore), shared
//!   by all sessions, plus an optional per-second quota on search
//! - an entry in the session's attempt log for every attempt
//!
//! Results have no effect on the Evidence Store until the caller processes
//! a success.

pub mod attempts;
pub mod error;

pub use attempts::{AttemptLog, AttemptRecord};
pub use error::{retry_after_header, ToolError, ToolErrorKind};

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::fetch::PageFetcher;
use crate::llm::{CompletionProvider, ModelRole};
use crate::search::{SearchHit, SearchProvider};
use crate::utils::retry::{with_retry, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Completion,
    Search,
    Fetch,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Completion => write!(f, "completion"),
            Capability::Search => write!(f, "search"),
            Capability::Fetch => write!(f, "fetch"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ToolRequest {
    Complete {
        role: ModelRole,
        prompt: String,
        context: String,
    },
    Search {
        query: String,
    },
    Fetch {
        url: String,
    },
}

impl ToolRequest {
    pub fn capability(&self) -> Capability {
        match self {
            ToolRequest::Complete { .. } => Capability::Completion,
            ToolRequest::Search { .. } => Capability::Search,
            ToolRequest::Fetch { .. } => Capability::Fetch,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ToolResponse {
    Text(String),
    Hits(Vec<SearchHit>),
    Page(String),
}

/// Per-session call context: who is calling, how to abort, where to log.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub session_id: Uuid,
    pub cancel: CancellationToken,
    pub attempts: AttemptLog,
}

impl CallContext {
    pub fn new(session_id: Uuid, cancel: CancellationToken) -> Self {
        Self {
            session_id,
            cancel,
            attempts: AttemptLog::new(),
        }
    }
}

pub struct ToolGateway {
    llm: Arc<dyn CompletionProvider>,
    search: Arc<dyn SearchProvider>,
    fetcher: Arc<dyn PageFetcher>,
    call_timeout: Duration,
    retry: RetryPolicy,
    completion_permits: Semaphore,
    search_permits: Semaphore,
    fetch_permits: Semaphore,
    search_quota: Option<DefaultDirectRateLimiter>,
}

impl ToolGateway {
    pub fn new(
        llm: Arc<dyn CompletionProvider>,
        search: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn PageFetcher>,
        config: &GatewayConfig,
    ) -> Self {
        let search_quota = config
            .search_rate_per_second
            .and_then(NonZeroU32::new)
            .map(|rate| RateLimiter::direct(Quota::per_second(rate)));

        Self {
            llm,
            search,
            fetcher,
            call_timeout: config.call_timeout(),
            retry: config.retry_policy(),
            completion_permits: Semaphore::new(config.llm_concurrency.max(1)),
            search_permits: Semaphore::new(config.search_concurrency.max(1)),
            fetch_permits: Semaphore::new(config.fetch_concurrency.max(1)),
            search_quota,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Invoke a capability with timeout, retry and cancellation.
    pub async fn invoke(&self, ctx: &CallContext, request: ToolRequest) -> Result<ToolResponse, ToolError> {
        let capability = request.capability();
        let request = &request;

        let result = with_retry(&self.retry, &ctx.cancel, move |attempt| async move {
            let started = Instant::now();
            let result = self.attempt(ctx, request).await;
            ctx.attempts.record(capability, attempt, started.elapsed(), result.as_ref().err());

            match &result {
                Ok(_) => debug!(
                    session_id = %ctx.session_id,
                    %capability,
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Tool call succeeded"
                ),
                Err(e) => warn!(
                    session_id = %ctx.session_id,
                    %capability,
                    attempt,
                    kind = %e.kind,
                    error = %e.message,
                    "Tool call attempt failed"
                ),
            }
            result
        })
        .await;

        if let Err(e) = &result {
            if e.kind != ToolErrorKind::Cancelled {
                warn!(session_id = %ctx.session_id, %capability, kind = %e.kind, "Tool call exhausted");
            }
        }
        result
    }

    pub async fn complete(
        &self,
        ctx: &CallContext,
        role: ModelRole,
        prompt: impl Into<String>,
        context: impl Into<String>,
    ) -> Result<String, ToolError> {
        let request = ToolRequest::Complete {
            role,
            prompt: prompt.into(),
            context: context.into(),
        };
        match self.invoke(ctx, request).await? {
            ToolResponse::Text(text) => Ok(text),
            other => Err(unexpected(Capability::Completion, &other)),
        }
    }

    pub async fn search(&self, ctx: &CallContext, query: &str) -> Result<Vec<SearchHit>, ToolError> {
        let request = ToolRequest::Search {
            query: query.to_string(),
        };
        match self.invoke(ctx, request).await? {
            ToolResponse::Hits(hits) => Ok(hits),
            other => Err(unexpected(Capability::Search, &other)),
        }
    }

    pub async fn fetch(&self, ctx: &CallContext, url: &str) -> Result<String, ToolError> {
        let request = ToolRequest::Fetch { url: url.to_string() };
        match self.invoke(ctx, request).await? {
            ToolResponse::Page(text) => Ok(text),
            other => Err(unexpected(Capability::Fetch, &other)),
        }
    }

    /// A single attempt: wait for a permit (and quota), then call with a timeout.
    async fn attempt(&self, ctx: &CallContext, request: &ToolRequest) -> Result<ToolResponse, ToolError> {
        let capability = request.capability();
        let permits = match capability {
            Capability::Completion => &self.completion_permits,
            Capability::Search => &self.search_permits,
            Capability::Fetch => &self.fetch_permits,
        };

        let _permit = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ToolError::cancelled()),
            permit = permits.acquire() => permit.map_err(|_| ToolError::permanent("gateway is shut down"))?,
        };

        if let (Capability::Search, Some(quota)) = (capability, &self.search_quota) {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(ToolError::cancelled()),
                _ = quota.until_ready() => {}
            }
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ToolError::cancelled()),
            result = tokio::time::timeout(self.call_timeout, self.dispatch(request)) => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(ToolError::timeout(format!(
                    "{} call exceeded {}ms",
                    capability,
                    self.call_timeout.as_millis()
                ))),
            },
        }
    }

    async fn dispatch(&self, request: &ToolRequest) -> Result<ToolResponse, ToolError> {
        match request {
            ToolRequest::Complete { role, prompt, context } => {
                self.llm.complete(*role, prompt, context).await.map(ToolResponse::Text)
            }
            ToolRequest::Search { query } => self.search.search(query).await.map(ToolResponse::Hits),
            ToolRequest::Fetch { url } => self.fetcher.fetch(url).await.map(ToolResponse::Page),
        }
    }
}

fn unexpected(expected: Capability, response: &ToolResponse) -> ToolError {
    let got = match response {
        ToolResponse::Text(_) => "text",
        ToolResponse::Hits(_) => "hits",
        ToolResponse::Page(_) => "page",
    };
    ToolError::permanent(format!("{} call produced a {} response", expected, got))
}
