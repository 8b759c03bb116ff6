//! Search Module
//!
//! Web search behind the Tool Gateway's `search(query) -> hits` capability.
//! SerpAPI is the production backend; any engine it exposes (`google`,
//! `google_light`, `google_scholar`, `bing`, ...) can be selected by config.

pub mod serpapi;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::gateway::ToolError;

pub use serpapi::SerpApiClient;

/// One organic search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, ToolError>;
}
