//! SerpAPI Client
//!
//! Issues `GET /search.json` against SerpAPI and maps `organic_results`
//! into [`SearchHit`]s. HTTP failures are classified into tool error kinds
//! so the gateway can decide whether to retry.
//!
//! SerpAPI reports "no results" as an `error` field on a 200 response;
//! that case is an empty hit list, not a failure.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info};

use super::{SearchHit, SearchProvider};
use crate::config::SearchConfig;
use crate::gateway::{retry_after_header, ToolError};

const SERPAPI_BASE: &str = "https://serpapi.com";

/// SerpAPI client for web search
pub struct SerpApiClient {
    client: Client,
    api_key: String,
    engine: String,
    max_results: usize,
    base_url: String,
}

impl SerpApiClient {
    /// Create a new SerpAPI client using the `google_light` engine
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            engine: "google_light".to_string(),
            max_results: 10,
            base_url: SERPAPI_BASE.to_string(),
        }
    }

    /// Configure client from config
    pub fn from_config(config: &SearchConfig) -> Self {
        let mut client = Self::new(config.serpapi_key.clone())
            .with_engine(&config.engine)
            .with_max_results(config.max_results);
        if let Some(base_url) = &config.base_url {
            client = client.with_base_url(base_url);
        }
        client
    }

    pub fn with_engine(mut self, engine: &str) -> Self {
        self.engine = engine.to_string();
        self
    }

    /// Set maximum results per search
    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = max.max(1);
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn parse_results(&self, results: &Value) -> Result<Vec<SearchHit>, ToolError> {
        if let Some(error) = results.get("error").and_then(|v| v.as_str()) {
            if error.contains("hasn't returned any results") {
                return Ok(Vec::new());
            }
            return Err(ToolError::permanent(format!("serpapi error: {}", error)));
        }

        let Some(organic_results) = results.get("organic_results") else {
            return Ok(Vec::new());
        };
        let results_array = organic_results
            .as_array()
            .ok_or_else(|| ToolError::permanent("serpapi organic_results is not an array"))?;

        let hits = results_array
            .iter()
            .filter_map(|result| {
                // Scholar results without a link cannot be fetched or cited
                let link = result.get("link").and_then(|v| v.as_str())?;
                let title = result
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Untitled")
                    .to_string();
                let snippet = result
                    .get("snippet")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                Some(SearchHit {
                    url: link.to_string(),
                    title,
                    snippet,
                })
            })
            .take(self.max_results)
            .collect();

        Ok(hits)
    }
}

#[async_trait]
impl SearchProvider for SerpApiClient {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, ToolError> {
        if self.api_key.is_empty() {
            return Err(ToolError::permanent("SerpAPI key not configured"));
        }

        info!(query = %query, engine = %self.engine, "Searching via SerpAPI");

        let num = self.max_results.to_string();
        let response = self
            .client
            .get(format!("{}/search.json", self.base_url))
            .query(&[
                ("engine", self.engine.as_str()),
                ("q", query),
                ("hl", "en"),
                ("num", num.as_str()),
                ("api_key", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ToolError::from_reqwest("serpapi", e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::from_status("serpapi", status, &body, retry_after));
        }

        let results: Value = response
            .json()
            .await
            .map_err(|e| ToolError::from_reqwest("serpapi", e))?;

        debug!("Raw SerpAPI response received");

        let hits = self.parse_results(&results)?;
        info!(count = hits.len(), "SerpAPI search completed");
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ToolErrorKind;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_organic_results_become_hits() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/search.json")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("engine".into(), "google".into()),
                Matcher::UrlEncoded("q".into(), "rust async runtimes".into()),
                Matcher::UrlEncoded("api_key".into(), "serp-key".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"organic_results":[
                    {"title":"Tokio","link":"https://tokio.rs/","snippet":"An asynchronous runtime."},
                    {"title":"No link entry","snippet":"dropped"},
                    {"title":"smol","link":"https://github.com/smol-rs/smol"},
                    {"title":"async-std","link":"https://async.rs/","snippet":"Deprecated."}
                ]}"#,
            )
            .create_async()
            .await;

        let client = SerpApiClient::new("serp-key")
            .with_engine("google")
            .with_max_results(2)
            .with_base_url(&server.url());
        let hits = client.search("rust async runtimes").await.unwrap();

        mock.assert_async().await;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "https://tokio.rs/");
        assert_eq!(hits[0].snippet, "An asynchronous runtime.");
        assert_eq!(hits[1].title, "smol");
        assert_eq!(hits[1].snippet, "");
    }

    #[tokio::test]
    async fn test_no_results_is_empty_not_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/search.json")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"error":"Google hasn't returned any results for this query."}"#)
            .create_async()
            .await;

        let client = SerpApiClient::new("serp-key").with_base_url(&server.url());
        assert!(client.search("zzzz qqqq").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_http_errors_are_classified() {
        let mut server = mockito::Server::new_async().await;
        let limited = server
            .mock("GET", "/search.json")
            .match_query(Matcher::Any)
            .with_status(429)
            .with_header("retry-after", "1")
            .with_body(r#"{"error":"Your account has run out of searches."}"#)
            .create_async()
            .await;

        let client = SerpApiClient::new("serp-key").with_base_url(&server.url());
        let err = client.search("anything").await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::RateLimited);
        limited.remove_async().await;

        server
            .mock("GET", "/search.json")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(r#"{"error":"Invalid API key."}"#)
            .create_async()
            .await;
        let err = client.search("anything").await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_missing_key_fails_without_request() {
        let err = SerpApiClient::new("").search("anything").await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Permanent);
    }
}
