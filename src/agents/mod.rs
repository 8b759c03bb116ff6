//! Research Agents
//!
//! The roles the Research Loop Controller drives through each round:
//!
//! - **Query Planner**: turns the question or the critic's gaps into search queries
//! - **Search Executor**: runs the queries, fetches new pages, extracts evidence
//! - **Sufficiency Critic**: decides whether the evidence answers the question
//! - **Report Synthesizer**: composes the final cited report
//!
//! ## Pipeline Overview
//!
//! ```text
//!  Question
//!      │
//!      ▼
//! ┌─────────────┐
//! │   Query     │  → 1..K queries for the current gaps
//! │  Planner    │◄─────────────┐
//! └─────────────┘              │
//!      │                       │
//!      ▼                       │
//! ┌─────────────┐              │
//! │   Search    │  → evidence  │ CONTINUE (gaps)
//! │  Executor   │    (deduped) │
//! └─────────────┘              │
//!      │                       │
//!      ▼                       │
//! ┌─────────────┐              │
//! │ Sufficiency │──────────────┘
//! │   Critic    │
//! └─────────────┘
//!      │ STOP / budget exhausted
//!      ▼
//! ┌─────────────┐
//! │   Report    │  → cited Markdown report
//! │ Synthesizer │
//! └─────────────┘
//! ```

pub mod planning;
pub mod reflection;
pub mod report;
pub mod searching;

pub use planning::{Query, QueryOrigin, QueryPlanner};
pub use reflection::{Critique, SufficiencyCritic, Verdict};
pub use report::{CitedSource, Report, ReportFlags, ReportSection, ReportSynthesizer};
pub use searching::{PartialRoundFailure, QueryFailure, RoundOutcome, SearchExecutor};

use crate::gateway::ToolError;

/// Session-fatal escalations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResearchError {
    #[error("query planning failed: {0}")]
    Planning(ToolError),

    #[error("report synthesis failed: {0}")]
    Synthesis(ToolError),
}

impl ResearchError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            ResearchError::Planning(_) => "PLANNING_FAILURE",
            ResearchError::Synthesis(_) => "SYNTHESIS_FAILURE",
        }
    }
}

/// Pull the JSON payload out of a model answer that may wrap it in a
/// Markdown fence or surround it with prose.
pub(crate) fn extract_json(response: &str) -> &str {
    let response = response.trim();
    if let Some(fenced) = response
        .split("```json")
        .nth(1)
        .and_then(|s| s.split("```").next())
    {
        return fenced.trim();
    }
    if let Some(fenced) = response.split("```").nth(1) {
        let fenced = fenced.trim();
        if fenced.starts_with('{') || fenced.starts_with('[') {
            return fenced;
        }
    }

    match (response.find(['{', '[']), response.rfind(['}', ']'])) {
        (Some(start), Some(end)) if end > start => &response[start..=end],
        _ => response,
    }
}

pub(crate) fn current_date() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}
