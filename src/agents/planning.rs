//! Query Planner
//!
//! Produces at most `K` search queries per round. Round 1 plans for the
//! question itself; later rounds plan for the critic's gaps. Model output is
//! capped in generation order so identical output always yields the same
//! queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{current_date, extract_json, ResearchError};
use crate::gateway::{CallContext, ToolGateway};
use crate::llm::ModelRole;

/// Marks planner prompts (used by scripted test models).
pub const PLANNER_MARKER: &str = "SEARCH QUERY PLANNING";

const PLANNER_CONTEXT: &str = "You are a research strategist. You turn research questions and known \
gaps into precise web search queries. Respond with ONLY valid JSON.";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryOrigin {
    Initial,
    FollowUp { gap: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Query {
    pub text: String,
    pub origin: QueryOrigin,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PlannerOutput {
    Object {
        #[serde(default, alias = "search_queries", alias = "follow_up_queries")]
        queries: Vec<PlannedQuery>,
    },
    List(Vec<PlannedQuery>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PlannedQuery {
    Text(String),
    Detailed {
        #[serde(alias = "search_query")]
        query: String,
        #[serde(default)]
        gap: Option<String>,
    },
}

pub struct QueryPlanner {
    max_queries: usize,
}

impl QueryPlanner {
    pub fn new(max_queries: usize) -> Self {
        Self {
            max_queries: max_queries.max(1),
        }
    }

    /// Plan this round's queries.
    ///
    /// `gaps` is empty in round 1. When the model cannot be reached, later
    /// rounds repeat `previous`; round 1 fails the session.
    pub async fn plan(
        &self,
        gateway: &ToolGateway,
        ctx: &CallContext,
        question: &str,
        gaps: &[String],
        previous: &[Query],
    ) -> Result<Vec<Query>, ResearchError> {
        let prompt = self.create_prompt(question, gaps, previous);

        let response = match gateway.complete(ctx, ModelRole::Worker, prompt, PLANNER_CONTEXT).await {
            Ok(response) => response,
            Err(e) if !previous.is_empty() => {
                warn!(
                    session_id = %ctx.session_id,
                    error = %e,
                    "Planner unavailable, repeating previous round's queries"
                );
                return Ok(previous.to_vec());
            }
            Err(e) => return Err(ResearchError::Planning(e)),
        };

        let queries = self.parse_queries(&response, question, gaps);
        info!(
            session_id = %ctx.session_id,
            count = queries.len(),
            gaps = gaps.len(),
            "Planned search queries"
        );
        Ok(queries)
    }

    fn create_prompt(&self, question: &str, gaps: &[String], previous: &[Query]) -> String {
        let focus = if gaps.is_empty() {
            "This is the first round. Cover the main facets of the question.".to_string()
        } else {
            let listed: Vec<String> = gaps.iter().map(|g| format!("- {}", g)).collect();
            format!(
                "Earlier research left these gaps. Every query must target one of them:\n{}",
                listed.join("\n")
            )
        };

        let issued = if previous.is_empty() {
            String::new()
        } else {
            let listed: Vec<String> = previous.iter().map(|q| format!("- {}", q.text)).collect();
            format!("\nALREADY SEARCHED (do not repeat verbatim):\n{}\n", listed.join("\n"))
        };

        format!(
            r#"{marker}
Current date: {date}

RESEARCH QUESTION:
{question}

{focus}
{issued}
Write at most {k} specific web search queries. Prefer concrete names, dates and
figures over generic wording. Order them from most to least important.

OUTPUT FORMAT (respond with ONLY valid JSON):
{{
  "queries": [
    {{"query": "search query text", "gap": "the gap this query addresses"}}
  ]
}}"#,
            marker = PLANNER_MARKER,
            date = current_date(),
            question = question,
            focus = focus,
            issued = issued,
            k = self.max_queries,
        )
    }

    /// Turn model output into at most `K` unique queries, falling back to the
    /// gaps (or the question) when nothing usable comes back.
    fn parse_queries(&self, response: &str, question: &str, gaps: &[String]) -> Vec<Query> {
        let planned: Vec<(String, Option<String>)> = match serde_json::from_str::<PlannerOutput>(extract_json(response)) {
            Ok(PlannerOutput::Object { queries }) | Ok(PlannerOutput::List(queries)) => queries
                .into_iter()
                .map(|q| match q {
                    PlannedQuery::Text(text) => (text, None),
                    PlannedQuery::Detailed { query, gap } => (query, gap),
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "Planner output is not JSON, reading it line by line");
                response
                    .lines()
                    .map(clean_line)
                    .filter(|line| !line.is_empty() && !line.ends_with(':'))
                    .map(|line| (line, None))
                    .collect()
            }
        };

        let now = Utc::now();
        let mut queries: Vec<Query> = Vec::new();
        for (index, (text, gap)) in planned.into_iter().enumerate() {
            if queries.len() == self.max_queries {
                break;
            }
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if text.is_empty() || queries.iter().any(|q| q.text.eq_ignore_ascii_case(&text)) {
                continue;
            }
            queries.push(Query {
                text,
                origin: origin_for(gaps, gap, index),
                issued_at: now,
            });
        }

        if queries.is_empty() {
            warn!("Planner produced no usable queries, searching the gaps directly");
            let fallback: Vec<&str> = if gaps.is_empty() {
                vec![question]
            } else {
                gaps.iter().map(String::as_str).collect()
            };
            for text in fallback.into_iter().take(self.max_queries) {
                queries.push(Query {
                    text: text.trim().to_string(),
                    origin: origin_for(gaps, Some(text.to_string()), 0),
                    issued_at: now,
                });
            }
        }

        queries
    }
}

fn origin_for(gaps: &[String], planned_gap: Option<String>, index: usize) -> QueryOrigin {
    if gaps.is_empty() {
        return QueryOrigin::Initial;
    }
    let gap = planned_gap
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty())
        .unwrap_or_else(|| gaps[index % gaps.len()].clone());
    QueryOrigin::FollowUp { gap }
}

/// Strip list markers and quotes from a free-text planner line.
fn clean_line(line: &str) -> String {
    let line = line.trim().trim_start_matches(['-', '*', '•']).trim_start();
    // "1." / "2)" numbering, but not a leading year such as "2025 keynote"
    let line = match line.find(['.', ')']) {
        Some(pos) if pos > 0 && line[..pos].chars().all(|c| c.is_ascii_digit()) => &line[pos + 1..],
        _ => line,
    };
    line.trim().trim_matches('"').trim().to_string()
}
