//! Sufficiency Critic
//!
//! Grades the cumulative evidence against the question. The critic fails
//! safe: an unreachable model or an unreadable answer stops the loop with
//! the report flagged as unverified, and a CONTINUE without actionable gaps
//! is downgraded to STOP.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{current_date, extract_json};
use crate::evidence::EvidenceStore;
use crate::gateway::{CallContext, ToolGateway};
use crate::llm::ModelRole;

/// Marks critic prompts (used by scripted test models).
pub const CRITIC_MARKER: &str = "RESEARCH SUFFICIENCY REVIEW";

const CRITIC_CONTEXT: &str = "You are a meticulous quality assurance analyst. Assume the research \
topic is valid; judge only the depth, coverage and credibility of the evidence. Respond with a single \
raw JSON object.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Serialize)]
pub struct Critique {
    pub verdict: Verdict,
    pub rationale: String,
    /// Follow-up needs for the next round; empty when stopping.
    pub gaps: Vec<String>,
    /// The verdict is a fail-safe default, not the critic's judgement.
    pub unverified: bool,
}

impl Critique {
    fn stop(rationale: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Stop,
            rationale: rationale.into(),
            gaps: Vec::new(),
            unverified: false,
        }
    }

    fn unverified(rationale: impl Into<String>) -> Self {
        Self {
            unverified: true,
            ..Self::stop(rationale)
        }
    }
}

#[derive(Debug, Deserialize)]
struct Feedback {
    #[serde(alias = "verdict")]
    grade: String,
    #[serde(default, alias = "rationale")]
    comment: String,
    #[serde(default, alias = "gaps")]
    follow_up_queries: Option<Vec<FollowUp>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FollowUp {
    Text(String),
    Query {
        #[serde(alias = "query", alias = "gap", alias = "description")]
        search_query: String,
    },
}

pub struct SufficiencyCritic {
    prompt_evidence_limit: usize,
}

impl SufficiencyCritic {
    pub fn new(prompt_evidence_limit: usize) -> Self {
        Self { prompt_evidence_limit }
    }

    pub async fn assess(
        &self,
        gateway: &ToolGateway,
        ctx: &CallContext,
        question: &str,
        store: &EvidenceStore,
        round: u32,
        max_rounds: u32,
    ) -> Critique {
        if store.is_empty() {
            info!(session_id = %ctx.session_id, round, "No evidence gathered, stopping without review");
            return Critique::stop("No evidence could be gathered for this question.");
        }

        let prompt = self.create_prompt(question, store, round, max_rounds);
        let critique = match gateway.complete(ctx, ModelRole::Critic, prompt, CRITIC_CONTEXT).await {
            Ok(response) => parse_critique(&response),
            Err(e) => {
                warn!(session_id = %ctx.session_id, round, error = %e, "Critic unavailable, stopping unverified");
                Critique::unverified(format!("Sufficiency review failed: {}", e))
            }
        };

        info!(
            session_id = %ctx.session_id,
            round,
            verdict = ?critique.verdict,
            gaps = critique.gaps.len(),
            unverified = critique.unverified,
            "Sufficiency review complete"
        );
        critique
    }

    fn create_prompt(&self, question: &str, store: &EvidenceStore, round: u32, max_rounds: u32) -> String {
        format!(
            r#"{marker}
Current date: {date}
Research round {round} of at most {max_rounds}.

RESEARCH QUESTION:
{question}

EVIDENCE GATHERED SO FAR ({sources} sources, {items} items):
{evidence}

Evaluate whether this evidence is enough to write a thorough, well-cited report.
If there are significant gaps in depth or coverage, grade "fail", explain what is
missing, and list specific follow-up search queries that would fill the gaps.
If the evidence thoroughly covers the question, grade "pass".

OUTPUT FORMAT (respond with ONLY valid JSON):
{{
  "grade": "pass" | "fail",
  "comment": "what is covered and what is missing",
  "follow_up_queries": [{{"search_query": "specific follow-up query"}}]
}}"#,
            marker = CRITIC_MARKER,
            date = current_date(),
            round = round,
            max_rounds = max_rounds,
            question = question,
            sources = store.source_count(),
            items = store.evidence_count(),
            evidence = store.format_for_prompt(self.prompt_evidence_limit),
        )
    }
}

fn parse_critique(response: &str) -> Critique {
    let feedback: Feedback = match serde_json::from_str(extract_json(response)) {
        Ok(feedback) => feedback,
        Err(e) => {
            warn!(error = %e, "Critic output unreadable, stopping unverified");
            return Critique::unverified("Sufficiency review returned an unreadable answer.");
        }
    };

    let verdict = match feedback.grade.trim().to_lowercase().as_str() {
        "pass" | "stop" | "sufficient" => Verdict::Stop,
        "fail" | "continue" | "insufficient" => Verdict::Continue,
        other => {
            warn!(grade = %other, "Unknown critic grade, stopping unverified");
            return Critique::unverified(format!("Sufficiency review returned unknown grade {:?}.", other));
        }
    };

    if verdict == Verdict::Stop {
        return Critique::stop(feedback.comment);
    }

    let mut gaps: Vec<String> = Vec::new();
    for follow_up in feedback.follow_up_queries.unwrap_or_default() {
        let gap = match follow_up {
            FollowUp::Text(text) => text,
            FollowUp::Query { search_query } => search_query,
        };
        let gap = gap.trim().to_string();
        if !gap.is_empty() && !gaps.iter().any(|g| g.eq_ignore_ascii_case(&gap)) {
            gaps.push(gap);
        }
    }

    if gaps.is_empty() {
        warn!("Critic asked to continue without naming any gap, stopping");
        return Critique::stop(feedback.comment);
    }

    Critique {
        verdict: Verdict::Continue,
        rationale: feedback.comment,
        gaps,
        unverified: false,
    }
}
