//! Research Loop Controller
//!
//! Drives one session through `PLANNING → SEARCHING → CRITIQUING →
//! (PLANNING | SYNTHESIZING) → DONE`. Every transition goes through
//! [`next_phase`], so the round budget and cancellation are enforced in one
//! place. Rounds run strictly one after another; the Evidence Store is owned
//! by the controller and only the Search Executor writes to it.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::agents::{
    Critique, PartialRoundFailure, Query, QueryPlanner, Report, ReportFlags, ReportSynthesizer, ResearchError,
    RoundOutcome, SearchExecutor, SufficiencyCritic, Verdict,
};
use crate::config::ResearchConfig;
use crate::evidence::EvidenceStore;
use crate::gateway::{CallContext, ToolGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Planning,
    Searching,
    Critiquing,
    Synthesizing,
    Done,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed | Phase::Cancelled)
    }
}

/// What the work of a phase produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Planned,
    PlanningFailed,
    RoundComplete,
    Verdict(Verdict),
    /// The session deadline passed; stop researching regardless of the verdict.
    BudgetExhausted,
    ReportReady,
    SynthesisFailed,
    Cancelled,
}

/// Transition function of the research loop. `round` is the number of the
/// round that just ran (1-based).
pub fn next_phase(phase: Phase, signal: Signal, round: u32, max_rounds: u32) -> Phase {
    if phase.is_terminal() {
        return phase;
    }
    match (phase, signal) {
        (_, Signal::Cancelled) => Phase::Cancelled,
        (Phase::Planning, Signal::Planned) => Phase::Searching,
        (Phase::Planning, Signal::PlanningFailed) => Phase::Failed,
        (Phase::Searching, Signal::RoundComplete) => Phase::Critiquing,
        (Phase::Critiquing, Signal::Verdict(Verdict::Continue)) if round < max_rounds => Phase::Planning,
        (Phase::Critiquing, Signal::Verdict(_) | Signal::BudgetExhausted) => Phase::Synthesizing,
        (Phase::Synthesizing, Signal::ReportReady) => Phase::Done,
        (Phase::Synthesizing, Signal::SynthesisFailed) => Phase::Failed,
        (phase, _) => phase,
    }
}

/// Append-only history entry for one completed round.
#[derive(Debug, Clone, Serialize)]
pub struct RoundRecord {
    pub number: u32,
    pub queries: Vec<Query>,
    pub new_evidence: usize,
    pub total_evidence: usize,
    pub failed_queries: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_failure: Option<PartialRoundFailure>,
    pub critique: Critique,
}

/// Receives progress as the controller runs. Calls happen on the
/// controller's task, in order.
pub trait ProgressSink: Send + Sync {
    fn phase_changed(&self, _phase: Phase, _round: u32) {}

    fn round_started(&self, round: u32, queries: &[Query]);

    fn round_completed(&self, round: u32, outcome: &RoundOutcome, store: &EvidenceStore);

    fn critique_ready(&self, _record: &RoundRecord) {}
}

#[derive(Debug)]
pub enum SessionOutcome {
    Completed(Report),
    Failed(ResearchError),
    Cancelled,
}

#[derive(Debug)]
pub struct ControllerOutcome {
    pub result: SessionOutcome,
    pub phase: Phase,
    pub rounds: Vec<RoundRecord>,
    pub store: EvidenceStore,
}

pub struct ResearchController {
    question: String,
    config: ResearchConfig,
    gateway: Arc<ToolGateway>,
    ctx: CallContext,
    planner: QueryPlanner,
    executor: SearchExecutor,
    critic: SufficiencyCritic,
    synthesizer: ReportSynthesizer,
}

impl ResearchController {
    pub fn new(question: impl Into<String>, config: ResearchConfig, gateway: Arc<ToolGateway>, ctx: CallContext) -> Self {
        Self {
            question: question.into(),
            planner: QueryPlanner::new(config.max_queries_per_round),
            executor: SearchExecutor::new(&config),
            critic: SufficiencyCritic::new(config.prompt_evidence_limit),
            synthesizer: ReportSynthesizer::new(config.prompt_evidence_limit),
            config,
            gateway,
            ctx,
        }
    }

    pub async fn run(self, sink: &dyn ProgressSink) -> ControllerOutcome {
        let started = Instant::now();
        let session_id = self.ctx.session_id;
        let max_rounds = self.config.max_rounds.max(1);

        let mut phase = Phase::Planning;
        let mut round = 0u32;
        let mut store = EvidenceStore::new();
        let mut rounds: Vec<RoundRecord> = Vec::new();
        let mut queries: Vec<Query> = Vec::new();
        let mut gaps: Vec<String> = Vec::new();
        let mut last_outcome = RoundOutcome::default();
        let mut flags = ReportFlags::default();
        let mut report: Option<Report> = None;
        let mut failure: Option<ResearchError> = None;

        info!(%session_id, max_rounds, "Research session started");

        while !phase.is_terminal() {
            let signal = if self.ctx.cancel.is_cancelled() {
                Signal::Cancelled
            } else {
                match phase {
                    Phase::Planning => {
                        round += 1;
                        sink.phase_changed(phase, round);
                        let planned = self
                            .guarded(self.planner.plan(&self.gateway, &self.ctx, &self.question, &gaps, &queries))
                            .await;
                        match planned {
                            None => Signal::Cancelled,
                            Some(Ok(planned)) => {
                                queries = planned;
                                sink.round_started(round, &queries);
                                Signal::Planned
                            }
                            Some(Err(e)) => {
                                failure = Some(e);
                                Signal::PlanningFailed
                            }
                        }
                    }
                    Phase::Searching => {
                        let outcome = self
                            .guarded(self.executor.execute(&self.gateway, &self.ctx, &mut store, &queries, round))
                            .await;
                        match outcome {
                            None => Signal::Cancelled,
                            Some(outcome) => {
                                sink.round_completed(round, &outcome, &store);
                                last_outcome = outcome;
                                Signal::RoundComplete
                            }
                        }
                    }
                    Phase::Critiquing => {
                        let critique = self
                            .guarded(self.critic.assess(
                                &self.gateway,
                                &self.ctx,
                                &self.question,
                                &store,
                                round,
                                max_rounds,
                            ))
                            .await;
                        match critique {
                            None => Signal::Cancelled,
                            Some(critique) => {
                                let signal = self.verdict_signal(&critique, round, max_rounds, started, &mut flags);
                                gaps = critique.gaps.clone();
                                let record = RoundRecord {
                                    number: round,
                                    queries: queries.clone(),
                                    new_evidence: last_outcome.new_evidence,
                                    total_evidence: store.evidence_count(),
                                    failed_queries: std::mem::take(&mut last_outcome.failed_queries),
                                    partial_failure: last_outcome.partial_failure.take(),
                                    critique,
                                };
                                sink.critique_ready(&record);
                                rounds.push(record);
                                signal
                            }
                        }
                    }
                    Phase::Synthesizing => {
                        sink.phase_changed(phase, round);
                        let composed = self
                            .guarded(self.synthesizer.synthesize(&self.gateway, &self.ctx, &self.question, &store, flags))
                            .await;
                        match composed {
                            None => Signal::Cancelled,
                            Some(Ok(composed)) => {
                                report = Some(composed);
                                Signal::ReportReady
                            }
                            Some(Err(e)) => {
                                failure = Some(e);
                                Signal::SynthesisFailed
                            }
                        }
                    }
                    Phase::Done | Phase::Failed | Phase::Cancelled => break,
                }
            };

            // A cancel that lands while a step finishes still wins at the boundary
            let signal = if self.ctx.cancel.is_cancelled() { Signal::Cancelled } else { signal };
            let next = next_phase(phase, signal, round, max_rounds);
            debug!(%session_id, round, from = ?phase, to = ?next, ?signal, "Phase transition");
            phase = next;
        }

        if phase.is_terminal() {
            sink.phase_changed(phase, round);
        }

        let result = match (phase, report, failure) {
            (Phase::Done, Some(report), _) => SessionOutcome::Completed(report),
            (Phase::Failed, _, Some(e)) => SessionOutcome::Failed(e),
            _ => SessionOutcome::Cancelled,
        };

        match &result {
            SessionOutcome::Completed(report) => info!(
                %session_id,
                rounds = rounds.len(),
                sources = store.source_count(),
                evidence = store.evidence_count(),
                cited = report.sources.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Research session completed"
            ),
            SessionOutcome::Failed(e) => warn!(%session_id, round, error = %e, "Research session failed"),
            SessionOutcome::Cancelled => info!(%session_id, round, "Research session cancelled"),
        }

        ControllerOutcome {
            result,
            phase,
            rounds,
            store,
        }
    }

    /// Turn a critique into a transition signal, recording why research stopped.
    fn verdict_signal(
        &self,
        critique: &Critique,
        round: u32,
        max_rounds: u32,
        started: Instant,
        flags: &mut ReportFlags,
    ) -> Signal {
        if critique.unverified {
            flags.unverified_sufficiency = true;
        }
        if critique.verdict != Verdict::Continue {
            return Signal::Verdict(critique.verdict);
        }

        if round >= max_rounds {
            info!(session_id = %self.ctx.session_id, round, "Round budget exhausted, synthesizing");
            flags.budget_exhausted = true;
            return Signal::Verdict(Verdict::Continue);
        }
        if started.elapsed() >= self.config.session_timeout {
            warn!(
                session_id = %self.ctx.session_id,
                round,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Session time budget exhausted, synthesizing"
            );
            flags.budget_exhausted = true;
            return Signal::BudgetExhausted;
        }
        Signal::Verdict(Verdict::Continue)
    }

    /// Run a step unless the session is cancelled. After a cancel the step
    /// gets `cancel_grace` to wind down; its result is discarded either way.
    async fn guarded<F: Future>(&self, step: F) -> Option<F::Output> {
        tokio::pin!(step);
        tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => {}
            output = &mut step => {
                // A cancel that lands mid-step makes in-flight calls return
                // CANCELLED, which can finish the step first.
                return (!self.ctx.cancel.is_cancelled()).then_some(output);
            }
        }

        if tokio::time::timeout(self.config.cancel_grace, step).await.is_err() {
            warn!(
                session_id = %self.ctx.session_id,
                grace_ms = self.config.cancel_grace.as_millis() as u64,
                "Tool calls still running after cancel grace period, abandoning them"
            );
        }
        None
    }
}
