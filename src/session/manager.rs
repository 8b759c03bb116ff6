use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::archive;
use super::events::ResearchEvent;
use crate::agents::{Query, Report, RoundOutcome};
use crate::config::{ResearchConfig, SessionConfig};
use crate::controller::{ControllerOutcome, Phase, ProgressSink, ResearchController, RoundRecord, SessionOutcome};
use crate::evidence::{EvidenceStore, EvidenceSummary};
use crate::gateway::{AttemptLog, CallContext, ToolGateway};
use crate::types::{AppError, AppResult};

/// Per-session event buffer; slow subscribers beyond this lag and skip.
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Running,
    /// Finished with a report.
    Stopped,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub question: String,
    pub status: SessionStatus,
    pub phase: Phase,
    pub round: u32,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub question: String,
    pub status: SessionStatus,
    pub phase: Phase,
    pub round: u32,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub evidence: EvidenceSummary,
    pub tool_attempts: usize,
    pub failed_tool_attempts: usize,
    pub rounds: Vec<RoundRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<Report>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct SessionState {
    status: SessionStatus,
    phase: Phase,
    round: u32,
    rounds: Vec<RoundRecord>,
    evidence: EvidenceSummary,
    report: Option<Report>,
    error: Option<String>,
    terminal: Option<ResearchEvent>,
    last_activity: DateTime<Utc>,
}

struct SessionHandle {
    id: Uuid,
    question: String,
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
    attempts: AttemptLog,
    events: broadcast::Sender<ResearchEvent>,
    state: Mutex<SessionState>,
}

impl SessionHandle {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish while holding the state lock so a subscriber that checks the
    /// state and then subscribes never misses an event in between.
    fn publish(&self, state: &mut SessionState, event: ResearchEvent) {
        state.last_activity = Utc::now();
        if event.is_terminal() {
            state.terminal = Some(event.clone());
        }
        // No receivers is fine: nobody is streaming right now
        let _ = self.events.send(event);
    }

    fn finish(&self, outcome: ControllerOutcome) {
        let mut state = self.lock_state();
        state.phase = outcome.phase;
        state.rounds = outcome.rounds;
        state.evidence = outcome.store.summary();

        let event = match outcome.result {
            SessionOutcome::Completed(report) => {
                state.status = SessionStatus::Stopped;
                state.report = Some(report.clone());
                ResearchEvent::ReportReady { report }
            }
            SessionOutcome::Failed(e) => {
                state.status = SessionStatus::Failed;
                state.error = Some(e.to_string());
                ResearchEvent::SessionFailed {
                    error_kind: e.error_kind().to_string(),
                    message: e.to_string(),
                }
            }
            SessionOutcome::Cancelled => {
                state.status = SessionStatus::Cancelled;
                ResearchEvent::SessionCancelled
            }
        };
        self.publish(&mut state, event);
    }

    fn fail_internal(&self, message: String) {
        let mut state = self.lock_state();
        state.status = SessionStatus::Failed;
        state.phase = Phase::Failed;
        state.error = Some(message.clone());
        self.publish(
            &mut state,
            ResearchEvent::SessionFailed {
                error_kind: "INTERNAL_ERROR".to_string(),
                message,
            },
        );
    }

    fn summary(&self) -> SessionSummary {
        let state = self.lock_state();
        SessionSummary {
            id: self.id,
            question: self.question.clone(),
            status: state.status,
            phase: state.phase,
            round: state.round,
            created_at: self.created_at,
            last_activity: state.last_activity,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let attempts = self.attempts.snapshot();
        let state = self.lock_state();
        SessionSnapshot {
            id: self.id,
            question: self.question.clone(),
            status: state.status,
            phase: state.phase,
            round: state.round,
            created_at: self.created_at,
            last_activity: state.last_activity,
            evidence: state.evidence,
            tool_attempts: attempts.len(),
            failed_tool_attempts: attempts.iter().filter(|a| a.error.is_some()).count(),
            rounds: state.rounds.clone(),
            report: state.report.clone(),
            error: state.error.clone(),
        }
    }
}

impl ProgressSink for SessionHandle {
    fn phase_changed(&self, phase: Phase, round: u32) {
        let mut state = self.lock_state();
        state.phase = phase;
        state.round = round;
        state.last_activity = Utc::now();
    }

    fn round_started(&self, round: u32, queries: &[Query]) {
        let mut state = self.lock_state();
        state.round = round;
        let event = ResearchEvent::RoundStarted {
            round,
            queries: queries.iter().map(|q| q.text.clone()).collect(),
        };
        self.publish(&mut state, event);
    }

    fn round_completed(&self, round: u32, outcome: &RoundOutcome, store: &EvidenceStore) {
        let mut state = self.lock_state();
        state.evidence = store.summary();
        let event = ResearchEvent::RoundComplete {
            round,
            evidence_count: outcome.new_evidence,
            total_evidence: store.evidence_count(),
            failed_queries: outcome.failed_queries.clone(),
        };
        self.publish(&mut state, event);
    }

    fn critique_ready(&self, record: &RoundRecord) {
        let mut state = self.lock_state();
        state.rounds.push(record.clone());
        state.last_activity = Utc::now();
    }
}

struct Inner {
    sessions: RwLock<HashMap<Uuid, Arc<SessionHandle>>>,
    permits: Arc<Semaphore>,
    gateway: Arc<ToolGateway>,
    research: ResearchConfig,
    config: SessionConfig,
}

/// Cheaply cloneable handle to the session registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(gateway: Arc<ToolGateway>, research: ResearchConfig, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
                gateway,
                research,
                config,
            }),
        }
    }

    /// Start a session. Rejected with `CapacityExceeded` when the maximum
    /// number of sessions is already running.
    pub async fn start(&self, question: &str) -> AppResult<Uuid> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AppError::InvalidRequest("question must not be empty".to_string()));
        }

        let permit = self
            .inner
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| AppError::CapacityExceeded(self.inner.config.max_concurrent.max(1)))?;

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let ctx = CallContext::new(id, cancel.clone());
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let now = Utc::now();

        let handle = Arc::new(SessionHandle {
            id,
            question: question.to_string(),
            created_at: now,
            cancel,
            attempts: ctx.attempts.clone(),
            events,
            state: Mutex::new(SessionState {
                status: SessionStatus::Running,
                phase: Phase::Planning,
                round: 0,
                rounds: Vec::new(),
                evidence: EvidenceSummary::default(),
                report: None,
                error: None,
                terminal: None,
                last_activity: now,
            }),
        });
        self.inner.sessions.write().await.insert(id, handle.clone());

        let controller = ResearchController::new(
            question,
            self.inner.research.clone(),
            self.inner.gateway.clone(),
            ctx,
        );
        let archive_dir = self.inner.config.archive_dir.clone();
        let span = info_span!("research_session", session_id = %id);

        tokio::spawn(
            async move {
                let _permit = permit;

                // Run on its own task so a panic fails this session instead of
                // leaving it RUNNING forever.
                let sink = handle.clone();
                let run = tokio::spawn(async move { controller.run(sink.as_ref()).await }.in_current_span());
                match run.await {
                    Ok(outcome) => handle.finish(outcome),
                    Err(e) => {
                        error!(error = %e, "Research task aborted");
                        handle.fail_internal(format!("research task aborted: {}", e));
                    }
                }

                if let Some(dir) = archive_dir {
                    if let Err(e) = archive::write_snapshot(&dir, &handle.snapshot()).await {
                        warn!(error = %e, dir = %dir.display(), "Failed to archive session");
                    }
                }
            }
            .instrument(span),
        );

        info!(session_id = %id, "Research session accepted");
        Ok(id)
    }

    /// Events from the subscription point on, ending after the terminal
    /// event. A finished session yields just its terminal event.
    pub async fn stream(&self, id: Uuid) -> AppResult<impl Stream<Item = ResearchEvent> + Send + 'static> {
        let handle = self.handle(id).await?;
        let (replay, receiver) = {
            let state = handle.lock_state();
            match &state.terminal {
                Some(event) => (Some(event.clone()), None),
                None => (None, Some(handle.events.subscribe())),
            }
        };

        Ok(async_stream::stream! {
            if let Some(event) = replay {
                yield event;
            } else if let Some(mut rx) = receiver {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let done = event.is_terminal();
                            yield event;
                            if done {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(session_id = %id, skipped, "Stream subscriber lagged, some events dropped");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    /// Request cancellation. Idempotent; returns the status the session had
    /// when the request arrived.
    pub async fn cancel(&self, id: Uuid) -> AppResult<SessionStatus> {
        let handle = self.handle(id).await?;
        let status = handle.lock_state().status;
        if status == SessionStatus::Running && !handle.cancel.is_cancelled() {
            info!(session_id = %id, "Cancellation requested");
            handle.cancel.cancel();
        }
        Ok(status)
    }

    pub async fn get(&self, id: Uuid) -> AppResult<SessionSnapshot> {
        Ok(self.handle(id).await?.snapshot())
    }

    /// All known sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.inner.sessions.read().await;
        let mut summaries: Vec<SessionSummary> = sessions.values().map(|h| h.summary()).collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    pub fn running_count(&self) -> usize {
        self.inner.config.max_concurrent.max(1) - self.inner.permits.available_permits()
    }

    /// Cancel every running session (used on shutdown).
    pub async fn cancel_all(&self) {
        let sessions = self.inner.sessions.read().await;
        for handle in sessions.values() {
            if handle.lock_state().status == SessionStatus::Running {
                handle.cancel.cancel();
            }
        }
    }

    /// Drop finished sessions idle for longer than the TTL. Returns how many
    /// were removed.
    pub async fn reap_expired(&self) -> usize {
        let ttl = self.inner.config.ttl;
        let now = Utc::now();
        let mut sessions = self.inner.sessions.write().await;
        let before = sessions.len();

        sessions.retain(|_, handle| {
            let state = handle.lock_state();
            let idle = (now - state.last_activity).to_std().unwrap_or_default();
            state.status == SessionStatus::Running || idle < ttl
        });

        let removed = before - sessions.len();
        if removed > 0 {
            info!(removed, remaining = sessions.len(), "Expired sessions removed");
        }
        removed
    }

    /// Periodically reap expired sessions until the runtime shuts down.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let period = (self.inner.config.ttl / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.reap_expired().await;
            }
        })
    }

    async fn handle(&self, id: Uuid) -> AppResult<Arc<SessionHandle>> {
        self.inner
            .sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("session {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::planning::PLANNER_MARKER;
    use crate::agents::reflection::CRITIC_MARKER;
    use crate::agents::report::COMPOSER_MARKER;
    use crate::gateway::ToolError;
    use crate::testing::{fast_research_config, gateway_with, FakeFetcher, FakeSearch, ScriptedLlm};
    use futures::StreamExt;

    fn happy_llm() -> Arc<ScriptedLlm> {
        Arc::new(
            ScriptedLlm::new()
                .on(PLANNER_MARKER, Ok(r#"{"queries": ["io keynote", "io pricing"]}"#.to_string()))
                .on(CRITIC_MARKER, Ok(r#"{"grade": "pass", "comment": "enough"}"#.to_string()))
                .on(COMPOSER_MARKER, Ok("# Report\nThe keynote <cite source=\"src-1\"/>.".to_string())),
        )
    }

    fn manager(llm: Arc<ScriptedLlm>, search: FakeSearch, config: SessionConfig) -> SessionManager {
        let gateway = Arc::new(gateway_with(llm, Arc::new(search), Arc::new(FakeFetcher::new())));
        SessionManager::new(gateway, fast_research_config(), config)
    }

    async fn collect(manager: &SessionManager, id: Uuid) -> Vec<ResearchEvent> {
        let stream = manager.stream(id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
            .await
            .expect("stream should end after the terminal event")
    }

    async fn wait_until_idle(manager: &SessionManager) {
        for _ in 0..100 {
            if manager.running_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sessions still running");
    }

    #[tokio::test]
    async fn test_stream_ends_with_report() {
        let search = FakeSearch::new().with_delay(Duration::from_millis(50));
        let manager = manager(happy_llm(), search, SessionConfig::default());

        let id = manager.start("latest I/O event report").await.unwrap();
        let events = collect(&manager, id).await;

        let names: Vec<&str> = events.iter().map(|e| e.event_name()).collect();
        assert_eq!(names.last(), Some(&"REPORT_READY"));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(names.contains(&"ROUND_COMPLETE"));

        let snapshot = manager.get(id).await.unwrap();
        assert_eq!(snapshot.status, SessionStatus::Stopped);
        assert_eq!(snapshot.phase, Phase::Done);
        assert_eq!(snapshot.rounds.len(), 1);
        assert!(snapshot.tool_attempts > 0);
        assert!(snapshot.report.is_some());
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_terminal_replay() {
        let manager = manager(happy_llm(), FakeSearch::new(), SessionConfig::default());
        let id = manager.start("question").await.unwrap();
        collect(&manager, id).await;

        let events = collect(&manager, id).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name(), "REPORT_READY");
    }

    #[tokio::test]
    async fn test_capacity_is_rejected_not_queued() {
        let search = FakeSearch::new().with_delay(Duration::from_secs(30));
        let config = SessionConfig {
            max_concurrent: 1,
            ..SessionConfig::default()
        };
        let manager = manager(happy_llm(), search, config);

        let first = manager.start("first").await.unwrap();
        let err = manager.start("second").await.unwrap_err();
        assert!(matches!(err, AppError::CapacityExceeded(1)));

        manager.cancel(first).await.unwrap();
        collect(&manager, first).await;
        wait_until_idle(&manager).await;
        tokio_test::assert_ok!(manager.start("third").await);
    }

    #[tokio::test]
    async fn test_cancel_emits_no_report() {
        let search = FakeSearch::new().with_delay(Duration::from_secs(30));
        let manager = manager(happy_llm(), search, SessionConfig::default());

        let id = manager.start("question").await.unwrap();
        let stream = manager.stream(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.cancel(id).await.unwrap(), SessionStatus::Running);
        let events: Vec<ResearchEvent> = tokio::time::timeout(Duration::from_secs(2), stream.collect())
            .await
            .unwrap();

        assert!(matches!(events.last(), Some(ResearchEvent::SessionCancelled)));
        assert!(!events.iter().any(|e| matches!(e, ResearchEvent::ReportReady { .. })));
        assert_eq!(manager.get(id).await.unwrap().status, SessionStatus::Cancelled);

        // idempotent
        assert_eq!(manager.cancel(id).await.unwrap(), SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_planning_failure_is_reported() {
        let llm = Arc::new(ScriptedLlm::new().on(PLANNER_MARKER, Err(ToolError::permanent("invalid api key"))));
        let manager = manager(llm, FakeSearch::new(), SessionConfig::default());

        let id = manager.start("question").await.unwrap();
        let events = collect(&manager, id).await;

        match events.last() {
            Some(ResearchEvent::SessionFailed { error_kind, message }) => {
                assert_eq!(error_kind, "PLANNING_FAILURE");
                assert!(message.contains("invalid api key"));
            }
            other => panic!("unexpected terminal event: {:?}", other),
        }
        assert_eq!(manager.get(id).await.unwrap().status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_session_and_empty_question() {
        let manager = manager(happy_llm(), FakeSearch::new(), SessionConfig::default());
        let unknown = Uuid::new_v4();

        assert!(matches!(manager.cancel(unknown).await, Err(AppError::NotFound(_))));
        assert!(matches!(manager.get(unknown).await, Err(AppError::NotFound(_))));
        assert!(manager.stream(unknown).await.is_err());
        assert!(matches!(manager.start("   ").await, Err(AppError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_reaper_drops_expired_sessions_only() {
        let config = SessionConfig {
            ttl: Duration::ZERO,
            ..SessionConfig::default()
        };
        let slow = manager(happy_llm(), FakeSearch::new().with_delay(Duration::from_secs(30)), config.clone());
        let running = slow.start("still running").await.unwrap();
        assert_eq!(slow.reap_expired().await, 0);
        assert!(slow.get(running).await.is_ok());

        let manager = manager(happy_llm(), FakeSearch::new(), config);
        let id = manager.start("question").await.unwrap();
        collect(&manager, id).await;

        assert_eq!(manager.list().await.len(), 1);
        assert_eq!(manager.reap_expired().await, 1);
        assert!(manager.get(id).await.is_err());
    }

    #[tokio::test]
    async fn test_finished_session_is_archived() {
        let dir = std::env::temp_dir().join(format!("research-agent-archive-{}", Uuid::new_v4()));
        let config = SessionConfig {
            archive_dir: Some(dir.clone()),
            ..SessionConfig::default()
        };
        let manager = manager(happy_llm(), FakeSearch::new(), config);

        let id = manager.start("question").await.unwrap();
        collect(&manager, id).await;

        let path = dir.join(format!("{}.json", id));
        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let body = tokio::fs::read_to_string(&path).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "STOPPED");
        assert_eq!(json["question"], "question");

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
