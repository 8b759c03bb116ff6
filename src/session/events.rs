//! Events streamed to session subscribers.

use serde::Serialize;

use crate::agents::Report;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResearchEvent {
    RoundStarted {
        round: u32,
        queries: Vec<String>,
    },
    RoundComplete {
        round: u32,
        /// Evidence items added by this round.
        evidence_count: usize,
        total_evidence: usize,
        failed_queries: Vec<String>,
    },
    ReportReady {
        report: Report,
    },
    SessionFailed {
        error_kind: String,
        message: String,
    },
    SessionCancelled,
}

impl ResearchEvent {
    /// Terminal events end a stream; exactly one is emitted per session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResearchEvent::ReportReady { .. } | ResearchEvent::SessionFailed { .. } | ResearchEvent::SessionCancelled
        )
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            ResearchEvent::RoundStarted { .. } => "ROUND_STARTED",
            ResearchEvent::RoundComplete { .. } => "ROUND_COMPLETE",
            ResearchEvent::ReportReady { .. } => "REPORT_READY",
            ResearchEvent::SessionFailed { .. } => "SESSION_FAILED",
            ResearchEvent::SessionCancelled => "SESSION_CANCELLED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let event = ResearchEvent::RoundComplete {
            round: 2,
            evidence_count: 5,
            total_evidence: 12,
            failed_queries: vec!["io pricing".to_string()],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "ROUND_COMPLETE");
        assert_eq!(json["evidence_count"], 5);
        assert_eq!(json["failed_queries"][0], "io pricing");
        assert_eq!(event.event_name(), "ROUND_COMPLETE");
        assert!(!event.is_terminal());

        let json = serde_json::to_value(ResearchEvent::SessionCancelled).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "SESSION_CANCELLED"}));
        assert!(ResearchEvent::SessionCancelled.is_terminal());
    }
}
