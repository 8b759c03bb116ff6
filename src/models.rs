use validator::Validate;

use crate::config::Config;
use crate::session::{SessionManager, SessionStatus};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub sessions: SessionManager,
}

#[derive(Debug, serde::Deserialize, Validate)]
pub struct StartResearchRequest {
    #[validate(length(min = 1, max = 4000, message = "question must be 1 to 4000 characters"))]
    pub question: String,
}

#[derive(Debug, serde::Serialize)]
pub struct StartResearchResponse {
    pub session_id: uuid::Uuid,
    pub status: SessionStatus,
}

#[derive(Debug, serde::Serialize)]
pub struct CancelResearchResponse {
    pub session_id: uuid::Uuid,
    /// Status when the cancel arrived; cancelling a finished session is a no-op.
    pub status: SessionStatus,
    pub cancel_requested: bool,
}

#[derive(Debug, serde::Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub version: String,
    pub running_sessions: usize,
}
