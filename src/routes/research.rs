use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
    Json,
    extract::{rejection::JsonRejection, State, Path},
    response::{
        Json as ResponseJson,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::stream::{Stream, StreamExt};
use uuid::Uuid;
use validator::Validate;
use tracing::{info, warn};

use crate::models::{AppState, CancelResearchResponse, StartResearchRequest, StartResearchResponse};
use crate::session::{SessionSnapshot, SessionStatus, SessionSummary};
use crate::types::{AppError, AppResult};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/research/start", post(start_research))
        .route("/api/research/stream/{session_id}", get(stream_research))
        .route("/api/research/cancel/{session_id}", post(cancel_research))
        .route("/api/research/sessions", get(list_sessions))
        .route("/api/research/sessions/{session_id}", get(get_session))
        .with_state(state)
}

async fn start_research(
    State(state): State<AppState>,
    payload: Result<Json<StartResearchRequest>, JsonRejection>,
) -> AppResult<ResponseJson<StartResearchResponse>> {
    let Json(request) = payload?;
    request
        .validate()
        .map_err(|e| AppError::InvalidRequest(e.to_string()))?;
    info!(question_chars = request.question.chars().count(), "Received research request");

    let session_id = state.sessions.start(&request.question).await?;

    Ok(Json(StartResearchResponse {
        session_id,
        status: SessionStatus::Running,
    }))
}

/// Server-sent events: one SSE event per research event, named by its kind,
/// with the JSON event as data. The stream closes after the terminal event.
async fn stream_research(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let events = state.sessions.stream(session_id).await?;
    info!(%session_id, "Stream subscriber attached");

    let stream = events.map(move |event| {
        let name = event.event_name();
        let sse = Event::default().event(name).json_data(&event).unwrap_or_else(|e| {
            warn!(%session_id, event = name, error = %e, "Failed to serialize event");
            Event::default().event(name).data("{}")
        });
        Ok(sse)
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

async fn cancel_research(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> AppResult<ResponseJson<CancelResearchResponse>> {
    let status = state.sessions.cancel(session_id).await?;

    Ok(Json(CancelResearchResponse {
        session_id,
        status,
        cancel_requested: status == SessionStatus::Running,
    }))
}

async fn list_sessions(State(state): State<AppState>) -> ResponseJson<Vec<SessionSummary>> {
    Json(state.sessions.list().await)
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> AppResult<ResponseJson<SessionSnapshot>> {
    Ok(Json(state.sessions.get(session_id).await?))
}
