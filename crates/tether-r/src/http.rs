//! Caller-facing HTTP API: commands, polling, streaming and session admin.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tether_engine::Relay;
use tether_engine::error::{ErrorKind, RelayError};
use tether_engine::protocol::{
    BufferedItem, CommandRequest, CommandResponse, PollResponse, SessionInfo, TargetHint,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Header naming the caller, used for session affinity.
pub const CALLER_HEADER: &str = "x-tether-caller";

/// Sticky session token. Targets un-hinted requests at that session.
pub const SESSION_HEADER: &str = "x-tether-session";

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub keep_alive_interval_seconds: u64,
}

impl AppState {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self {
            relay,
            keep_alive_interval_seconds: 15,
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/livez", get(livez))
        .route("/command", post(command))
        .route("/poll", get(poll))
        .route("/stream", get(stream_items))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:session_id", delete(kill_session))
        .route("/sessions/:session_id/pause", post(pause_session))
        .route("/sessions/:session_id/resume", post(resume_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the caller API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Caller API listening on: {}", listener.local_addr()?);
    axum::serve(listener, build_app(state))
        .with_graceful_shutdown(shutdown)
        .await
}

// ============================================================================
// Errors
// ============================================================================

/// A relay error rendered as `{success: false, error: {kind, message}}`.
#[derive(Debug)]
pub struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self(e)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Stale => StatusCode::GONE,
        ErrorKind::Paused => StatusCode::LOCKED,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Ambiguous | ErrorKind::AlreadyActive | ErrorKind::NotActive => {
            StatusCode::CONFLICT
        }
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Observer => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind());
        (status, Json(CommandResponse::err(self.0.to_body(), None))).into_response()
    }
}

fn caller(headers: &HeaderMap) -> Option<&str> {
    headers.get(CALLER_HEADER).and_then(|v| v.to_str().ok())
}

/// An explicit hint wins; otherwise fall back to the session header.
fn with_session_header(hint: TargetHint, headers: &HeaderMap) -> TargetHint {
    if !hint.is_empty() {
        return hint;
    }
    match headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        Some(token) if !token.is_empty() => TargetHint::session(token),
        _ => hint,
    }
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn livez() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// POST /command
///
/// Relay errors stay inside the `{success, error}` envelope with a 200; only
/// a body that is not a command at all is rejected with 400.
pub async fn command(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CommandRequest>, JsonRejection>,
) -> Response {
    let Json(mut request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            let error = RelayError::InvalidRequest(rejection.body_text());
            return (
                StatusCode::BAD_REQUEST,
                Json(CommandResponse::err(error.to_body(), None)),
            )
                .into_response();
        }
    };
    request.target = with_session_header(request.target, &headers);
    let caller = caller(&headers);
    debug!(caller = ?caller, verb = request.verb.as_str(), "Command received");
    Json(state.relay.dispatch(caller, request).await).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct PollParams {
    #[serde(default)]
    pub since: u64,
    pub limit: Option<usize>,
    pub session: Option<String>,
    pub window: Option<String>,
}

impl PollParams {
    fn hint(&self) -> TargetHint {
        TargetHint {
            session: self.session.clone(),
            window: self.window.clone(),
        }
    }
}

/// GET /poll?since=N
pub async fn poll(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<PollParams>,
) -> Result<Json<PollResponse>, ApiError> {
    let hint = with_session_header(params.hint(), &headers);
    let response = state
        .relay
        .poll(caller(&headers), &hint, params.since, params.limit)?;
    Ok(Json(response))
}

fn to_event(item: &BufferedItem) -> Event {
    let event = Event::default()
        .id(item.seq.to_string())
        .event(item.entry.channel().as_str());
    match serde_json::to_string(item) {
        Ok(data) => event.data(data),
        Err(e) => {
            warn!(seq = item.seq, "Failed to encode stream item: {}", e);
            event.comment("unencodable item")
        }
    }
}

fn live_items(rx: broadcast::Receiver<BufferedItem>) -> impl Stream<Item = BufferedItem> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                // Skipped items show up as a jump in event ids.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Stream subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

/// GET /stream?since=N
///
/// Replays the backlog after `since`, then follows live items until the
/// session ends.
pub async fn stream_items(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<PollParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let hint = with_session_header(params.hint(), &headers);
    let subscription = state
        .relay
        .subscribe(caller(&headers), &hint, params.since)?;
    debug!(
        session_id = %subscription.session_id,
        backlog = subscription.backlog.len(),
        "Starting SSE stream"
    );

    let items = stream::iter(subscription.backlog).chain(live_items(subscription.live));
    let events = items.map(|item| Ok(to_event(&item)));

    let keep_alive = KeepAlive::new()
        .interval(Duration::from_secs(state.keep_alive_interval_seconds))
        .text("keep-alive");
    Ok(Sse::new(events).keep_alive(keep_alive))
}

/// GET /sessions
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.relay.list_sessions())
}

/// POST /sessions/{id}/pause
pub async fn pause_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    Ok(Json(state.relay.set_paused(&session_id, true)?))
}

/// POST /sessions/{id}/resume
pub async fn resume_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    Ok(Json(state.relay.set_paused(&session_id, false)?))
}

/// DELETE /sessions/{id}
pub async fn kill_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    Ok(Json(state.relay.kill(&session_id)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_livez() {
        let (status, body) = livez().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[test]
    fn test_session_header_only_fills_missing_hint() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, "sess_a".parse().unwrap());

        let hint = with_session_header(TargetHint::default(), &headers);
        assert_eq!(hint, TargetHint::session("sess_a"));

        let explicit = with_session_header(TargetHint::window("w2"), &headers);
        assert_eq!(explicit, TargetHint::window("w2"));

        let none = with_session_header(TargetHint::default(), &HeaderMap::new());
        assert!(none.is_empty());
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::Ambiguous), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
    }
}
