//! HTTP handlers.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Instant;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::Stream;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use switchyard_agent::{AgentEvent, TurnOutcome, TurnRequest};
use switchyard_core::error::SwitchyardError;
use switchyard_metering::UserBudget;

use crate::error::ApiError;
use crate::state::GatewayState;
use crate::{TURN_ID_HEADER, USER_HEADER};

/// Caller identity from the request headers.
pub fn caller(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or_else(|| ApiError::unauthorized(format!("Missing {USER_HEADER} header")))
}

/// Bind a request to its caller and fix its turn id.
fn prepare(headers: &HeaderMap, mut request: TurnRequest) -> Result<(TurnRequest, String), ApiError> {
    request.user_id = caller(headers)?;
    let turn_id = request
        .turn_id
        .get_or_insert_with(|| Uuid::new_v4().to_string())
        .clone();
    if turn_id.is_empty() || HeaderValue::from_str(&turn_id).is_err() {
        return Err(ApiError::bad_request("Invalid turn id"));
    }
    Ok((request, turn_id))
}

/// Run a turn and release its slot afterwards.
async fn run_tracked(
    state: Arc<GatewayState>,
    request: TurnRequest,
    turn_id: String,
    events: mpsc::UnboundedSender<AgentEvent>,
    cancel: CancellationToken,
) -> Result<TurnOutcome, SwitchyardError> {
    #[cfg(feature = "metrics")]
    crate::metrics::record_turn_start();
    let start = Instant::now();

    let result = state.orchestrator.run_turn(request, events, cancel).await;
    state.finish_turn(&turn_id).await;
    debug!(
        turn = %turn_id,
        ok = result.is_ok(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Turn released"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_turn_end(&result, start.elapsed().as_secs_f64());
    result
}

/// NDJSON body over a turn's event channel.
///
/// Dropping the body (client disconnect) fires the turn's cancellation token.
pub struct NdjsonResponse {
    turn_id: String,
    events: UnboundedReceiverStream<AgentEvent>,
    _cancel_on_drop: DropGuard,
}

impl NdjsonResponse {
    fn new(turn_id: String, rx: mpsc::UnboundedReceiver<AgentEvent>, cancel: CancellationToken) -> Self {
        Self {
            turn_id,
            events: UnboundedReceiverStream::new(rx),
            _cancel_on_drop: cancel.drop_guard(),
        }
    }
}

impl Stream for NdjsonResponse {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match ready!(Pin::new(&mut self.events).poll_next(cx)) {
                Some(event) => match serde_json::to_vec(&event) {
                    Ok(mut line) => {
                        line.push(b'\n');
                        return Poll::Ready(Some(Ok(Bytes::from(line))));
                    }
                    Err(e) => warn!(%e, "Dropping unserializable event"),
                },
                None => return Poll::Ready(None),
            }
        }
    }
}

impl IntoResponse for NdjsonResponse {
    fn into_response(self) -> Response {
        let turn_id = HeaderValue::from_str(&self.turn_id).ok();
        let mut response = (
            [(CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson"))],
            Body::from_stream(self),
        )
            .into_response();
        if let Some(turn_id) = turn_id {
            response
                .headers_mut()
                .insert(HeaderName::from_static(TURN_ID_HEADER), turn_id);
        }
        response
    }
}

/// `POST /v1/turns`: run a turn and stream its events.
pub async fn stream_turn(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(request): Json<TurnRequest>,
) -> Result<NdjsonResponse, ApiError> {
    let (request, turn_id) = prepare(&headers, request)?;
    // Reject exhausted callers with a status code rather than a stream.
    state.orchestrator.meter().ensure_budget(&request.user_id).await?;

    let cancel = CancellationToken::new();
    state
        .register_turn(&turn_id, &request.user_id, cancel.clone())
        .await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let task_state = state.clone();
    let task_turn = turn_id.clone();
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = run_tracked(task_state, request, task_turn, tx, task_cancel).await;
    });

    Ok(NdjsonResponse::new(turn_id, rx, cancel))
}

/// `POST /v1/turns:collect`: run a turn and return its outcome.
pub async fn collect_turn(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(request): Json<TurnRequest>,
) -> Result<Json<TurnOutcome>, ApiError> {
    let (request, turn_id) = prepare(&headers, request)?;
    let cancel = CancellationToken::new();
    state
        .register_turn(&turn_id, &request.user_id, cancel.clone())
        .await?;

    // The turn runs on its own task so the slot is released even when the
    // client goes away and this future is dropped. The guard cancels it then.
    let _guard = cancel.clone().drop_guard();
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        // A closed channel would cancel the turn.
        let _rx = rx;
        run_tracked(state, request, turn_id, tx, cancel).await
    });
    let outcome = task
        .await
        .map_err(|e| SwitchyardError::Other(e.into()))??;
    Ok(Json(outcome))
}

/// `POST /v1/turns/{id}/abort`
pub async fn abort_turn(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(turn_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&headers)?;
    if state.abort_turn(&turn_id, &user).await {
        Ok((StatusCode::ACCEPTED, Json(json!({"turn_id": turn_id, "aborted": true}))))
    } else {
        Err(ApiError::not_found(format!("No running turn '{turn_id}'")))
    }
}

/// `GET /v1/budget`: the caller's budget and balance.
pub async fn budget(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Result<Json<UserBudget>, ApiError> {
    let user = caller(&headers)?;
    let budget = state
        .orchestrator
        .meter()
        .store()
        .budget(&user)
        .await?
        .ok_or_else(|| ApiError::unauthorized(format!("Unknown user '{user}'")))?;
    Ok(Json(budget))
}

/// `GET /health`
pub async fn health(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_turns": state.active_turns().await,
        "providers": state.orchestrator.providers().ids(),
    }))
}

/// `GET /metrics`: Prometheus text format.
#[cfg(feature = "metrics")]
pub async fn metrics(State(state): State<Arc<GatewayState>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => ApiError::not_found("Metrics are disabled").into_response(),
    }
}
