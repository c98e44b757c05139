use super::{ApiError, AppState};
use crate::agent::{Event, EventSink};
use crate::hooks::strip_hook_state;
use crate::session::Session;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures::Stream;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateSessionRequest {
    #[serde(default, alias = "session_id")]
    session_id: Option<String>,
    #[serde(default)]
    state: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RunRequest {
    #[serde(alias = "app_name")]
    app_name: String,
    #[serde(alias = "user_id")]
    user_id: String,
    #[serde(alias = "session_id")]
    session_id: String,
    #[serde(alias = "new_message")]
    new_message: NewMessage,
}

#[derive(Debug, Deserialize)]
struct NewMessage {
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct MessagePart {
    #[serde(default)]
    text: Option<String>,
}

impl NewMessage {
    fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn check_app(state: &AppState, app_name: &str) -> ApiResult<()> {
    if app_name == state.app_name {
        Ok(())
    } else {
        Err(ApiError::not_found(format!("App not found: {app_name}")))
    }
}

/// Session state as a client may set it; hook memory is server-owned.
fn client_state(
    mut state: Option<Map<String, Value>>,
    user_id: &str,
) -> Option<Map<String, Value>> {
    if let Some(map) = state.as_mut()
        && strip_hook_state(map)
    {
        warn!(user = %user_id, "ignoring hook state supplied by client");
    }
    state
}

pub(super) async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub(super) async fn list_apps(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(vec![state.app_name.clone()])
}

pub(super) async fn create_session(
    State(state): State<Arc<AppState>>,
    Path((app_name, user_id)): Path<(String, String)>,
    body: Option<Json<CreateSessionRequest>>,
) -> ApiResult<Json<Session>> {
    check_app(&state, &app_name)?;
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let session = state
        .sessions
        .create(
            &app_name,
            &user_id,
            req.session_id.as_deref(),
            client_state(req.state, &user_id),
        )
        .await?;
    debug!(session = %session.id, user = %user_id, "session created");
    Ok(Json(session))
}

pub(super) async fn create_session_with_id(
    State(state): State<Arc<AppState>>,
    Path((app_name, user_id, session_id)): Path<(String, String, String)>,
    body: Option<Json<CreateSessionRequest>>,
) -> ApiResult<Json<Session>> {
    check_app(&state, &app_name)?;
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let session = state
        .sessions
        .create(
            &app_name,
            &user_id,
            Some(&session_id),
            client_state(req.state, &user_id),
        )
        .await?;
    Ok(Json(session))
}

pub(super) async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Path((app_name, user_id)): Path<(String, String)>,
) -> ApiResult<Json<Vec<Session>>> {
    check_app(&state, &app_name)?;
    Ok(Json(state.sessions.list(&app_name, &user_id).await))
}

pub(super) async fn get_session(
    State(state): State<Arc<AppState>>,
    Path((app_name, user_id, session_id)): Path<(String, String, String)>,
) -> ApiResult<Json<Session>> {
    check_app(&state, &app_name)?;
    state
        .sessions
        .get(&app_name, &user_id, &session_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Session not found"))
}

pub(super) async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path((app_name, user_id, session_id)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    check_app(&state, &app_name)?;
    state
        .sessions
        .delete(&app_name, &user_id, &session_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Validate a run request and load its session.
async fn prepare_run(state: &AppState, req: &RunRequest) -> ApiResult<(Session, String)> {
    check_app(state, &req.app_name)?;
    let text = req.new_message.text();
    if text.trim().is_empty() {
        return Err(ApiError::bad_request("new_message must contain text"));
    }
    let session = state
        .sessions
        .get(&req.app_name, &req.user_id, &req.session_id)
        .await
        .ok_or_else(|| ApiError::not_found("Session not found"))?;
    Ok((session, text))
}

/// Run one turn and record it in the session. Returns the agent's events.
///
/// Turns on one session are serialized: the turn starts from the history and
/// state the previous turn recorded.
async fn run_and_record(
    state: &AppState,
    session: &Session,
    text: &str,
    sink: Option<&EventSink>,
) -> anyhow::Result<Vec<Event>> {
    let _turn = state
        .sessions
        .lock_turn(&session.app_name, &session.user_id, &session.id)
        .await;
    let session = state
        .sessions
        .get(&session.app_name, &session.user_id, &session.id)
        .await
        .ok_or_else(|| anyhow::anyhow!("session {} was deleted", session.id))?;

    let history = session.history();
    let mut session_state = session.state.clone();
    let outcome = state
        .runner
        .run_turn(&session.id, &history, &mut session_state, text, sink)
        .await?;

    state
        .sessions
        .append_events(
            &session.app_name,
            &session.user_id,
            &session.id,
            outcome.events.clone(),
            Some(session_state),
        )
        .await?;

    // The first event is the user's own message.
    Ok(outcome.events.into_iter().skip(1).collect())
}

pub(super) async fn run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RunRequest>,
) -> ApiResult<Json<Vec<Event>>> {
    let (session, text) = prepare_run(&state, &req).await?;
    match run_and_record(&state, &session, &text, None).await {
        Ok(events) => Ok(Json(events)),
        Err(e) => {
            warn!(session = %session.id, error = %e, "run failed");
            Err(ApiError::new(StatusCode::BAD_GATEWAY, e.to_string()))
        }
    }
}

pub(super) async fn run_sse(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RunRequest>,
) -> Response {
    let (session, text) = match prepare_run(&state, &req).await {
        Ok(prepared) => prepared,
        Err(e) => return e.into_response(),
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let agent_name = state.runner.agent().name.clone();
    tokio::spawn(async move {
        if let Err(e) = run_and_record(&state, &session, &text, Some(&tx)).await {
            warn!(session = %session.id, error = %e, "run failed");
            let event = Event::error(
                &crate::agent::event::new_invocation_id(),
                &agent_name,
                format!("The agent could not answer: {e}"),
            );
            // Receiver gone means the client disconnected.
            let _ = tx.send(event);
        }
    });

    Sse::new(event_stream(rx))
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keepalive"),
        )
        .into_response()
}

fn event_stream(
    mut rx: mpsc::UnboundedReceiver<Event>,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            match SseEvent::default().json_data(&event) {
                Ok(sse) => yield Ok(sse),
                Err(e) => {
                    error!(event = %event.id, error = %e, "failed to serialize SSE event; dropping");
                }
            }
        }
    }
}
