use crate::bridge::{self, ForwardError, ForwardRequest, StartAck};
use crate::config_store::AutoForward;
use crate::relay::{ViewerId, VIEWER_CHANNEL_CAPACITY};
use crate::state::HubState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{self, BoxStream, StreamExt};
use relay_core::CanonicalMessage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

type ApiError = (StatusCode, Json<Value>);

fn bad_request(message: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message.to_string()})),
    )
}

/// Full current contents of the message buffer, oldest first.
pub async fn get_messages(State(hub): State<Arc<HubState>>) -> Json<Vec<CanonicalMessage>> {
    Json(hub.buffer.read().await.snapshot())
}

#[derive(Serialize)]
pub struct ConfigView {
    pub bot_tokens: Vec<String>,
    pub active_token: Option<String>,
    pub workflow_api_url: String,
    pub workflow_api_key_set: bool,
    pub auto_forward: AutoForward,
}

/// Current configuration. The backend key is reported as a presence
/// flag only, never echoed.
pub async fn get_config(State(hub): State<Arc<HubState>>) -> Json<ConfigView> {
    let config = hub.store.snapshot().await;
    Json(ConfigView {
        bot_tokens: config.bot_tokens,
        active_token: config.active_token,
        workflow_api_url: config.workflow_api_url,
        workflow_api_key_set: !config.workflow_api_key.trim().is_empty(),
        auto_forward: config.auto_forward,
    })
}

#[derive(Deserialize)]
pub struct TokenBody {
    pub token: String,
}

pub async fn add_token(
    State(hub): State<Arc<HubState>>,
    Json(body): Json<TokenBody>,
) -> Result<Json<Value>, ApiError> {
    hub.store.add_token(&body.token).await.map_err(bad_request)?;
    Ok(Json(json!({"ok": true})))
}

/// Select the active upstream token. A changed selection is a hard
/// restart of ingestion sequencing: cursor reset, buffer cleared.
pub async fn select_token(
    State(hub): State<Arc<HubState>>,
    Json(body): Json<TokenBody>,
) -> Result<Json<Value>, ApiError> {
    let changed = hub
        .store
        .select_token(&body.token)
        .await
        .map_err(bad_request)?;
    if changed {
        hub.reset_ingest().await;
        info!(event = "token_switch");
    }
    Ok(Json(json!({"ok": true, "changed": changed})))
}

pub async fn get_autosend(State(hub): State<Arc<HubState>>) -> Json<AutoForward> {
    Json(hub.store.auto_forward().await)
}

pub async fn set_autosend(
    State(hub): State<Arc<HubState>>,
    Json(settings): Json<AutoForward>,
) -> Result<Json<Value>, ApiError> {
    hub.store
        .set_auto_forward(settings)
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": err.to_string()}))))?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Deserialize)]
pub struct ForwardBody {
    pub content: String,
    #[serde(rename = "chatId")]
    pub chat_id: String,
    #[serde(default)]
    pub from: Option<String>,
}

/// Manual forward into the workflow backend. Responds with the
/// run-started acknowledgement, or an error payload if the run never
/// starts.
pub async fn forward(
    State(hub): State<Arc<HubState>>,
    Json(body): Json<ForwardBody>,
) -> Result<Json<StartAck>, ApiError> {
    if body.content.trim().is_empty() {
        return Err(bad_request("content is empty"));
    }
    let Some(credential_token) = hub.store.active_token().await else {
        return Err(forward_error_response(ForwardError::NotConfigured(
            "active bot token",
        )));
    };
    let request = ForwardRequest {
        content: body.content,
        chat_id: body.chat_id,
        credential_token,
        display_name: body.from.unwrap_or_else(|| "web-client".to_string()),
    };
    let ack = bridge::forward_manual(hub, request)
        .await
        .map_err(forward_error_response)?;
    Ok(Json(ack))
}

fn forward_error_response(err: ForwardError) -> ApiError {
    let status = match err {
        ForwardError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
        ForwardError::Request(_)
        | ForwardError::Backend { .. }
        | ForwardError::Transport(_)
        | ForwardError::NeverStarted => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({"error": err.to_string()})))
}

/// Detaches the viewer when its connection goes away, however the
/// stream ends.
struct DetachOnDrop {
    hub: Arc<HubState>,
    run_id: String,
    viewer_id: ViewerId,
}

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        let hub = self.hub.clone();
        let run_id = self.run_id.clone();
        let viewer_id = self.viewer_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                hub.relay.detach(&run_id, viewer_id).await;
            });
        }
    }
}

/// Per-run viewer stream. Each relayed frame goes out as one SSE data
/// event; the stream closes when the run finishes or errors. An
/// unknown run id yields an immediately-closing empty stream.
pub async fn run_events(
    State(hub): State<Arc<HubState>>,
    Path(run_id): Path<String>,
) -> Sse<BoxStream<'static, Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Value>(VIEWER_CHANNEL_CAPACITY);
    let stream: BoxStream<'static, Result<Event, Infallible>> = match hub
        .relay
        .attach(&run_id, tx)
        .await
    {
        Some(viewer_id) => {
            let guard = DetachOnDrop {
                hub: hub.clone(),
                run_id,
                viewer_id,
            };
            stream::unfold((rx, guard), |(mut rx, guard)| async move {
                match rx.recv().await {
                    Some(value) => {
                        let event = Event::default().data(value.to_string());
                        Some((Ok::<Event, Infallible>(event), (rx, guard)))
                    }
                    None => None,
                }
            })
            .boxed()
        }
        None => stream::empty().boxed(),
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
