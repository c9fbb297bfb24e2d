use crate::relay::RelayTable;
use crate::state::HubState;
use futures_util::StreamExt;
use relay_core::{FrameDecoder, StreamFrame, WorkflowEvent};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Synchronous acknowledgement returned to a manual caller once the
/// backend reports the run as started.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StartAck {
    pub workflow_run_id: String,
    pub task_id: String,
}

#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub content: String,
    pub chat_id: String,
    pub credential_token: String,
    pub display_name: String,
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("missing configuration: {0}")]
    NotConfigured(&'static str),
    #[error("workflow backend request failed: {0}")]
    Request(String),
    #[error("workflow backend returned status {status}: {body}")]
    Backend { status: u16, body: String },
    #[error("stream transport error: {0}")]
    Transport(String),
    #[error("stream ended before the run started")]
    NeverStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    Manual,
    Auto,
}

impl ForwardMode {
    fn as_str(self) -> &'static str {
        match self {
            ForwardMode::Manual => "manual",
            ForwardMode::Auto => "auto",
        }
    }
}

type AckSender = oneshot::Sender<Result<StartAck, ForwardError>>;

/// Manual forward: blocks until the backend either reports the run as
/// started (ack) or fails before that point. The stream keeps pumping
/// in the background after the ack.
pub async fn forward_manual(
    hub: Arc<HubState>,
    request: ForwardRequest,
) -> Result<StartAck, ForwardError> {
    let response = open_stream(&hub, &request, ForwardMode::Manual).await?;
    let (ack_tx, ack_rx) = oneshot::channel();
    tokio::spawn(pump_stream(
        hub,
        response,
        ForwardMode::Manual,
        Some(ack_tx),
    ));
    ack_rx.await.unwrap_or(Err(ForwardError::NeverStarted))
}

/// Automatic forward: never surfaces a synchronous result. Failures
/// show up only in the diagnostic log.
pub async fn forward_auto(hub: Arc<HubState>, request: ForwardRequest) {
    match open_stream(&hub, &request, ForwardMode::Auto).await {
        Ok(response) => {
            tokio::spawn(pump_stream(hub, response, ForwardMode::Auto, None));
        }
        Err(err) => {
            warn!(event = "auto_forward_failed", error = %err);
        }
    }
}

async fn open_stream(
    hub: &HubState,
    request: &ForwardRequest,
    mode: ForwardMode,
) -> Result<reqwest::Response, ForwardError> {
    let config = hub.store.snapshot().await;
    if config.workflow_api_url.trim().is_empty() {
        return Err(ForwardError::NotConfigured("workflow_api_url"));
    }
    if config.workflow_api_key.trim().is_empty() {
        return Err(ForwardError::NotConfigured("workflow_api_key"));
    }

    let body = json!({
        "inputs": {
            "content": request.content,
            "chatId": request.chat_id,
            "credentialToken": request.credential_token,
        },
        "response_mode": "streaming",
        "user": request.display_name,
    });

    info!(
        event = "backend_call",
        mode = mode.as_str(),
        chat_id = %request.chat_id,
        content_len = request.content.len()
    );

    let response = hub
        .http
        .post(config.workflow_api_url.trim())
        .bearer_auth(config.workflow_api_key.trim())
        .json(&body)
        .send()
        .await
        .map_err(|err| ForwardError::Request(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!(event = "backend_rejected", mode = mode.as_str(), status = status.as_u16(), body = %body);
        return Err(ForwardError::Backend {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// Per-stream bookkeeping threaded through frame routing.
struct RunContext {
    run_id: Option<String>,
    finished: bool,
}

impl RunContext {
    fn new() -> Self {
        Self {
            run_id: None,
            finished: false,
        }
    }
}

async fn pump_stream(
    hub: Arc<HubState>,
    response: reqwest::Response,
    mode: ForwardMode,
    mut ack: Option<AckSender>,
) {
    let mut decoder = FrameDecoder::new();
    let mut ctx = RunContext::new();
    let mut stream = response.bytes_stream();

    while let Some(next) = stream.next().await {
        match next {
            Ok(chunk) => {
                let report = decoder.push_chunk(&chunk);
                for err in report.errors {
                    warn!(event = "frame_malformed", mode = mode.as_str(), error = %err);
                }
                for frame in report.frames {
                    route_frame(&hub.relay, &mut ctx, &mut ack, frame).await;
                }
            }
            Err(err) => {
                warn!(event = "stream_transport_error", mode = mode.as_str(), error = %err);
                if let Some(tx) = ack.take() {
                    let _ = tx.send(Err(ForwardError::Transport(err.to_string())));
                }
                if !ctx.finished {
                    if let Some(run_id) = &ctx.run_id {
                        let terminal = json!({"event": "error", "message": err.to_string()});
                        hub.relay.finish_run(run_id, &terminal).await;
                    }
                }
                return;
            }
        }
    }

    let report = decoder.finish();
    for err in report.errors {
        warn!(event = "frame_malformed", mode = mode.as_str(), error = %err);
    }
    for frame in report.frames {
        route_frame(&hub.relay, &mut ctx, &mut ack, frame).await;
    }

    if let Some(tx) = ack.take() {
        let _ = tx.send(Err(ForwardError::NeverStarted));
    }
    if !ctx.finished {
        if let Some(run_id) = &ctx.run_id {
            hub.relay
                .finish_run(run_id, &json!({"event": "stream_closed"}))
                .await;
        }
    }
    info!(event = "stream_done", mode = mode.as_str(), run_id = ctx.run_id.as_deref().unwrap_or(""));
}

async fn route_frame(
    relay: &RelayTable,
    ctx: &mut RunContext,
    ack: &mut Option<AckSender>,
    frame: StreamFrame,
) {
    match &frame.event {
        WorkflowEvent::Started { run_id, task_id } => {
            relay.register_run(run_id, task_id).await;
            if let Some(tx) = ack.take() {
                let _ = tx.send(Ok(StartAck {
                    workflow_run_id: run_id.clone(),
                    task_id: task_id.clone(),
                }));
            }
            if ctx.run_id.is_none() {
                ctx.run_id = Some(run_id.clone());
            }
            relay.dispatch(run_id, &frame.payload).await;
        }
        WorkflowEvent::Finished {
            status,
            elapsed_time,
            error,
        } => {
            info!(
                event = "run_finished",
                status = status.as_deref().unwrap_or(""),
                elapsed_time = elapsed_time.unwrap_or_default(),
                error = error.as_deref().unwrap_or("")
            );
            if ctx.finished {
                return;
            }
            if let Some(run_id) = &ctx.run_id {
                relay.finish_run(run_id, &frame.payload).await;
                ctx.finished = true;
            }
        }
        WorkflowEvent::Other => {
            if ctx.finished {
                return;
            }
            match &ctx.run_id {
                Some(run_id) => relay.dispatch(run_id, &frame.payload).await,
                // Frames before the run id is known are dropped, not
                // replayed later.
                None => debug!(event = "frame_before_run_id"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::VIEWER_CHANNEL_CAPACITY;
    use tokio::sync::mpsc;

    fn frame(payload: serde_json::Value) -> StreamFrame {
        let mut decoder = FrameDecoder::new();
        let raw = format!("data: {payload}\n\n");
        let mut report = decoder.push_chunk(raw.as_bytes());
        report.frames.remove(0)
    }

    #[tokio::test]
    async fn started_frame_registers_run_and_acks_manual_caller() {
        let relay = RelayTable::new();
        let mut ctx = RunContext::new();
        let (ack_tx, ack_rx) = oneshot::channel();
        let mut ack = Some(ack_tx);

        route_frame(
            &relay,
            &mut ctx,
            &mut ack,
            frame(json!({"event": "workflow_started", "workflow_run_id": "r1", "task_id": "t1"})),
        )
        .await;

        assert!(relay.run_exists("r1").await);
        assert_eq!(ctx.run_id.as_deref(), Some("r1"));
        let ack = ack_rx.await.unwrap().unwrap();
        assert_eq!(
            ack,
            StartAck {
                workflow_run_id: "r1".to_string(),
                task_id: "t1".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn frames_after_start_reach_attached_viewers_verbatim() {
        let relay = RelayTable::new();
        let mut ctx = RunContext::new();
        let mut ack = None;

        route_frame(
            &relay,
            &mut ctx,
            &mut ack,
            frame(json!({"event": "workflow_started", "workflow_run_id": "r1", "task_id": "t1"})),
        )
        .await;

        let (tx, mut rx) = mpsc::channel(VIEWER_CHANNEL_CAPACITY);
        relay.attach("r1", tx).await.unwrap();

        let payload = json!({"event": "node_finished", "data": {"outputs": {"answer": "42"}}});
        route_frame(&relay, &mut ctx, &mut ack, frame(payload.clone())).await;
        assert_eq!(rx.recv().await.unwrap(), payload);
    }

    #[tokio::test]
    async fn finished_frame_fans_out_terminal_and_removes_session() {
        let relay = RelayTable::new();
        let mut ctx = RunContext::new();
        let mut ack = None;

        route_frame(
            &relay,
            &mut ctx,
            &mut ack,
            frame(json!({"event": "workflow_started", "workflow_run_id": "r1", "task_id": "t1"})),
        )
        .await;
        let (tx, mut rx) = mpsc::channel(VIEWER_CHANNEL_CAPACITY);
        relay.attach("r1", tx).await.unwrap();

        let terminal = json!({"event": "workflow_finished", "data": {"status": "succeeded", "elapsed_time": 2.5}});
        route_frame(&relay, &mut ctx, &mut ack, frame(terminal.clone())).await;

        assert!(ctx.finished);
        assert_eq!(rx.recv().await.unwrap(), terminal);
        assert!(rx.recv().await.is_none());
        assert!(!relay.run_exists("r1").await);
    }

    #[tokio::test]
    async fn frames_before_run_id_are_dropped() {
        let relay = RelayTable::new();
        let mut ctx = RunContext::new();
        let mut ack = None;

        route_frame(
            &relay,
            &mut ctx,
            &mut ack,
            frame(json!({"event": "node_started"})),
        )
        .await;
        assert_eq!(relay.run_count().await, 0);
        assert!(ctx.run_id.is_none());
    }

    #[tokio::test]
    async fn frames_after_terminal_event_are_ignored() {
        let relay = RelayTable::new();
        let mut ctx = RunContext::new();
        let mut ack = None;

        route_frame(
            &relay,
            &mut ctx,
            &mut ack,
            frame(json!({"event": "workflow_started", "workflow_run_id": "r1", "task_id": "t1"})),
        )
        .await;
        route_frame(
            &relay,
            &mut ctx,
            &mut ack,
            frame(json!({"event": "workflow_finished", "data": {"status": "succeeded"}})),
        )
        .await;
        route_frame(
            &relay,
            &mut ctx,
            &mut ack,
            frame(json!({"event": "tts_message_end"})),
        )
        .await;
        assert_eq!(relay.run_count().await, 0);
    }
}
