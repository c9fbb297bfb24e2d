use serde_json::Value;
use thiserror::Error;

/// Field prefix carrying the JSON payload of one stream frame.
pub const DATA_FIELD_PREFIX: &str = "data:";

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("frame payload is not valid JSON: {0}")]
    Decode(String),
    #[error("frame carries no `data:` field")]
    MissingDataField,
}

/// Lifecycle classification of one parsed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    /// The backend accepted the request and opened a run.
    Started { run_id: String, task_id: String },
    /// The run reached a terminal state.
    Finished {
        status: Option<String>,
        elapsed_time: Option<f64>,
        error: Option<String>,
    },
    /// Anything else is relayed opaquely.
    Other,
}

/// One reassembled frame: the verbatim JSON payload plus its
/// lifecycle classification.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    pub payload: Value,
    pub event: WorkflowEvent,
}

impl StreamFrame {
    fn from_payload(payload: Value) -> Self {
        let event = classify(&payload);
        Self { payload, event }
    }
}

fn classify(payload: &Value) -> WorkflowEvent {
    match payload.get("event").and_then(Value::as_str) {
        Some("workflow_started") => {
            let run_id = payload
                .get("workflow_run_id")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if run_id.is_empty() {
                return WorkflowEvent::Other;
            }
            let task_id = payload
                .get("task_id")
                .and_then(Value::as_str)
                .unwrap_or_default();
            WorkflowEvent::Started {
                run_id: run_id.to_string(),
                task_id: task_id.to_string(),
            }
        }
        Some("workflow_finished") => {
            let data = payload.get("data");
            WorkflowEvent::Finished {
                status: data
                    .and_then(|d| d.get("status"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                elapsed_time: data.and_then(|d| d.get("elapsed_time")).and_then(Value::as_f64),
                error: data
                    .and_then(|d| d.get("error"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }
        }
        _ => WorkflowEvent::Other,
    }
}

#[derive(Debug, Default)]
pub struct DecodeReport {
    pub frames: Vec<StreamFrame>,
    pub errors: Vec<FrameError>,
}

impl DecodeReport {
    fn push_frame(&mut self, frame: StreamFrame) {
        self.frames.push(frame);
    }

    fn push_error(&mut self, error: FrameError) {
        self.errors.push(error);
    }
}

/// Incremental decoder for the backend's chunked event stream. Frame
/// boundary is a blank line; bytes after the last boundary stay
/// buffered until the next chunk, so arbitrary transport
/// fragmentation is tolerated.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport {
        let mut report = DecodeReport::default();
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while let Some(boundary) = find_boundary(&self.pending) {
            let raw: Vec<u8> = self.pending.drain(..boundary + 2).collect();
            decode_raw_frame(&raw[..boundary], &mut report);
        }

        report
    }

    /// Flush any trailing partial frame once the stream has ended.
    pub fn finish(&mut self) -> DecodeReport {
        let mut report = DecodeReport::default();
        if self.pending.is_empty() {
            return report;
        }
        let final_frame = std::mem::take(&mut self.pending);
        decode_raw_frame(&final_frame, &mut report);
        report
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn find_boundary(pending: &[u8]) -> Option<usize> {
    pending.windows(2).position(|window| window == b"\n\n")
}

fn decode_raw_frame(raw: &[u8], report: &mut DecodeReport) {
    let text = String::from_utf8_lossy(raw);
    let mut data_lines: Vec<&str> = Vec::new();
    let mut saw_field = false;
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        saw_field = true;
        if let Some(rest) = line.strip_prefix(DATA_FIELD_PREFIX) {
            data_lines.push(rest.trim_start());
        }
    }

    if data_lines.is_empty() {
        // Keepalive comments and blank frames are not an error.
        if saw_field {
            report.push_error(FrameError::MissingDataField);
        }
        return;
    }

    match serde_json::from_str::<Value>(&data_lines.join("\n")) {
        Ok(payload) => report.push_frame(StreamFrame::from_payload(payload)),
        Err(err) => report.push_error(FrameError::Decode(err.to_string())),
    }
}
