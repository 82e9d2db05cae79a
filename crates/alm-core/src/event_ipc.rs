use crate::{Topic, WatchedFile, TOPIC_ERROR, TOPIC_SYSTEM};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
/// Output text beyond this is cut so a single line always fits in one frame.
pub const MAX_OUTPUT_TEXT_BYTES: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Change,
    Connected,
    Output,
    ReplayStart,
    ReplayEnd,
    Exit,
    Error,
}

/// Wire unit of the push channel, one NDJSON line each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub topic: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub seq: u64,
    pub stream: OutputStream,
    pub text: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Running,
    Exited,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub state: ProcessState,
    pub exit_code: Option<i32>,
}

impl ProcessStatus {
    pub const NOT_FOUND: Self = Self {
        state: ProcessState::NotFound,
        exit_code: None,
    };
}

impl EventMessage {
    pub fn new(topic: impl Into<String>, kind: EventKind, data: Value) -> Self {
        Self {
            topic: topic.into(),
            kind,
            data,
        }
    }

    pub fn connected(project_dir: &str, topics: &[String]) -> Self {
        Self::new(
            TOPIC_SYSTEM,
            EventKind::Connected,
            json!({
                "projectDir": project_dir,
                "topics": topics,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }),
        )
    }

    pub fn change(file: WatchedFile) -> Self {
        Self::new(
            file.topic(),
            EventKind::Change,
            json!({ "file": file, "timestamp": crate::now_ms() }),
        )
    }

    pub fn output(topic: &Topic, line: &OutputLine) -> Self {
        Self::new(
            topic.to_string(),
            EventKind::Output,
            json!({
                "seq": line.seq,
                "stream": line.stream,
                "text": truncate_to_boundary(&line.text, MAX_OUTPUT_TEXT_BYTES),
                "timestamp": line.timestamp,
            }),
        )
    }

    pub fn replay_start(topic: &Topic, count: usize) -> Self {
        Self::new(topic.to_string(), EventKind::ReplayStart, json!({ "count": count }))
    }

    pub fn replay_end(topic: &Topic, count: usize) -> Self {
        Self::new(topic.to_string(), EventKind::ReplayEnd, json!({ "count": count }))
    }

    pub fn exit(topic: &Topic, code: Option<i32>) -> Self {
        Self::new(topic.to_string(), EventKind::Exit, json!({ "code": code }))
    }

    /// Error scoped to a single topic, e.g. an unknown process id.
    pub fn topic_error(topic: impl Into<String>, message: &str) -> Self {
        Self::new(topic, EventKind::Error, json!({ "message": message }))
    }

    pub fn rejected_topic(raw: &str, reason: &str) -> Self {
        Self::new(
            TOPIC_ERROR,
            EventKind::Error,
            json!({ "topic": raw, "message": reason }),
        )
    }

    /// Error not tied to one topic, e.g. a watcher failure.
    pub fn channel_error(source: &str, message: &str, detail: Value) -> Self {
        Self::new(
            TOPIC_ERROR,
            EventKind::Error,
            json!({ "source": source, "message": message, "detail": detail }),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let mut encoded = serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8], max_frame_bytes: usize) -> Result<T, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Truncates `text` to at most `max_bytes`, backing off to a char boundary.
pub fn truncate_to_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
