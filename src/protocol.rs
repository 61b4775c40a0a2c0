//! Build event protocol shared by the gateway and the streaming client.
//!
//! Events travel as Server-Sent Event blocks:
//!
//! ```text
//! event: sandbox:init_complete
//! data: {"sandboxId":"sb-123","isExisting":false}
//!
//! ```
//!
//! [`BuildEvent`] is the typed form of one block. [`SseDecoder`] turns an
//! arbitrarily chunked byte stream back into events, buffering incomplete
//! blocks between reads and dropping blocks it cannot understand.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event names of the closed build vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SandboxInitStart,
    SandboxInitProgress,
    SandboxInitComplete,
    DepsInstallStart,
    DepsInstallComplete,
    AgentStart,
    AgentMessage,
    AgentComplete,
    ServerStart,
    BuildComplete,
    BuildError,
}

impl EventKind {
    /// Every kind, in protocol order, with `build:error` last.
    pub const ALL: [EventKind; 11] = [
        EventKind::SandboxInitStart,
        EventKind::SandboxInitProgress,
        EventKind::SandboxInitComplete,
        EventKind::DepsInstallStart,
        EventKind::DepsInstallComplete,
        EventKind::AgentStart,
        EventKind::AgentMessage,
        EventKind::AgentComplete,
        EventKind::ServerStart,
        EventKind::BuildComplete,
        EventKind::BuildError,
    ];

    /// Wire name, e.g. `sandbox:init_start`.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::SandboxInitStart => "sandbox:init_start",
            EventKind::SandboxInitProgress => "sandbox:init_progress",
            EventKind::SandboxInitComplete => "sandbox:init_complete",
            EventKind::DepsInstallStart => "deps:install_start",
            EventKind::DepsInstallComplete => "deps:install_complete",
            EventKind::AgentStart => "agent:start",
            EventKind::AgentMessage => "agent:message",
            EventKind::AgentComplete => "agent:complete",
            EventKind::ServerStart => "build:server_start",
            EventKind::BuildComplete => "build:complete",
            EventKind::BuildError => "build:error",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Position in the fixed progress order. `build:error` has none: it is
    /// terminal from any position.
    pub fn order(self) -> Option<usize> {
        match self {
            EventKind::BuildError => None,
            other => Self::ALL.iter().position(|kind| *kind == other),
        }
    }

    /// Whether the event ends the stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventKind::BuildComplete | EventKind::BuildError)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase marker carried by `sandbox:init_progress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Start,
    Complete,
}

/// One event of a build stream with its typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum BuildEvent {
    #[serde(rename = "sandbox:init_start", rename_all = "camelCase")]
    SandboxInitStart { sandbox_id: Option<String> },

    #[serde(rename = "sandbox:init_progress")]
    SandboxInitProgress { step: String, status: ProgressStatus },

    #[serde(rename = "sandbox:init_complete", rename_all = "camelCase")]
    SandboxInitComplete { sandbox_id: String, is_existing: bool },

    #[serde(rename = "deps:install_start")]
    DepsInstallStart {},

    #[serde(rename = "deps:install_complete")]
    DepsInstallComplete {},

    #[serde(rename = "agent:start")]
    AgentStart { prompt: String },

    /// One structured JSON line from the coding CLI, relayed verbatim.
    #[serde(rename = "agent:message")]
    AgentMessage(Value),

    #[serde(rename = "agent:complete")]
    AgentComplete { output: Option<Value> },

    #[serde(rename = "build:server_start")]
    ServerStart {},

    #[serde(rename = "build:complete", rename_all = "camelCase")]
    BuildComplete {
        sandbox_id: String,
        preview_url: String,
    },

    #[serde(rename = "build:error", rename_all = "camelCase")]
    BuildError {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sandbox_id: Option<String>,
    },
}

impl BuildEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BuildEvent::SandboxInitStart { .. } => EventKind::SandboxInitStart,
            BuildEvent::SandboxInitProgress { .. } => EventKind::SandboxInitProgress,
            BuildEvent::SandboxInitComplete { .. } => EventKind::SandboxInitComplete,
            BuildEvent::DepsInstallStart {} => EventKind::DepsInstallStart,
            BuildEvent::DepsInstallComplete {} => EventKind::DepsInstallComplete,
            BuildEvent::AgentStart { .. } => EventKind::AgentStart,
            BuildEvent::AgentMessage(_) => EventKind::AgentMessage,
            BuildEvent::AgentComplete { .. } => EventKind::AgentComplete,
            BuildEvent::ServerStart {} => EventKind::ServerStart,
            BuildEvent::BuildComplete { .. } => EventKind::BuildComplete,
            BuildEvent::BuildError { .. } => EventKind::BuildError,
        }
    }

    /// The JSON payload that goes on the `data:` line.
    pub fn data(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(mut tagged) => tagged["data"].take(),
            Err(_) => Value::Object(serde_json::Map::new()),
        }
    }

    /// Rebuild an event from its wire name and payload.
    pub fn from_parts(name: &str, data: Value) -> Result<Self, DecodeError> {
        let kind =
            EventKind::from_name(name).ok_or_else(|| DecodeError::UnknownEvent(name.to_string()))?;
        if !data.is_object() {
            return Err(DecodeError::Payload {
                event: kind.as_str(),
                reason: "payload is not a JSON object".to_string(),
            });
        }
        serde_json::from_value(serde_json::json!({ "event": name, "data": data })).map_err(|e| {
            DecodeError::Payload {
                event: kind.as_str(),
                reason: e.to_string(),
            }
        })
    }

    /// Encode as one SSE block, blank-line terminated.
    pub fn encode(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.kind(), self.data())
    }
}

/// Why a block was dropped by [`SseDecoder`]. Never fatal to the stream.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("event `{0}` has no data line")]
    MissingData(String),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected payload for `{event}`: {reason}")]
    Payload { event: &'static str, reason: String },
}

/// Incremental decoder for a build event stream.
///
/// Bytes are buffered until a blank line closes a block, so reads may split
/// blocks, lines or even UTF-8 sequences anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<BuildEvent> {
        self.buf
            .extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));

        let Some(end) = self
            .buf
            .windows(2)
            .rposition(|pair| pair == b"\n\n")
            .map(|idx| idx + 2)
        else {
            return Vec::new();
        };

        let complete: Vec<u8> = self.buf.drain(..end).collect();
        String::from_utf8_lossy(&complete)
            .split("\n\n")
            .filter_map(|block| match parse_block(block) {
                Ok(event) => event,
                Err(e) => {
                    tracing::debug!("Dropping SSE block: {e}");
                    None
                }
            })
            .collect()
    }

    /// Bytes of the trailing block that is still incomplete.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }
}

/// Parse one block. Comment-only and blank blocks decode to `None`.
fn parse_block(block: &str) -> Result<Option<BuildEvent>, DecodeError> {
    let mut name: Option<&str> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if let Some(value) = field_value(line, "event") {
            name = Some(value.trim());
        } else if let Some(value) = field_value(line, "data") {
            data_lines.push(value);
        }
    }

    let Some(name) = name.filter(|n| !n.is_empty()) else {
        return Ok(None);
    };
    if data_lines.is_empty() {
        return Err(DecodeError::MissingData(name.to_string()));
    }

    let data: Value = serde_json::from_str(data_lines.join("\n").trim())?;
    BuildEvent::from_parts(name, data).map(Some)
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_stream() -> Vec<BuildEvent> {
        vec![
            BuildEvent::SandboxInitStart { sandbox_id: None },
            BuildEvent::SandboxInitComplete {
                sandbox_id: "sb-1".into(),
                is_existing: false,
            },
            BuildEvent::AgentMessage(json!({
                "type": "assistant",
                "message": {"content": [{"type": "text", "text": "Écrit le widget 📈\n"}]}
            })),
            BuildEvent::BuildComplete {
                sandbox_id: "sb-1".into(),
                preview_url: "https://sb-1-5173.example.dev".into(),
            },
        ]
    }

    #[test]
    fn encodes_named_block() {
        let event = BuildEvent::SandboxInitComplete {
            sandbox_id: "sb-1".into(),
            is_existing: true,
        };
        assert_eq!(
            event.encode(),
            "event: sandbox:init_complete\ndata: {\"isExisting\":true,\"sandboxId\":\"sb-1\"}\n\n"
        );
    }

    #[test]
    fn empty_payload_events_encode_empty_object() {
        assert_eq!(
            BuildEvent::DepsInstallStart {}.encode(),
            "event: deps:install_start\ndata: {}\n\n"
        );
    }

    #[test]
    fn build_error_omits_missing_sandbox_id() {
        let event = BuildEvent::BuildError {
            error: "boom".into(),
            sandbox_id: None,
        };
        assert_eq!(event.data(), json!({"error": "boom"}));
    }

    #[test]
    fn init_start_keeps_null_sandbox_id() {
        let event = BuildEvent::SandboxInitStart { sandbox_id: None };
        assert_eq!(event.data(), json!({"sandboxId": null}));
    }

    #[test]
    fn decodes_what_it_encodes() {
        let events = sample_stream();
        let wire: String = events.iter().map(BuildEvent::encode).collect();
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.push(wire.as_bytes()), events);
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn two_reads_match_single_read_at_every_offset() {
        let events = sample_stream();
        let wire: String = events.iter().map(BuildEvent::encode).collect();
        let bytes = wire.as_bytes();

        for split in 0..=bytes.len() {
            let mut decoder = SseDecoder::new();
            let mut decoded = decoder.push(&bytes[..split]);
            decoded.extend(decoder.push(&bytes[split..]));
            assert_eq!(decoded, events, "split at byte {split}");
        }
    }

    #[test]
    fn keeps_incomplete_block_for_next_read() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"event: deps:install_start\ndata: {}\n\nevent: agent:st");
        assert_eq!(events, vec![BuildEvent::DepsInstallStart {}]);
        assert_eq!(decoder.pending(), b"event: agent:st");

        let events = decoder.push(b"art\ndata: {\"prompt\":\"p\"}\n\n");
        assert_eq!(
            events,
            vec![BuildEvent::AgentStart { prompt: "p".into() }]
        );
    }

    #[test]
    fn malformed_blocks_are_dropped_not_fatal() {
        let wire = concat!(
            "event: agent:message\ndata: {not json\n\n",
            "event: no:such_event\ndata: {}\n\n",
            "event: deps:install_start\n\n",
            "event: build:complete\ndata: {\"sandboxId\":\"sb\"}\n\n",
            "event: deps:install_complete\ndata: {}\n\n",
        );
        let mut decoder = SseDecoder::new();
        assert_eq!(
            decoder.push(wire.as_bytes()),
            vec![BuildEvent::DepsInstallComplete {}]
        );
    }

    #[test]
    fn ignores_comments_and_crlf() {
        let wire = ":keep-alive\r\n\r\nevent:agent:complete\r\ndata:{\"output\":null}\r\n\r\n";
        let mut decoder = SseDecoder::new();
        assert_eq!(
            decoder.push(wire.as_bytes()),
            vec![BuildEvent::AgentComplete { output: None }]
        );
    }

    #[test]
    fn ordering_excludes_build_error() {
        assert_eq!(EventKind::SandboxInitStart.order(), Some(0));
        assert_eq!(EventKind::BuildComplete.order(), Some(9));
        assert_eq!(EventKind::BuildError.order(), None);
        assert!(EventKind::DepsInstallComplete.order() < EventKind::AgentStart.order());
    }

    #[test]
    fn names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::from_name("build:unknown"), None);
    }
}
