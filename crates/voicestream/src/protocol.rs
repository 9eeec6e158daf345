//! Wire events carried as `data: <JSON>` lines on the generation stream.

use crate::error::ParseError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const KNOWN_TYPES: [&str; 4] = ["start", "chunk", "done", "error"];

/// Prefix every event line carries
pub const DEFAULT_EVENT_PREFIX: &str = "data: ";

/// One typed protocol event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    /// Generation started; declares how many chunks will follow
    Start {
        total_chunks: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_chars: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        voice_name: Option<String>,
    },
    /// One encoded audio fragment
    Chunk(ChunkEvent),
    /// All chunks have been sent
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_chunks: Option<u32>,
    },
    /// Server-side failure; terminates the session
    Error { error: String },
}

/// Payload of a `chunk` event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkEvent {
    pub chunk_index: u32,
    /// Base64 encoded audio container (WAV from the reference server)
    pub audio: String,
    pub sample_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl StreamEvent {
    /// `done` and `error` end the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Start { .. } => "start",
            StreamEvent::Chunk(_) => "chunk",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// Render as a complete SSE record (`data: {...}\n\n`)
    pub fn to_sse(&self) -> String {
        // Derived serialization of these types is infallible.
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("{DEFAULT_EVENT_PREFIX}{json}\n\n")
    }
}

/// Decode the JSON body of one event line.
///
/// An object without `type` but with an `error` string is read as an `error`
/// event; some server paths emit errors in that shape.
pub fn decode_event(json: &str) -> Result<StreamEvent, ParseError> {
    let value: Value = serde_json::from_str(json).map_err(ParseError::from_json)?;

    match value.get("type").and_then(Value::as_str) {
        Some(kind) if !KNOWN_TYPES.contains(&kind) => {
            return Err(ParseError::UnknownEvent(kind.to_string()));
        }
        Some(_) => {}
        None => {
            if let Some(message) = value.get("error").and_then(Value::as_str) {
                return Ok(StreamEvent::Error {
                    error: message.to_string(),
                });
            }
        }
    }

    serde_json::from_value(value).map_err(ParseError::Json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_start() {
        let event = decode_event(r#"{"type":"start","total_chunks":3,"total_chars":1200}"#).unwrap();
        assert_eq!(
            event,
            StreamEvent::Start {
                total_chunks: 3,
                total_chars: Some(1200),
                voice_name: None,
            }
        );
    }

    #[test]
    fn decodes_chunk_with_extra_fields() {
        let event = decode_event(
            r#"{"type":"chunk","chunk_index":1,"total_chunks":3,"audio":"AAAA","sample_rate":24000,"text":"Hi."}"#,
        )
        .unwrap();
        match event {
            StreamEvent::Chunk(chunk) => {
                assert_eq!(chunk.chunk_index, 1);
                assert_eq!(chunk.sample_rate, 24_000);
                assert_eq!(chunk.total_chunks, Some(3));
                assert_eq!(chunk.text.as_deref(), Some("Hi."));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decodes_done_without_count() {
        assert_eq!(
            decode_event(r#"{"type":"done"}"#).unwrap(),
            StreamEvent::Done { total_chunks: None }
        );
    }

    #[test]
    fn untyped_error_object_is_error_event() {
        let event = decode_event(r#"{"error":"Either ref_audio_url or ref_audio_base64 must be provided"}"#)
            .unwrap();
        assert!(event.is_terminal());
        assert_eq!(event.kind(), "error");
    }

    #[test]
    fn unknown_type_is_rejected() {
        match decode_event(r#"{"type":"heartbeat"}"#) {
            Err(ParseError::UnknownEvent(kind)) => assert_eq!(kind, "heartbeat"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn missing_field_is_json_error() {
        assert!(matches!(
            decode_event(r#"{"type":"start"}"#),
            Err(ParseError::Json(_))
        ));
    }

    #[test]
    fn sse_rendering_round_trips() {
        let event = StreamEvent::Error {
            error: "boom".to_string(),
        };
        let line = event.to_sse();
        assert!(line.starts_with("data: {"));
        assert!(line.ends_with("\n\n"));
        let body = line.trim_end().strip_prefix(DEFAULT_EVENT_PREFIX).unwrap();
        assert_eq!(decode_event(body).unwrap(), event);
    }
}
