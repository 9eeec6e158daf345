use thiserror::Error;

/// Malformed stream-event line.
///
/// These never leave the parser: `Incomplete` is swallowed silently, every
/// other variant is logged and the stream keeps going.
#[derive(Error, Debug)]
pub enum ParseError {
    /// JSON ended before the object was complete (line cut mid-object)
    #[error("Unexpected end of JSON input")]
    Incomplete,

    /// Any other JSON syntax or shape problem
    #[error("Invalid event JSON: {0}")]
    Json(serde_json::Error),

    /// Well-formed JSON with a `type` this engine does not know
    #[error("Unknown event type: '{0}'")]
    UnknownEvent(String),
}

impl ParseError {
    pub(crate) fn from_json(err: serde_json::Error) -> Self {
        if err.is_eof() {
            ParseError::Incomplete
        } else {
            ParseError::Json(err)
        }
    }
}

/// Failure to turn one chunk payload into PCM.
///
/// Non-fatal: the chunk is dropped and the session carries on.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Failed to read WAV payload: {0}")]
    Wav(#[from] hound::Error),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Chunk decoded to zero samples")]
    Empty,

    #[error("Sample rate mismatch: session runs at {expected} Hz, chunk is {actual} Hz")]
    SampleRateMismatch { expected: u32, actual: u32 },

    #[error("Channel mismatch: session has {expected} channel(s), chunk has {actual}")]
    ChannelMismatch { expected: usize, actual: usize },

    #[error("Codec error: {0}")]
    Codec(String),
}

/// Result type for chunk decoding
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Session-terminal failures.
///
/// Each of these ends the session and is reported exactly once.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The byte source failed or ended before `done`
    #[error("Stream transport failed: {0}")]
    Transport(String),

    /// The server sent an `error` event
    #[error("Server reported an error: {0}")]
    Server(String),

    /// `done` arrived but no chunk decoded successfully
    #[error("No audio data to assemble")]
    NoAudio,

    /// The session was stopped or replaced while streaming
    #[error("Session aborted")]
    Aborted,

    /// The combined audio could not be serialized
    #[error("Failed to encode combined audio: {0}")]
    Encode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type for session-level operations
pub type StreamResult<T> = Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_json_is_incomplete() {
        let err = serde_json::from_str::<serde_json::Value>("{\"type\": \"chu").unwrap_err();
        assert!(matches!(ParseError::from_json(err), ParseError::Incomplete));
    }

    #[test]
    fn syntax_error_is_not_incomplete() {
        let err = serde_json::from_str::<serde_json::Value>("{\"type\": ]").unwrap_err();
        assert!(matches!(ParseError::from_json(err), ParseError::Json(_)));
    }

    #[test]
    fn display_messages_are_readable() {
        let err = DecodeError::SampleRateMismatch {
            expected: 24_000,
            actual: 16_000,
        };
        assert_eq!(
            err.to_string(),
            "Sample rate mismatch: session runs at 24000 Hz, chunk is 16000 Hz"
        );
        assert_eq!(StreamError::NoAudio.to_string(), "No audio data to assemble");
    }
}
