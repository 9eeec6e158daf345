//! # Voicestream
//!
//! Streaming text-to-speech ingestion and playback engine.
//!
//! A generation server streams audio as independently encoded chunks inside
//! `data: <JSON>` event lines. This crate turns that stream into one continuous
//! track: it parses events across arbitrary read boundaries, decodes each chunk,
//! schedules the chunks back to back on an output clock, tracks play position
//! across pauses and, when the stream completes, reassembles every chunk into a
//! single 16-bit PCM WAV file.
//!
//! ## Architecture
//!
//! - `parser`: incremental event parsing and the `ByteSource` transport seam
//! - `decoder`: the `ChunkDecoder` seam and its WAV implementation
//! - `scheduler`: gapless scheduling, pause/resume and the position clock
//! - `assembler` / `wav`: retention, concatenation and container encoding
//! - `metrics`: progress snapshots and final metrics, derived read-only
//! - `engine`: `PlaybackEngine`, which owns one session at a time and wires it all together
//!
//! ## Features
//!
//! - `playback`: play through the default audio device (rodio)
//! - `http`: POST a generation request and stream the SSE response (reqwest)
//! - `symphonia`: decode non-WAV chunk containers
//!
//! ## Example
//!
//! ```rust,no_run
//! use voicestream::{EngineConfig, MemorySource, PlaybackEngine, SilentOutput};
//!
//! async fn replay(capture: &str) -> voicestream::StreamResult<()> {
//!     let engine = PlaybackEngine::new(EngineConfig::default(), Box::new(SilentOutput::new()))?;
//!     let outcome = engine.run(MemorySource::chunked(capture, 4096)).await?;
//!     outcome.artifact.write_to("speech.wav")?;
//!     println!("{}", outcome.metrics);
//!     Ok(())
//! }
//! ```

pub mod assembler;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod output;
pub mod parser;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod ticker;
pub mod types;
pub mod wav;

pub use assembler::{Assembler, CombinedArtifact, CombinedAudio};
pub use config::EngineConfig;
pub use decoder::{ChunkDecoder, WavChunkDecoder};
pub use engine::{EngineEvent, PlaybackEngine, SessionOutcome};
pub use error::{DecodeError, DecodeResult, ParseError, StreamError, StreamResult};
pub use metrics::{FinalMetrics, MetricsReporter, ProgressSnapshot, format_time, format_total};
pub use output::{AudioOutput, OutputClock, SilentOutput, VirtualClock, VirtualOutput};
pub use parser::{
    ByteSource, EventStreamParser, MemorySource, ReaderSource, SourceRead, event_stream,
};
pub use protocol::{ChunkEvent, StreamEvent, decode_event};
pub use scheduler::{PlaybackScheduler, PlaybackState, ScheduledSegment};
pub use session::{SessionId, SessionStatus, StreamSession};
pub use ticker::ProgressTicker;
pub use types::{AudioData, DecodedChunk, EncodedChunk, SharedAudioData};
pub use wav::{WavHeader, encode_pcm16};

#[cfg(feature = "symphonia")]
pub use decoder::SymphoniaChunkDecoder;

#[cfg(feature = "playback")]
pub mod playback;

#[cfg(feature = "http")]
pub mod http;
