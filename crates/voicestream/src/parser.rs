//! Incremental event-stream parsing.
//!
//! Network reads do not line up with event boundaries. [`EventStreamParser`]
//! keeps the trailing partial line (and any split UTF-8 sequence) between
//! fragments and only decodes complete lines.

use crate::config::EngineConfig;
use crate::error::{ParseError, StreamError, StreamResult};
use crate::protocol::{DEFAULT_EVENT_PREFIX, StreamEvent, decode_event};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use futures::stream;
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_BUFFER_BYTES: usize = 8 * 1024;

/// Counters kept by the parser for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserStats {
    /// Complete lines seen
    pub lines: usize,
    /// Events emitted
    pub events: usize,
    /// Lines whose JSON ended early (swallowed)
    pub incomplete: usize,
    /// Lines rejected for any other reason (logged)
    pub malformed: usize,
    /// Bytes thrown away: oversized partial lines and leftovers at end of stream
    pub discarded_bytes: usize,
}

/// Line-buffering state machine that turns raw fragments into [`StreamEvent`]s
#[derive(Debug)]
pub struct EventStreamParser {
    prefix: String,
    max_line_bytes: usize,
    pending: String,
    utf8_tail: Vec<u8>,
    terminated: bool,
    stats: ParserStats,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_EVENT_PREFIX, usize::MAX)
    }

    pub fn with_config(config: &EngineConfig) -> Self {
        Self::with_prefix(&config.event_prefix, config.max_line_bytes)
    }

    pub fn with_prefix(prefix: &str, max_line_bytes: usize) -> Self {
        Self {
            prefix: prefix.to_string(),
            max_line_bytes,
            pending: String::new(),
            utf8_tail: Vec::new(),
            terminated: false,
            stats: ParserStats::default(),
        }
    }

    /// Feed one raw fragment, returning every event completed by it.
    ///
    /// Once a `done` or `error` event has been emitted the parser is
    /// terminated and ignores further input.
    pub fn push(&mut self, fragment: &[u8]) -> Vec<StreamEvent> {
        if self.terminated {
            return Vec::new();
        }
        let text = self.decode_utf8(fragment);
        self.push_text(&text)
    }

    /// Feed an already-decoded text fragment
    pub fn push_str(&mut self, fragment: &str) -> Vec<StreamEvent> {
        if self.terminated {
            return Vec::new();
        }
        self.push_text(fragment)
    }

    /// End of input: any buffered partial line is discarded.
    ///
    /// Returns the number of bytes thrown away.
    pub fn finish(&mut self) -> usize {
        let discarded = self.pending.len() + self.utf8_tail.len();
        if discarded > 0 {
            log::debug!("Discarding {discarded} buffered bytes at end of stream");
        }
        self.stats.discarded_bytes += discarded;
        self.pending.clear();
        self.utf8_tail.clear();
        discarded
    }

    /// Forget all buffered state so the parser can serve a new session
    pub fn reset(&mut self) {
        self.pending.clear();
        self.utf8_tail.clear();
        self.terminated = false;
        self.stats = ParserStats::default();
    }

    /// Text received after the last newline
    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    fn push_text(&mut self, text: &str) -> Vec<StreamEvent> {
        self.pending.push_str(text);

        let mut events = Vec::new();
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            self.stats.lines += 1;
            if let Some(event) = self.parse_line(line.trim_end_matches(['\n', '\r'])) {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    self.terminated = true;
                    self.pending.clear();
                    self.utf8_tail.clear();
                    break;
                }
            }
        }

        if self.pending.len() > self.max_line_bytes {
            log::warn!(
                "Partial event line exceeded {} bytes, discarding it",
                self.max_line_bytes
            );
            self.stats.discarded_bytes += self.pending.len();
            self.pending.clear();
        }

        self.stats.events += events.len();
        events
    }

    fn parse_line(&mut self, line: &str) -> Option<StreamEvent> {
        let payload = line.strip_prefix(self.prefix.as_str())?;
        match decode_event(payload) {
            Ok(event) => Some(event),
            Err(ParseError::Incomplete) => {
                self.stats.incomplete += 1;
                None
            }
            Err(err) => {
                self.stats.malformed += 1;
                log::warn!("Skipping malformed event line: {err}");
                None
            }
        }
    }

    /// Decode as much of `fragment` as forms complete UTF-8, keeping a split
    /// multi-byte sequence for the next read. Invalid bytes become U+FFFD.
    fn decode_utf8(&mut self, fragment: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.utf8_tail);
        bytes.extend_from_slice(fragment);

        let mut text = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.utf8_tail = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        text
    }
}

impl Default for EventStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

/// One read from a [`ByteSource`]
#[derive(Debug, Clone, Default)]
pub struct SourceRead {
    pub bytes: Bytes,
    /// No more reads will follow
    pub is_final: bool,
}

impl SourceRead {
    pub fn data(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            is_final: false,
        }
    }

    pub fn end() -> Self {
        Self {
            bytes: Bytes::new(),
            is_final: true,
        }
    }
}

/// Incremental producer of raw stream bytes (the transport seam)
#[async_trait]
pub trait ByteSource: Send {
    /// Read the next fragment; repeat until `is_final`
    async fn read(&mut self) -> StreamResult<SourceRead>;
}

/// In-memory byte source, mainly for tests and replaying captured streams
#[derive(Debug, Default)]
pub struct MemorySource {
    fragments: VecDeque<Bytes>,
    failure: Option<String>,
}

impl MemorySource {
    pub fn new<I, B>(fragments: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            failure: None,
        }
    }

    /// Split `text` into fragments of at most `size` bytes, ignoring UTF-8 boundaries
    pub fn chunked(text: &str, size: usize) -> Self {
        let size = size.max(1);
        Self::new(
            text.as_bytes()
                .chunks(size)
                .map(Bytes::copy_from_slice)
                .collect::<Vec<_>>(),
        )
    }

    /// Fail with a transport error once the fragments run out
    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn read(&mut self) -> StreamResult<SourceRead> {
        if let Some(bytes) = self.fragments.pop_front() {
            return Ok(SourceRead::data(bytes));
        }
        match self.failure.take() {
            Some(message) => Err(StreamError::Transport(message)),
            None => Ok(SourceRead::end()),
        }
    }
}

/// Byte source over any async reader (files, pipes, sockets)
pub struct ReaderSource<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin + Send> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: vec![0; READ_BUFFER_BYTES],
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ByteSource for ReaderSource<R> {
    async fn read(&mut self) -> StreamResult<SourceRead> {
        let n = self
            .reader
            .read(&mut self.buffer)
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))?;
        if n == 0 {
            return Ok(SourceRead::end());
        }
        Ok(SourceRead::data(Bytes::copy_from_slice(&self.buffer[..n])))
    }
}

struct EventStreamState<S> {
    source: S,
    parser: EventStreamParser,
    ready: VecDeque<StreamEvent>,
    exhausted: bool,
}

/// Lazily read `source` through `parser`, yielding typed events.
///
/// The stream ends after a terminal event, at end of input, or right after
/// yielding a transport error.
pub fn event_stream<S>(
    source: S,
    parser: EventStreamParser,
) -> impl Stream<Item = StreamResult<StreamEvent>> + Send
where
    S: ByteSource + 'static,
{
    let state = EventStreamState {
        source,
        parser,
        ready: VecDeque::new(),
        exhausted: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(event), state));
            }
            if state.exhausted || state.parser.is_terminated() {
                return None;
            }
            match state.source.read().await {
                Ok(read) => {
                    let events = state.parser.push(&read.bytes);
                    state.ready.extend(events);
                    if read.is_final {
                        state.parser.finish();
                        state.exhausted = true;
                    }
                }
                Err(err) => {
                    state.exhausted = true;
                    return Some((Err(err), state));
                }
            }
        }
    })
}
