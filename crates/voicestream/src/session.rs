use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Identifier of one generation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Streaming,
    Paused,
    Finalizing,
    Completed,
    Aborted,
}

impl SessionStatus {
    /// No further events are accepted
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Aborted)
    }
}

/// Bookkeeping for one generation request
#[derive(Debug, Clone)]
pub struct StreamSession {
    id: SessionId,
    status: SessionStatus,
    total_chunks_expected: Option<u32>,
    chunks_received: u32,
    chunks_decoded: u32,
    chunks_dropped: u32,
    sample_rate: Option<u32>,
    channels: Option<usize>,
    total_duration: f64,
    started_at: Instant,
    finished_at: Option<Instant>,
    texts: Vec<String>,
    next_index: u32,
}

impl StreamSession {
    pub fn new() -> Self {
        Self {
            id: SessionId::new(),
            status: SessionStatus::Idle,
            total_chunks_expected: None,
            chunks_received: 0,
            chunks_decoded: 0,
            chunks_dropped: 0,
            sample_rate: None,
            channels: None,
            total_duration: 0.0,
            started_at: Instant::now(),
            finished_at: None,
            texts: Vec::new(),
            next_index: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        if self.status.is_terminal() {
            return;
        }
        if status.is_terminal() {
            self.finished_at = Some(Instant::now());
        }
        self.status = status;
    }

    /// `start` event: declares the chunk count
    pub fn on_start(&mut self, total_chunks: u32) {
        self.total_chunks_expected = Some(total_chunks);
        if self.status == SessionStatus::Idle {
            self.status = SessionStatus::Streaming;
        }
    }

    /// A `chunk` event arrived.
    ///
    /// Arrival order is authoritative; an index other than the next expected
    /// one is only logged.
    pub fn on_chunk_received(&mut self, index: u32, text: Option<&str>) {
        if index != self.next_index {
            log::warn!(
                "Chunk index {} arrived where {} was expected; keeping arrival order",
                index,
                self.next_index
            );
        }
        self.next_index = index.saturating_add(1);
        self.chunks_received += 1;
        if let Some(text) = text.filter(|t| !t.trim().is_empty()) {
            self.texts.push(text.trim().to_string());
        }
        if self.status == SessionStatus::Idle {
            self.status = SessionStatus::Streaming;
        }
    }

    pub fn record_decoded(&mut self, duration: f64, sample_rate: u32, channels: usize) {
        self.chunks_decoded += 1;
        self.total_duration += duration;
        self.sample_rate.get_or_insert(sample_rate);
        self.channels.get_or_insert(channels);
    }

    pub fn record_dropped(&mut self) {
        self.chunks_dropped += 1;
    }

    /// Chunk texts joined in arrival order
    pub fn transcript(&self) -> String {
        self.texts.join(" ")
    }

    /// `(received, expected)`
    pub fn counts(&self) -> (u32, Option<u32>) {
        (self.chunks_received, self.total_chunks_expected)
    }

    pub fn chunks_received(&self) -> u32 {
        self.chunks_received
    }

    pub fn chunks_decoded(&self) -> u32 {
        self.chunks_decoded
    }

    pub fn chunks_dropped(&self) -> u32 {
        self.chunks_dropped
    }

    pub fn total_chunks_expected(&self) -> Option<u32> {
        self.total_chunks_expected
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    pub fn channels(&self) -> Option<usize> {
        self.channels
    }

    /// Running sum of decoded chunk durations
    pub fn total_duration(&self) -> f64 {
        self.total_duration
    }

    /// Wall time since the request started, frozen once the session ends
    pub fn elapsed(&self) -> Duration {
        match self.finished_at {
            Some(end) => end.duration_since(self.started_at),
            None => self.started_at.elapsed(),
        }
    }
}

impl Default for StreamSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_and_statuses_serialize() {
        let id = SessionId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        assert_eq!(serde_json::from_str::<SessionId>(&json).unwrap(), id);

        assert_eq!(
            serde_json::to_string(&SessionStatus::Finalizing).unwrap(),
            "\"finalizing\""
        );
        assert_eq!(
            serde_json::from_str::<SessionStatus>("\"aborted\"").unwrap(),
            SessionStatus::Aborted
        );
    }

    #[test]
    fn counts_track_events() {
        let mut session = StreamSession::new();
        assert_eq!(session.counts(), (0, None));

        session.on_start(3);
        assert_eq!(session.status(), SessionStatus::Streaming);
        session.on_chunk_received(0, Some("Hello there."));
        session.record_decoded(1.0, 24_000, 1);
        session.on_chunk_received(1, None);
        session.record_dropped();

        assert_eq!(session.counts(), (2, Some(3)));
        assert_eq!(session.chunks_decoded(), 1);
        assert_eq!(session.chunks_dropped(), 1);
        assert_eq!(session.sample_rate(), Some(24_000));
        assert!((session.total_duration() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn transcript_joins_texts_in_order() {
        let mut session = StreamSession::new();
        session.on_chunk_received(0, Some("First sentence."));
        session.on_chunk_received(1, Some("  "));
        session.on_chunk_received(2, Some("Second one. "));
        assert_eq!(session.transcript(), "First sentence. Second one.");
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut session = StreamSession::new();
        session.set_status(SessionStatus::Aborted);
        session.set_status(SessionStatus::Completed);
        assert_eq!(session.status(), SessionStatus::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_freezes_at_completion() {
        let mut session = StreamSession::new();
        tokio::time::advance(Duration::from_secs(2)).await;
        session.set_status(SessionStatus::Completed);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(session.elapsed(), Duration::from_secs(2));
    }
}
