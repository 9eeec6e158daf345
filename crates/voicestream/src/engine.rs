//! The playback engine: one live session at a time, fed by an event stream.
//!
//! [`PlaybackEngine::run`] drives the read loop. Chunk decodes run
//! concurrently (bounded by `decode_concurrency`) but complete through an
//! in-order buffer, so scheduling, retention and concatenation all follow
//! arrival order. Every state update is tagged with the session it belongs
//! to; completions from a stopped or replaced session are discarded.

use crate::assembler::{Assembler, CombinedArtifact};
use crate::config::EngineConfig;
use crate::decoder::{ChunkDecoder, WavChunkDecoder};
use crate::error::{DecodeError, DecodeResult, StreamError, StreamResult};
use crate::metrics::{FinalMetrics, MetricsReporter, ProgressSnapshot};
use crate::output::AudioOutput;
use crate::parser::{ByteSource, EventStreamParser, event_stream};
use crate::protocol::StreamEvent;
use crate::scheduler::{PlaybackScheduler, PlaybackState};
use crate::session::{SessionId, SessionStatus, StreamSession};
use crate::ticker::ProgressTicker;
use crate::types::{AudioData, DecodedChunk, EncodedChunk};
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, watch};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications published by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Started {
        session: SessionId,
    },
    ChunkScheduled {
        session: SessionId,
        index: u32,
        start: f64,
        duration: f64,
    },
    /// A chunk failed to decode and was skipped; the session continues
    ChunkDropped {
        session: SessionId,
        index: u32,
        reason: String,
    },
    Finalized {
        session: SessionId,
        metrics: FinalMetrics,
    },
    /// The session ended in failure. Sent at most once per session.
    Failed {
        session: SessionId,
        message: String,
    },
}

/// Result of a session that reached `done`
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session: SessionId,
    pub artifact: Arc<CombinedArtifact>,
    pub metrics: FinalMetrics,
    /// Chunk texts joined in order
    pub transcript: String,
}

enum Step {
    Event(StreamEvent),
    Chunk {
        index: u32,
        result: DecodeResult<AudioData>,
    },
    Failed(StreamError),
}

struct EngineInner {
    session: Option<StreamSession>,
    scheduler: PlaybackScheduler,
    assembler: Assembler,
    artifact: Option<Arc<CombinedArtifact>>,
    ticker: Option<ProgressTicker>,
}

impl EngineInner {
    /// The session, if it is still `id` and still accepting updates
    fn live_session(&mut self, id: SessionId) -> Option<&mut StreamSession> {
        self.session
            .as_mut()
            .filter(|s| s.id() == id && !s.status().is_terminal())
    }

    fn cancel_ticker(&mut self) {
        if let Some(mut ticker) = self.ticker.take() {
            ticker.cancel();
        }
    }
}

struct EngineShared {
    config: EngineConfig,
    decoder: Arc<dyn ChunkDecoder>,
    reporter: MetricsReporter,
    inner: Mutex<EngineInner>,
    events: broadcast::Sender<EngineEvent>,
    progress: watch::Sender<ProgressSnapshot>,
    /// Bumped on every `start` and `stop`; a running read loop aborts when it changes
    generation: watch::Sender<u64>,
}

impl EngineShared {
    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot_of(&self, inner: &EngineInner) -> ProgressSnapshot {
        self.reporter
            .snapshot(inner.session.as_ref(), &inner.scheduler, &inner.assembler)
    }

    fn publish(&self, inner: &EngineInner) {
        self.progress.send_replace(self.snapshot_of(inner));
    }

    fn notify(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Record a session-terminal failure. Notifies only the first time.
    fn fail_locked(&self, inner: &mut EngineInner, id: SessionId, error: &StreamError) {
        let Some(session) = inner.live_session(id) else {
            return;
        };
        session.set_status(SessionStatus::Aborted);
        log::error!("Session {} failed: {}", id, error);

        inner.cancel_ticker();
        if self.config.stop_on_error {
            inner.scheduler.stop();
        } else {
            inner.scheduler.mark_stream_complete();
        }
        inner.assembler.clear();
        self.publish(inner);
        self.notify(EngineEvent::Failed {
            session: id,
            message: error.to_string(),
        });
    }

    fn fail(&self, id: SessionId, error: StreamError) -> StreamError {
        let mut inner = self.lock();
        self.fail_locked(&mut inner, id, &error);
        error
    }

    fn on_chunk_arrival(&self, id: SessionId, index: u32, text: Option<&str>) {
        let mut inner = self.lock();
        if let Some(session) = inner.live_session(id) {
            session.on_chunk_received(index, text);
        }
    }

    fn on_start(&self, id: SessionId, total_chunks: u32) {
        let mut inner = self.lock();
        if let Some(session) = inner.live_session(id) {
            log::info!("Session {} expects {} chunk(s)", id, total_chunks);
            session.on_start(total_chunks);
        }
        self.publish(&inner);
    }

    fn accept_chunk(&self, id: SessionId, index: u32, result: DecodeResult<AudioData>) {
        let mut inner = self.lock();
        if inner.live_session(id).is_none() {
            log::debug!("Discarding chunk {} from inactive session {}", index, id);
            return;
        }

        let result = result.and_then(|audio| {
            inner.assembler.accepts(&audio)?;
            Ok(DecodedChunk::new(index, audio))
        });

        match result {
            Ok(chunk) => {
                if let Err(err) = inner.assembler.retain(index, Arc::clone(&chunk.audio)) {
                    self.drop_chunk(&mut inner, id, index, err);
                    return;
                }
                let segment = inner.scheduler.enqueue(index, &chunk.audio);
                if let Some(session) = inner.live_session(id) {
                    session.record_decoded(segment.duration, chunk.sample_rate(), chunk.channels());
                }
                self.publish(&inner);
                self.notify(EngineEvent::ChunkScheduled {
                    session: id,
                    index,
                    start: segment.start,
                    duration: segment.duration,
                });
            }
            Err(err) => self.drop_chunk(&mut inner, id, index, err),
        }
    }

    fn drop_chunk(&self, inner: &mut EngineInner, id: SessionId, index: u32, err: DecodeError) {
        log::error!("Dropping chunk {} of session {}: {}", index, id, err);
        if let Some(session) = inner.live_session(id) {
            session.record_dropped();
        }
        self.notify(EngineEvent::ChunkDropped {
            session: id,
            index,
            reason: err.to_string(),
        });
    }

    fn finalize(&self, id: SessionId) -> StreamResult<SessionOutcome> {
        let mut inner = self.lock();
        match inner.live_session(id) {
            Some(session) => session.set_status(SessionStatus::Finalizing),
            None => return Err(StreamError::Aborted),
        }
        inner.scheduler.mark_stream_complete();

        let artifact = match inner
            .assembler
            .finalize()
            .and_then(CombinedArtifact::encode)
        {
            Ok(artifact) => Arc::new(artifact),
            Err(err) => {
                self.fail_locked(&mut inner, id, &err);
                return Err(err);
            }
        };

        let Some(session) = inner.live_session(id) else {
            return Err(StreamError::Aborted);
        };
        session.set_status(SessionStatus::Completed);
        let metrics =
            self.reporter
                .final_metrics(session, artifact.duration_secs(), artifact.chunk_count());
        let transcript = session.transcript();

        inner.artifact = Some(Arc::clone(&artifact));
        if matches!(
            inner.scheduler.refresh(),
            PlaybackState::Finished | PlaybackState::Idle
        ) {
            inner.cancel_ticker();
        }
        self.publish(&inner);

        log::info!("Session {} finalized: {}", id, metrics);
        self.notify(EngineEvent::Finalized {
            session: id,
            metrics: metrics.clone(),
        });

        Ok(SessionOutcome {
            session: id,
            artifact,
            metrics,
            transcript,
        })
    }

    /// One progress tick; returns whether the ticker should keep running
    fn tick(&self) -> bool {
        let mut inner = self.lock();
        let state = inner.scheduler.refresh();
        self.publish(&inner);

        let session_done = inner
            .session
            .as_ref()
            .is_none_or(|s| s.status().is_terminal());
        !(session_done && matches!(state, PlaybackState::Finished | PlaybackState::Idle))
    }
}

/// Watches the engine generation on behalf of one session
struct SessionGuard {
    generation: watch::Receiver<u64>,
    written: u64,
}

impl SessionGuard {
    /// Still the session this guard was opened for
    fn is_current(&mut self) -> bool {
        *self.generation.borrow_and_update() == self.written
    }

    /// Resolves once the session has been stopped or replaced
    async fn superseded(&mut self) {
        while self.is_current() {
            if self.generation.changed().await.is_err() {
                return;
            }
        }
    }
}

fn spawn_ticker(shared: &Arc<EngineShared>) -> Option<ProgressTicker> {
    // Without a runtime there is nothing to drive the cadence; callers poll instead.
    tokio::runtime::Handle::try_current().ok()?;
    let weak: Weak<EngineShared> = Arc::downgrade(shared);
    Some(ProgressTicker::spawn(
        shared.config.progress_interval(),
        move || weak.upgrade().is_some_and(|shared| shared.tick()),
    ))
}

/// Streaming playback engine.
///
/// Cloning yields another handle to the same engine, so transport control can
/// be issued from other tasks while [`PlaybackEngine::run`] is in progress.
#[derive(Clone)]
pub struct PlaybackEngine {
    shared: Arc<EngineShared>,
}

impl PlaybackEngine {
    /// Engine decoding WAV chunks
    pub fn new(config: EngineConfig, output: Box<dyn AudioOutput>) -> StreamResult<Self> {
        Self::with_decoder(config, output, Arc::new(WavChunkDecoder::new()))
    }

    pub fn with_decoder(
        config: EngineConfig,
        output: Box<dyn AudioOutput>,
        decoder: Arc<dyn ChunkDecoder>,
    ) -> StreamResult<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (progress, _) = watch::channel(ProgressSnapshot::idle());
        let (generation, _) = watch::channel(0u64);

        let assembler = new_assembler(&config);
        Ok(Self {
            shared: Arc::new(EngineShared {
                config,
                decoder,
                reporter: MetricsReporter::new(),
                inner: Mutex::new(EngineInner {
                    session: None,
                    scheduler: PlaybackScheduler::new(output),
                    assembler,
                    artifact: None,
                    ticker: None,
                }),
                events,
                progress,
                generation,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Begin a new session, tearing down any previous one first
    pub fn start(&self) -> SessionId {
        self.start_session().0
    }

    /// Subscribe to the generation, then start; a stop issued at any point
    /// after this returns is seen by the guard.
    fn open_session(&self) -> (SessionId, SessionGuard) {
        let generation = self.shared.generation.subscribe();
        let (id, written) = self.start_session();
        (id, SessionGuard { generation, written })
    }

    fn start_session(&self) -> (SessionId, u64) {
        let shared = &self.shared;
        let mut inner = shared.lock();

        inner.cancel_ticker();
        inner.scheduler.stop();
        inner.assembler = new_assembler(&shared.config);
        inner.artifact = None;
        let mut written = 0;
        shared.generation.send_modify(|generation| {
            *generation += 1;
            written = *generation;
        });

        let mut session = StreamSession::new();
        session.set_status(SessionStatus::Streaming);
        let id = session.id();
        inner.session = Some(session);
        inner.ticker = spawn_ticker(shared);

        shared.publish(&inner);
        log::info!("Session {} started", id);
        shared.notify(EngineEvent::Started { session: id });
        (id, written)
    }

    /// Start a session and feed it from `source` until `done`, an error, or `stop()`
    pub async fn run<S>(&self, source: S) -> StreamResult<SessionOutcome>
    where
        S: ByteSource + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let (id, mut guard) = self.open_session();

        let parser = EventStreamParser::with_config(&shared.config);
        let arrivals = Arc::clone(&shared);
        let steps = event_stream(source, parser)
            .map(move |item| {
                let decoder = Arc::clone(&arrivals.decoder);
                let chunk = match item {
                    Ok(StreamEvent::Chunk(chunk)) => {
                        arrivals.on_chunk_arrival(id, chunk.chunk_index, chunk.text.as_deref());
                        Ok(chunk)
                    }
                    Ok(event) => Err(Step::Event(event)),
                    Err(err) => Err(Step::Failed(err)),
                };
                async move {
                    match chunk {
                        Ok(chunk) => {
                            let result = match EncodedChunk::from_event(&chunk) {
                                Ok(encoded) => decoder.decode(&encoded).await,
                                Err(err) => Err(err),
                            };
                            Step::Chunk {
                                index: chunk.chunk_index,
                                result,
                            }
                        }
                        Err(step) => step,
                    }
                }
            })
            .buffered(shared.config.decode_concurrency);
        futures::pin_mut!(steps);

        loop {
            let step = tokio::select! {
                step = steps.next() => step,
                _ = guard.superseded() => {
                    log::info!("Session {} aborted", id);
                    return Err(StreamError::Aborted);
                }
            };

            match step {
                Some(Step::Event(StreamEvent::Start { total_chunks, .. })) => {
                    shared.on_start(id, total_chunks);
                }
                Some(Step::Event(StreamEvent::Done { .. })) => return shared.finalize(id),
                Some(Step::Event(StreamEvent::Error { error })) => {
                    return Err(shared.fail(id, StreamError::Server(error)));
                }
                Some(Step::Event(StreamEvent::Chunk(_))) => {}
                Some(Step::Chunk { index, result }) => shared.accept_chunk(id, index, result),
                Some(Step::Failed(err)) => return Err(shared.fail(id, err)),
                None => {
                    return Err(shared.fail(
                        id,
                        StreamError::Transport("stream ended before completion".into()),
                    ));
                }
            }
        }
    }

    pub fn pause(&self) {
        let mut inner = self.shared.lock();
        let Some(session) = inner.session.as_mut() else {
            return;
        };
        if session.status() == SessionStatus::Streaming {
            session.set_status(SessionStatus::Paused);
        }
        inner.scheduler.pause();
        self.shared.publish(&inner);
    }

    pub fn resume(&self) {
        let mut inner = self.shared.lock();
        let Some(session) = inner.session.as_mut() else {
            return;
        };
        if session.status() == SessionStatus::Paused {
            session.set_status(SessionStatus::Streaming);
        }
        inner.scheduler.resume();
        self.shared.publish(&inner);
    }

    /// Flip between paused and playing
    pub fn toggle_pause(&self) {
        if self.state() == PlaybackState::Paused {
            self.resume();
        } else {
            self.pause();
        }
    }

    /// Halt output, abort the read loop and release timers. Idempotent.
    pub fn stop(&self) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if let Some(session) = inner.session.as_mut() {
            if !session.status().is_terminal() {
                log::info!("Stopping session {}", session.id());
                session.set_status(SessionStatus::Aborted);
            }
        }
        inner.cancel_ticker();
        inner.scheduler.stop();
        inner.assembler.clear();
        shared.generation.send_modify(|generation| *generation += 1);
        shared.publish(&inner);
    }

    /// Whether the progress ticker of the current session is still running
    pub fn is_ticking(&self) -> bool {
        self.shared
            .lock()
            .ticker
            .as_ref()
            .is_some_and(ProgressTicker::is_running)
    }

    /// Seconds of audio rendered so far
    pub fn position(&self) -> f64 {
        self.shared.lock().scheduler.position()
    }

    /// Decoded audio so far, in seconds
    pub fn total_duration(&self) -> f64 {
        self.shared
            .lock()
            .session
            .as_ref()
            .map_or(0.0, StreamSession::total_duration)
    }

    /// `(received, expected)`
    pub fn chunk_counts(&self) -> (u32, Option<u32>) {
        self.shared
            .lock()
            .session
            .as_ref()
            .map_or((0, None), StreamSession::counts)
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.lock().scheduler.state()
    }

    pub fn status(&self) -> SessionStatus {
        self.shared
            .lock()
            .session
            .as_ref()
            .map_or(SessionStatus::Idle, StreamSession::status)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.shared.lock().session.as_ref().map(StreamSession::id)
    }

    pub fn transcript(&self) -> String {
        self.shared
            .lock()
            .session
            .as_ref()
            .map(StreamSession::transcript)
            .unwrap_or_default()
    }

    /// Fresh progress reading (also settles finished segments)
    pub fn snapshot(&self) -> ProgressSnapshot {
        let mut inner = self.shared.lock();
        inner.scheduler.refresh();
        self.shared.snapshot_of(&inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    /// Progress readings published at the ticker cadence
    pub fn progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.shared.progress.subscribe()
    }

    /// The finished artifact of the current session
    pub fn artifact(&self) -> Option<Arc<CombinedArtifact>> {
        self.shared.lock().artifact.clone()
    }

    pub fn discard_artifact(&self) -> Option<Arc<CombinedArtifact>> {
        self.shared.lock().artifact.take()
    }

    /// Wait until everything scheduled has played out (or playback is stopped)
    pub async fn drain(&self) {
        let interval = self.shared.config.progress_interval();
        loop {
            let state = {
                let mut inner = self.shared.lock();
                let state = inner.scheduler.refresh();
                self.shared.publish(&inner);
                state
            };
            if matches!(state, PlaybackState::Finished | PlaybackState::Idle) {
                return;
            }
            tokio::time::sleep(interval).await;
        }
    }
}

impl std::fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("PlaybackEngine")
            .field("decoder", &self.shared.decoder.name())
            .field("session", &inner.session.as_ref().map(StreamSession::id))
            .field("scheduler", &inner.scheduler)
            .finish()
    }
}

fn new_assembler(config: &EngineConfig) -> Assembler {
    match config.expected_sample_rate {
        Some(rate) => Assembler::with_sample_rate(rate),
        None => Assembler::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::tests::wav_bytes;
    use crate::output::VirtualOutput;
    use crate::parser::MemorySource;
    use crate::protocol::ChunkEvent;
    use base64::Engine as _;

    fn chunk_line(index: u32, secs: f64) -> String {
        let frames = (secs * 8_000.0) as usize;
        let audio = base64::engine::general_purpose::STANDARD.encode(wav_bytes(
            &vec![0.1; frames],
            1,
            8_000,
        ));
        StreamEvent::Chunk(ChunkEvent {
            chunk_index: index,
            audio,
            sample_rate: 8_000,
            total_chunks: None,
            text: None,
        })
        .to_sse()
    }

    fn start_line(total: u32) -> String {
        StreamEvent::Start {
            total_chunks: total,
            total_chars: None,
            voice_name: None,
        }
        .to_sse()
    }

    fn done_line() -> String {
        StreamEvent::Done { total_chunks: None }.to_sse()
    }

    fn engine() -> PlaybackEngine {
        let (output, _clock) = VirtualOutput::new();
        PlaybackEngine::new(EngineConfig::default(), Box::new(output)).unwrap()
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let (output, _clock) = VirtualOutput::new();
        let config = EngineConfig::default().with_decode_concurrency(0);
        assert!(matches!(
            PlaybackEngine::new(config, Box::new(output)),
            Err(StreamError::Config(_))
        ));
    }

    #[tokio::test]
    async fn runs_a_complete_session() {
        let engine = engine();
        let mut events = engine.subscribe();
        let text = format!(
            "{}{}{}{}",
            start_line(2),
            chunk_line(0, 0.5),
            chunk_line(1, 0.25),
            done_line()
        );

        let outcome = engine.run(MemorySource::chunked(&text, 97)).await.unwrap();
        assert_eq!(outcome.artifact.chunk_count(), 2);
        assert!((outcome.metrics.total_duration - 0.75).abs() < 1e-9);
        assert_eq!(engine.status(), SessionStatus::Completed);
        assert_eq!(engine.chunk_counts(), (2, Some(2)));
        assert!(engine.artifact().is_some());

        assert!(matches!(events.recv().await, Ok(EngineEvent::Started { .. })));
        assert!(matches!(
            events.recv().await,
            Ok(EngineEvent::ChunkScheduled { index: 0, .. })
        ));
        assert!(matches!(
            events.recv().await,
            Ok(EngineEvent::ChunkScheduled { index: 1, .. })
        ));
        assert!(matches!(events.recv().await, Ok(EngineEvent::Finalized { .. })));
    }

    #[tokio::test]
    async fn premature_end_is_a_transport_failure() {
        let engine = engine();
        let text = format!("{}{}", start_line(2), chunk_line(0, 0.1));
        let result = engine.run(MemorySource::chunked(&text, 64)).await;
        assert!(matches!(result, Err(StreamError::Transport(_))));
        assert_eq!(engine.status(), SessionStatus::Aborted);
        assert_eq!(engine.state(), PlaybackState::Idle);
    }

    #[tokio::test]
    async fn stop_aborts_running_session() {
        let engine = engine();
        let source = MemorySource::new(vec![start_line(3), chunk_line(0, 0.1)]);
        let blocked = PendingSource {
            inner: source,
            drained: false,
        };

        let runner = engine.clone();
        let task = tokio::spawn(async move { runner.run(blocked).await });
        while engine.chunk_counts().0 == 0 {
            tokio::task::yield_now().await;
        }
        engine.stop();
        engine.stop();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(StreamError::Aborted)));
        assert_eq!(engine.status(), SessionStatus::Aborted);
        assert_eq!(engine.state(), PlaybackState::Idle);
        assert_eq!(engine.position(), 0.0);
    }

    #[tokio::test]
    async fn stop_right_after_start_is_not_missed() {
        let engine = engine();
        let (id, mut guard) = engine.open_session();
        assert!(guard.is_current());

        engine.stop();
        assert!(!guard.is_current());
        tokio::time::timeout(std::time::Duration::from_secs(1), guard.superseded())
            .await
            .unwrap();
        assert_eq!(engine.session_id(), Some(id));
        assert_eq!(engine.status(), SessionStatus::Aborted);
    }

    #[tokio::test]
    async fn replacing_session_supersedes_guard() {
        let engine = engine();
        let (_, mut first) = engine.open_session();
        let (_, mut second) = engine.open_session();
        assert!(!first.is_current());
        assert!(second.is_current());
    }

    #[tokio::test]
    async fn new_session_replaces_previous_state() {
        let engine = engine();
        let text = format!("{}{}{}", start_line(1), chunk_line(0, 0.2), done_line());
        let first = engine.run(MemorySource::chunked(&text, 50)).await.unwrap();

        let second_id = engine.start();
        assert_ne!(first.session, second_id);
        assert!(engine.artifact().is_none());
        assert_eq!(engine.chunk_counts(), (0, None));
        assert_eq!(engine.total_duration(), 0.0);
        assert_eq!(engine.status(), SessionStatus::Streaming);
    }

    /// Yields its fragments, then never finishes
    struct PendingSource {
        inner: MemorySource,
        drained: bool,
    }

    #[async_trait::async_trait]
    impl ByteSource for PendingSource {
        async fn read(&mut self) -> StreamResult<crate::parser::SourceRead> {
            if !self.drained {
                let read = self.inner.read().await?;
                if !read.is_final {
                    return Ok(read);
                }
                self.drained = true;
            }
            futures::future::pending().await
        }
    }
}
