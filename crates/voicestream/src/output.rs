//! Audio output seam: an output clock plus a sink that accepts segments at
//! absolute clock times.

use crate::types::SharedAudioData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

/// Destination for scheduled audio.
///
/// The clock returned by [`AudioOutput::now`] advances in real time while the
/// output is not suspended and stands still while it is.
pub trait AudioOutput: Send {
    /// Current output clock time in seconds
    fn now(&self) -> f64;

    /// Queue `audio` to begin at clock time `start_at`
    fn schedule(&mut self, audio: &SharedAudioData, start_at: f64);

    /// Suspend the clock and everything queued behind it
    fn suspend(&mut self);

    fn resume(&mut self);

    /// Drop every queued segment and silence output immediately
    fn halt(&mut self);

    fn is_suspended(&self) -> bool;
}

/// Suspendable wall clock
#[derive(Debug, Clone)]
pub struct OutputClock {
    origin: Instant,
    suspended_at: Option<Instant>,
    suspended_total: f64,
}

impl OutputClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            suspended_at: None,
            suspended_total: 0.0,
        }
    }

    pub fn now(&self) -> f64 {
        let reference = self.suspended_at.unwrap_or_else(Instant::now);
        reference.duration_since(self.origin).as_secs_f64() - self.suspended_total
    }

    pub fn suspend(&mut self) {
        if self.suspended_at.is_none() {
            self.suspended_at = Some(Instant::now());
        }
    }

    pub fn resume(&mut self) {
        if let Some(at) = self.suspended_at.take() {
            self.suspended_total += at.elapsed().as_secs_f64();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended_at.is_some()
    }
}

impl Default for OutputClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Output that keeps time but renders nothing; used headless and with `--no-play`
#[derive(Debug, Default)]
pub struct SilentOutput {
    clock: OutputClock,
}

impl SilentOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioOutput for SilentOutput {
    fn now(&self) -> f64 {
        self.clock.now()
    }

    fn schedule(&mut self, _audio: &SharedAudioData, _start_at: f64) {}

    fn suspend(&mut self) {
        self.clock.suspend();
    }

    fn resume(&mut self) {
        self.clock.resume();
    }

    fn halt(&mut self) {}

    fn is_suspended(&self) -> bool {
        self.clock.is_suspended()
    }
}

/// A segment recorded by [`VirtualOutput`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordedSegment {
    pub start: f64,
    pub duration: f64,
    pub frames: usize,
}

impl RecordedSegment {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

#[derive(Debug, Default)]
struct VirtualState {
    clock: f64,
    suspended: bool,
    freeze_on_suspend: bool,
    segments: Vec<RecordedSegment>,
    halts: usize,
}

/// Output driven by a manually advanced clock.
///
/// Every call is recorded so tests can inspect the produced timeline through a
/// [`VirtualClock`] handle.
#[derive(Debug)]
pub struct VirtualOutput {
    state: Arc<Mutex<VirtualState>>,
}

/// Control handle for a [`VirtualOutput`]
#[derive(Debug, Clone)]
pub struct VirtualClock {
    state: Arc<Mutex<VirtualState>>,
}

fn lock(state: &Mutex<VirtualState>) -> MutexGuard<'_, VirtualState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl VirtualOutput {
    pub fn new() -> (Self, VirtualClock) {
        let state = Arc::new(Mutex::new(VirtualState {
            freeze_on_suspend: true,
            ..Default::default()
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            VirtualClock { state },
        )
    }

    /// Output whose clock keeps running while suspended
    pub fn free_running() -> (Self, VirtualClock) {
        let (output, clock) = Self::new();
        lock(&clock.state).freeze_on_suspend = false;
        (output, clock)
    }
}

impl VirtualClock {
    /// Advance the clock; a no-op while a freezing output is suspended
    pub fn advance(&self, secs: f64) {
        let mut state = lock(&self.state);
        if state.suspended && state.freeze_on_suspend {
            return;
        }
        state.clock += secs;
    }

    pub fn now(&self) -> f64 {
        lock(&self.state).clock
    }

    pub fn segments(&self) -> Vec<RecordedSegment> {
        lock(&self.state).segments.clone()
    }

    pub fn halts(&self) -> usize {
        lock(&self.state).halts
    }

    pub fn is_suspended(&self) -> bool {
        lock(&self.state).suspended
    }
}

impl AudioOutput for VirtualOutput {
    fn now(&self) -> f64 {
        lock(&self.state).clock
    }

    fn schedule(&mut self, audio: &SharedAudioData, start_at: f64) {
        lock(&self.state).segments.push(RecordedSegment {
            start: start_at,
            duration: audio.duration_secs(),
            frames: audio.frames(),
        });
    }

    fn suspend(&mut self) {
        lock(&self.state).suspended = true;
    }

    fn resume(&mut self) {
        lock(&self.state).suspended = false;
    }

    fn halt(&mut self) {
        let mut state = lock(&self.state);
        state.segments.clear();
        state.halts += 1;
    }

    fn is_suspended(&self) -> bool {
        lock(&self.state).suspended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AudioData;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn clock_stands_still_while_suspended() {
        let mut clock = OutputClock::new();
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!((clock.now() - 0.5).abs() < 1e-6);

        clock.suspend();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!((clock.now() - 0.5).abs() < 1e-6);

        clock.resume();
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!((clock.now() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn virtual_output_records_segments() {
        let (mut output, clock) = VirtualOutput::new();
        let audio = Arc::new(AudioData::new(vec![0.0; 2_400], 1, 24_000));
        output.schedule(&audio, 0.0);
        output.schedule(&audio, 0.1);
        let segments = clock.segments();
        assert_eq!(segments.len(), 2);
        assert!((segments[0].end() - segments[1].start).abs() < 1e-12);

        output.halt();
        assert!(clock.segments().is_empty());
        assert_eq!(clock.halts(), 1);
    }

    #[test]
    fn virtual_clock_freezes_on_suspend() {
        let (mut output, clock) = VirtualOutput::new();
        clock.advance(1.0);
        output.suspend();
        clock.advance(5.0);
        assert_eq!(output.now(), 1.0);
        output.resume();
        clock.advance(0.5);
        assert_eq!(output.now(), 1.5);
    }

    #[test]
    fn free_running_clock_ignores_suspend() {
        let (mut output, clock) = VirtualOutput::free_running();
        output.suspend();
        clock.advance(2.0);
        assert_eq!(output.now(), 2.0);
    }
}
