//! Gapless playback scheduling.
//!
//! Every decoded chunk is placed on the output timeline at
//! `max(output_now, previous_end)`, so chunks play back to back with no
//! silence and no overlap no matter how decode latency jitters. The position
//! clock is derived from the same timeline and is a pure query.

use crate::output::AudioOutput;
use crate::types::SharedAudioData;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Tolerance for comparing clock times
const EPSILON: f64 = 1e-9;

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    /// Nothing scheduled yet, or stopped
    Idle,
    Playing,
    /// Queue drained while the stream is still delivering
    Buffering,
    Paused,
    /// Stream complete and every segment played out
    Finished,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Playing => "playing",
            PlaybackState::Buffering => "buffering",
            PlaybackState::Paused => "paused",
            PlaybackState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// A chunk placed on the output timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSegment {
    pub index: u32,
    /// Output clock time the segment starts at
    pub start: f64,
    pub duration: f64,
}

impl ScheduledSegment {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    state: PlaybackState,
    /// Segments scheduled but not yet fully played, in start order
    timeline: VecDeque<ScheduledSegment>,
    next_start: f64,
    played_duration: f64,
    scheduled_total: f64,
    paused_position: f64,
    paused_clock: f64,
    resume_state: PlaybackState,
    stream_complete: bool,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        Self {
            output,
            state: PlaybackState::Idle,
            timeline: VecDeque::new(),
            next_start: 0.0,
            played_duration: 0.0,
            scheduled_total: 0.0,
            paused_position: 0.0,
            paused_clock: 0.0,
            resume_state: PlaybackState::Idle,
            stream_complete: false,
        }
    }

    /// Place a decoded chunk right after the previous one
    pub fn enqueue(&mut self, index: u32, audio: &SharedAudioData) -> ScheduledSegment {
        let now = self.output.now();
        // While paused the timeline is measured against the clock at pause
        // time; `resume` shifts it by whatever the clock ran in between.
        let anchor = match self.state {
            PlaybackState::Paused => self.paused_clock,
            _ => now,
        };
        let start = anchor.max(self.next_start);
        let segment = ScheduledSegment {
            index,
            start,
            duration: audio.duration_secs(),
        };

        self.output.schedule(audio, start);
        self.next_start = segment.end();
        self.scheduled_total += segment.duration;
        self.timeline.push_back(segment);

        log::debug!(
            "Scheduled chunk {} at {:.3}s for {:.3}s (output clock {:.3}s)",
            index,
            segment.start,
            segment.duration,
            now
        );

        match self.state {
            PlaybackState::Paused => self.resume_state = PlaybackState::Playing,
            _ => self.state = PlaybackState::Playing,
        }
        segment
    }

    /// Retire fully played segments and settle the state.
    ///
    /// Cheap; call it from the progress cadence.
    pub fn refresh(&mut self) -> PlaybackState {
        if self.state == PlaybackState::Paused {
            return self.state;
        }

        let now = self.output.now();
        while let Some(front) = self.timeline.front() {
            if front.end() > now + EPSILON {
                break;
            }
            self.played_duration += front.duration;
            self.timeline.pop_front();
        }

        if self.timeline.is_empty() {
            if self.stream_complete && self.state != PlaybackState::Idle {
                self.state = PlaybackState::Finished;
            } else if self.state == PlaybackState::Playing {
                self.state = PlaybackState::Buffering;
            }
        }
        self.state
    }

    /// Seconds of audio rendered so far
    pub fn position(&self) -> f64 {
        if self.state == PlaybackState::Paused {
            return self.paused_position;
        }
        let now = self.output.now();
        let in_flight: f64 = self
            .timeline
            .iter()
            .map(|segment| (now - segment.start).clamp(0.0, segment.duration))
            .sum();
        (self.played_duration + in_flight).min(self.scheduled_total)
    }

    /// Suspend output and freeze the position. Idempotent.
    pub fn pause(&mut self) {
        match self.state {
            PlaybackState::Playing | PlaybackState::Buffering | PlaybackState::Idle => {
                self.paused_position = self.position();
                self.paused_clock = self.output.now();
                self.resume_state = self.state;
                self.state = PlaybackState::Paused;
                self.output.suspend();
            }
            PlaybackState::Paused | PlaybackState::Finished => {}
        }
    }

    /// Continue from the frozen position. Idempotent.
    pub fn resume(&mut self) {
        if self.state != PlaybackState::Paused {
            return;
        }
        self.output.resume();

        // A clock that kept running while suspended moves every pending
        // segment by the time spent paused.
        let drift = self.output.now() - self.paused_clock;
        if drift > EPSILON {
            for segment in self.timeline.iter_mut() {
                segment.start += drift;
            }
            self.next_start += drift;
        }

        self.state = if self.timeline.is_empty() {
            match self.resume_state {
                PlaybackState::Idle => PlaybackState::Idle,
                _ if self.stream_complete => PlaybackState::Finished,
                _ => PlaybackState::Buffering,
            }
        } else {
            PlaybackState::Playing
        };
        self.refresh();
    }

    /// No more chunks will be enqueued
    pub fn mark_stream_complete(&mut self) {
        self.stream_complete = true;
        self.refresh();
    }

    /// Halt output, drop the queue and return to `Idle`. Idempotent.
    pub fn stop(&mut self) {
        self.output.halt();
        if self.output.is_suspended() {
            self.output.resume();
        }
        self.timeline.clear();
        self.state = PlaybackState::Idle;
        self.resume_state = PlaybackState::Idle;
        self.next_start = 0.0;
        self.played_duration = 0.0;
        self.scheduled_total = 0.0;
        self.paused_position = 0.0;
        self.paused_clock = 0.0;
        self.stream_complete = false;
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.state == PlaybackState::Paused
    }

    pub fn is_stream_complete(&self) -> bool {
        self.stream_complete
    }

    /// Sum of all scheduled chunk durations
    pub fn total_scheduled(&self) -> f64 {
        self.scheduled_total
    }

    /// Sum of durations of segments that finished playing
    pub fn played_duration(&self) -> f64 {
        self.played_duration
    }

    /// Seconds still to be rendered
    pub fn remaining(&self) -> f64 {
        (self.scheduled_total - self.position()).max(0.0)
    }

    pub fn timeline(&self) -> impl Iterator<Item = &ScheduledSegment> {
        self.timeline.iter()
    }
}

impl std::fmt::Debug for PlaybackScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackScheduler")
            .field("state", &self.state)
            .field("queued", &self.timeline.len())
            .field("next_start", &self.next_start)
            .field("played_duration", &self.played_duration)
            .field("scheduled_total", &self.scheduled_total)
            .finish()
    }
}
