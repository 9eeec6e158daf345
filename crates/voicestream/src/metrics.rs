//! Progress and performance reporting.
//!
//! Everything here is derived from read-only views of the session, the
//! scheduler and the assembler; nothing in this module mutates engine state.

use crate::assembler::Assembler;
use crate::scheduler::{PlaybackScheduler, PlaybackState};
use crate::session::{SessionStatus, StreamSession};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of the window the level meter averages over, in seconds
const DEFAULT_LEVEL_WINDOW: f64 = 0.05;

/// `m:ss`
pub fn format_time(seconds: f64) -> String {
    let whole = if seconds.is_finite() && seconds > 0.0 {
        seconds.floor() as u64
    } else {
        0
    };
    format!("{}:{:02}", whole / 60, whole % 60)
}

/// `m:ss`, or `--:--` while the total is unknown
pub fn format_total(seconds: f64) -> String {
    if seconds > 0.0 {
        format_time(seconds)
    } else {
        "--:--".to_string()
    }
}

/// One progress reading, produced at the ticker cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub status: SessionStatus,
    pub playback: PlaybackState,
    /// Seconds rendered so far
    pub position: f64,
    /// Decoded audio so far, in seconds
    pub total_duration: f64,
    pub received: u32,
    pub expected: Option<u32>,
    /// Wall time since the request started
    pub elapsed: f64,
    /// RMS level around the current position; zero while paused or idle
    pub level: f32,
}

impl ProgressSnapshot {
    /// Snapshot of an engine with no session
    pub fn idle() -> Self {
        Self {
            status: SessionStatus::Idle,
            playback: PlaybackState::Idle,
            position: 0.0,
            total_duration: 0.0,
            received: 0,
            expected: None,
            elapsed: 0.0,
            level: 0.0,
        }
    }

    /// Progress in percent, `None` while nothing has been decoded
    pub fn percent(&self) -> Option<f64> {
        if self.total_duration > 0.0 {
            Some((self.position / self.total_duration).min(1.0) * 100.0)
        } else {
            None
        }
    }

    fn outstanding(&self) -> bool {
        match self.expected {
            Some(expected) => self.received < expected,
            None => self.status == SessionStatus::Streaming,
        }
    }

    fn expected_text(&self) -> String {
        self.expected
            .map(|e| e.to_string())
            .unwrap_or_else(|| "?".to_string())
    }

    /// Human status line
    pub fn status_line(&self) -> String {
        match self.status {
            SessionStatus::Idle => return "Idle".to_string(),
            SessionStatus::Aborted => return "Stopped".to_string(),
            SessionStatus::Paused => return "Paused".to_string(),
            _ => {}
        }
        if self.playback == PlaybackState::Paused {
            return "Paused".to_string();
        }
        if self.playback == PlaybackState::Finished {
            return format!("Finished ({} chunks)", self.received);
        }
        if self.outstanding() {
            if self.playback == PlaybackState::Buffering {
                format!("Buffering... ({}/{})", self.received, self.expected_text())
            } else {
                format!(
                    "Streaming chunk {}/{}...",
                    self.received,
                    self.expected_text()
                )
            }
        } else {
            format!("Playing... ({} chunks)", self.received)
        }
    }

    /// `current / total` clock text
    pub fn time_text(&self) -> String {
        format!(
            "{} / {}",
            format_time(self.position),
            format_total(self.total_duration)
        )
    }

    /// Accumulated duration with chunk counts, e.g. `2.0s (2/3)`
    pub fn duration_text(&self) -> String {
        format!(
            "{:.1}s ({}/{})",
            self.total_duration,
            self.received,
            self.expected_text()
        )
    }

    /// Generation time so far, e.g. `1.4s`
    pub fn generation_text(&self) -> String {
        format!("{:.1}s", self.elapsed)
    }
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

/// Metrics reported once a session finalizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalMetrics {
    /// Wall time from request start to finalization
    pub generation_time: f64,
    /// Duration of the combined artifact
    pub total_duration: f64,
    pub chunk_count: usize,
    pub dropped: u32,
}

impl FinalMetrics {
    /// Generation time over audio duration; `None` when either is zero
    pub fn realtime_factor(&self) -> Option<f64> {
        if self.total_duration > 0.0 && self.generation_time > 0.0 {
            Some(self.generation_time / self.total_duration)
        } else {
            None
        }
    }

    pub fn generation_text(&self) -> String {
        format!("{:.2}s", self.generation_time)
    }

    pub fn duration_text(&self) -> String {
        format!("{:.1}s", self.total_duration)
    }

    pub fn rtf_text(&self) -> Option<String> {
        self.realtime_factor().map(|rtf| format!("{rtf:.2}x"))
    }
}

impl fmt::Display for FinalMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "generation {} | duration {} | chunks {}",
            self.generation_text(),
            self.duration_text(),
            self.chunk_count
        )?;
        if self.dropped > 0 {
            write!(f, " ({} dropped)", self.dropped)?;
        }
        if let Some(rtf) = self.rtf_text() {
            write!(f, " | RTF {rtf}")?;
        }
        Ok(())
    }
}

/// Builds snapshots and final metrics
#[derive(Debug, Clone, Copy)]
pub struct MetricsReporter {
    level_window: f64,
}

impl MetricsReporter {
    pub fn new() -> Self {
        Self {
            level_window: DEFAULT_LEVEL_WINDOW,
        }
    }

    pub fn with_level_window(mut self, seconds: f64) -> Self {
        self.level_window = seconds;
        self
    }

    pub fn snapshot(
        &self,
        session: Option<&StreamSession>,
        scheduler: &PlaybackScheduler,
        assembler: &Assembler,
    ) -> ProgressSnapshot {
        let Some(session) = session else {
            return ProgressSnapshot::idle();
        };

        let playback = scheduler.state();
        let position = scheduler.position();
        let level = match playback {
            PlaybackState::Playing | PlaybackState::Buffering => {
                assembler.level_at(position, self.level_window)
            }
            _ => 0.0,
        };
        let (received, expected) = session.counts();

        ProgressSnapshot {
            status: session.status(),
            playback,
            position,
            total_duration: session.total_duration(),
            received,
            expected,
            elapsed: session.elapsed().as_secs_f64(),
            level,
        }
    }

    pub fn final_metrics(
        &self,
        session: &StreamSession,
        total_duration: f64,
        chunk_count: usize,
    ) -> FinalMetrics {
        FinalMetrics {
            generation_time: session.elapsed().as_secs_f64(),
            total_duration,
            chunk_count,
            dropped: session.chunks_dropped(),
        }
    }
}

impl Default for MetricsReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::VirtualOutput;
    use crate::types::AudioData;
    use std::sync::Arc;

    fn snapshot(received: u32, expected: Option<u32>, playback: PlaybackState) -> ProgressSnapshot {
        ProgressSnapshot {
            status: SessionStatus::Streaming,
            playback,
            position: 1.0,
            total_duration: 2.0,
            received,
            expected,
            elapsed: 1.23,
            level: 0.0,
        }
    }

    #[test]
    fn formats_times() {
        assert_eq!(format_time(0.0), "0:00");
        assert_eq!(format_time(9.99), "0:09");
        assert_eq!(format_time(75.4), "1:15");
        assert_eq!(format_time(-3.0), "0:00");
        assert_eq!(format_total(0.0), "--:--");
        assert_eq!(format_total(61.0), "1:01");
    }

    #[test]
    fn status_lines() {
        assert_eq!(
            snapshot(1, Some(3), PlaybackState::Playing).status_line(),
            "Streaming chunk 1/3..."
        );
        assert_eq!(
            snapshot(1, Some(3), PlaybackState::Buffering).status_line(),
            "Buffering... (1/3)"
        );
        assert_eq!(
            snapshot(3, Some(3), PlaybackState::Playing).status_line(),
            "Playing... (3 chunks)"
        );
        assert_eq!(
            snapshot(1, Some(3), PlaybackState::Paused).status_line(),
            "Paused"
        );
        assert_eq!(
            snapshot(2, None, PlaybackState::Playing).status_line(),
            "Streaming chunk 2/?..."
        );
    }

    #[test]
    fn percent_and_texts() {
        let snap = snapshot(2, Some(3), PlaybackState::Playing);
        assert_eq!(snap.percent(), Some(50.0));
        assert_eq!(snap.duration_text(), "2.0s (2/3)");
        assert_eq!(snap.generation_text(), "1.2s");
        assert_eq!(snap.time_text(), "0:01 / 0:02");
        assert_eq!(ProgressSnapshot::idle().percent(), None);
    }

    #[test]
    fn realtime_factor_needs_duration() {
        let metrics = FinalMetrics {
            generation_time: 1.5,
            total_duration: 3.0,
            chunk_count: 3,
            dropped: 0,
        };
        assert_eq!(metrics.realtime_factor(), Some(0.5));
        assert_eq!(metrics.rtf_text().as_deref(), Some("0.50x"));
        assert_eq!(
            metrics.to_string(),
            "generation 1.50s | duration 3.0s | chunks 3 | RTF 0.50x"
        );

        let silent = FinalMetrics {
            total_duration: 0.0,
            ..metrics
        };
        assert_eq!(silent.realtime_factor(), None);
        assert!(!silent.to_string().contains("RTF"));
    }

    #[test]
    fn reporter_reads_without_mutating() {
        let (output, clock) = VirtualOutput::new();
        let mut scheduler = PlaybackScheduler::new(Box::new(output));
        let mut assembler = Assembler::new();
        let mut session = StreamSession::new();
        let reporter = MetricsReporter::new();

        assert_eq!(
            reporter.snapshot(None, &scheduler, &assembler),
            ProgressSnapshot::idle()
        );

        session.on_start(2);
        session.on_chunk_received(0, None);
        let audio = Arc::new(AudioData::new(vec![0.5; 1_000], 1, 1_000));
        session.record_decoded(audio.duration_secs(), 1_000, 1);
        assembler.retain(0, Arc::clone(&audio)).unwrap();
        scheduler.enqueue(0, &audio);
        clock.advance(0.4);

        let first = reporter.snapshot(Some(&session), &scheduler, &assembler);
        let second = reporter.snapshot(Some(&session), &scheduler, &assembler);
        assert_eq!(first.received, 1);
        assert_eq!(first.expected, Some(2));
        assert!((first.position - 0.4).abs() < 1e-6);
        assert!((first.level - 0.5).abs() < 1e-6);
        assert_eq!(first.position, second.position);
        assert_eq!(scheduler.state(), PlaybackState::Playing);

        scheduler.pause();
        let paused = reporter.snapshot(Some(&session), &scheduler, &assembler);
        assert_eq!(paused.level, 0.0);
        assert_eq!(paused.status_line(), "Paused");
    }
}
