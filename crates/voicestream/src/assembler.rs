//! Retention of decoded chunks and assembly of the combined artifact.

use crate::error::{DecodeError, DecodeResult, StreamError, StreamResult};
use crate::types::{AudioData, SharedAudioData};
use crate::wav::{WavHeader, encode_pcm16};
use base64::Engine;
use std::path::Path;
use std::sync::Arc;

/// Holds every successfully decoded chunk, in arrival order, until finalization
#[derive(Debug, Default)]
pub struct Assembler {
    retained: Vec<(u32, SharedAudioData)>,
    /// The concatenated buffer once finalized; still read by the level meter
    combined: Option<SharedAudioData>,
    sample_rate: Option<u32>,
    channels: Option<usize>,
}

/// All retained chunks concatenated into one buffer
#[derive(Debug, Clone)]
pub struct CombinedAudio {
    pub audio: SharedAudioData,
    pub chunk_count: usize,
    /// Starting frame of each chunk inside `audio`
    pub chunk_offsets: Vec<usize>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the session format before any chunk is retained
    pub fn with_sample_rate(sample_rate: u32) -> Self {
        Self {
            sample_rate: Some(sample_rate),
            ..Self::default()
        }
    }

    /// Check that `audio` matches the format of the session so far
    pub fn accepts(&self, audio: &AudioData) -> DecodeResult<()> {
        if let Some(expected) = self.sample_rate {
            if audio.sample_rate != expected {
                return Err(DecodeError::SampleRateMismatch {
                    expected,
                    actual: audio.sample_rate,
                });
            }
        }
        if let Some(expected) = self.channels {
            if audio.channels != expected {
                return Err(DecodeError::ChannelMismatch {
                    expected,
                    actual: audio.channels,
                });
            }
        }
        Ok(())
    }

    /// Keep a decoded chunk; the first one fixes the session format
    pub fn retain(&mut self, index: u32, audio: SharedAudioData) -> DecodeResult<()> {
        self.accepts(&audio)?;
        self.sample_rate.get_or_insert(audio.sample_rate);
        self.channels.get_or_insert(audio.channels);
        self.retained.push((index, audio));
        Ok(())
    }

    pub fn chunk_count(&self) -> usize {
        self.retained.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    pub fn channels(&self) -> Option<usize> {
        self.channels
    }

    /// Sum of retained chunk durations
    pub fn total_duration(&self) -> f64 {
        self.retained.iter().map(|(_, a)| a.duration_secs()).sum()
    }

    /// RMS over `window` seconds centered on `position` of the combined timeline
    pub fn level_at(&self, position: f64, window: f64) -> f32 {
        let Some(rate) = self.sample_rate else {
            return 0.0;
        };
        let half = ((window * rate as f64) / 2.0).max(1.0) as usize;
        let mut target = (position.max(0.0) * rate as f64) as usize;

        if let Some(audio) = &self.combined {
            if target >= audio.frames() {
                return 0.0;
            }
            return audio.rms(target.saturating_sub(half), half * 2);
        }
        for (_, audio) in &self.retained {
            let frames = audio.frames();
            if target < frames {
                let start = target.saturating_sub(half);
                return audio.rms(start, half * 2);
            }
            target -= frames;
        }
        0.0
    }

    /// Concatenate the retained chunks in arrival order and release them.
    ///
    /// A single chunk is returned as-is; several are copied into one buffer
    /// sized to the total frame count. The result stays readable through
    /// [`Assembler::level_at`] until [`Assembler::clear`].
    pub fn finalize(&mut self) -> StreamResult<CombinedAudio> {
        let combined = self.concatenate()?;
        self.combined = Some(Arc::clone(&combined.audio));
        Ok(combined)
    }

    fn concatenate(&mut self) -> StreamResult<CombinedAudio> {
        let retained = std::mem::take(&mut self.retained);
        let (Some(sample_rate), Some(channels)) = (self.sample_rate, self.channels) else {
            return Err(StreamError::NoAudio);
        };

        match retained.len() {
            0 => Err(StreamError::NoAudio),
            1 => {
                let (_, audio) = retained.into_iter().next().ok_or(StreamError::NoAudio)?;
                Ok(CombinedAudio {
                    audio,
                    chunk_count: 1,
                    chunk_offsets: vec![0],
                })
            }
            count => {
                let total_frames: usize = retained.iter().map(|(_, a)| a.frames()).sum();
                let mut samples = vec![0.0f32; total_frames * channels];
                let mut chunk_offsets = Vec::with_capacity(count);

                let mut frame_offset = 0;
                for (_, audio) in &retained {
                    let frames = audio.frames();
                    let from = frame_offset * channels;
                    let to = from + frames * channels;
                    samples[from..to].copy_from_slice(&audio.samples[..frames * channels]);
                    chunk_offsets.push(frame_offset);
                    frame_offset += frames;
                }

                Ok(CombinedAudio {
                    audio: Arc::new(AudioData::new(samples, channels, sample_rate)),
                    chunk_count: count,
                    chunk_offsets,
                })
            }
        }
    }

    /// Drop everything retained and forget the session format
    pub fn clear(&mut self) {
        self.retained.clear();
        self.combined = None;
        self.sample_rate = None;
        self.channels = None;
    }
}

impl CombinedAudio {
    pub fn duration_secs(&self) -> f64 {
        self.audio.duration_secs()
    }
}

/// The finished, immutable result of a session: combined PCM plus its WAV encoding
#[derive(Debug, Clone)]
pub struct CombinedArtifact {
    header: WavHeader,
    wav: Vec<u8>,
    audio: SharedAudioData,
    chunk_count: usize,
}

impl CombinedArtifact {
    pub fn encode(combined: CombinedAudio) -> StreamResult<Self> {
        let (header, wav) = encode_pcm16(&combined.audio)?;
        Ok(Self {
            header,
            wav,
            audio: combined.audio,
            chunk_count: combined.chunk_count,
        })
    }

    /// Complete WAV file bytes
    pub fn bytes(&self) -> &[u8] {
        &self.wav
    }

    pub fn header(&self) -> &WavHeader {
        &self.header
    }

    pub fn audio(&self) -> &AudioData {
        &self.audio
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn duration_secs(&self) -> f64 {
        self.audio.duration_secs()
    }

    pub fn mime_type(&self) -> &'static str {
        "audio/wav"
    }

    /// Write the WAV file to disk
    pub fn write_to(&self, path: impl AsRef<Path>) -> StreamResult<()> {
        std::fs::write(path, &self.wav)?;
        Ok(())
    }

    /// `data:` URL carrying the whole file
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type(),
            base64::engine::general_purpose::STANDARD.encode(&self.wav)
        )
    }

    /// Release the artifact
    pub fn discard(self) {}
}
