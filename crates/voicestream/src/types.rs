use crate::error::DecodeResult;
use crate::protocol::ChunkEvent;
use base64::Engine;
use std::sync::Arc;

/// PCM audio with interleaved samples normalized to [-1.0, 1.0]
#[derive(Clone, Debug, PartialEq)]
pub struct AudioData {
    /// Interleaved samples, `frames * channels` long
    pub samples: Vec<f32>,
    /// Number of audio channels (typically 1 for mono)
    pub channels: usize,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl AudioData {
    pub fn new(samples: Vec<f32>, channels: usize, sample_rate: u32) -> Self {
        Self {
            samples,
            channels,
            sample_rate,
        }
    }

    /// Number of sample frames (samples per channel)
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels
    }

    /// Duration in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Samples of a single channel, in order
    pub fn channel(&self, channel: usize) -> impl Iterator<Item = f32> + '_ {
        let stride = self.channels.max(1);
        let first = if channel < self.channels {
            channel
        } else {
            self.samples.len()
        };
        self.samples.iter().skip(first).step_by(stride).copied()
    }

    /// RMS level over `len` frames starting at frame `start`, all channels mixed
    pub fn rms(&self, start: usize, len: usize) -> f32 {
        let channels = self.channels.max(1);
        let from = (start * channels).min(self.samples.len());
        let to = ((start + len) * channels).min(self.samples.len());
        if from >= to {
            return 0.0;
        }
        let window = &self.samples[from..to];
        let sum: f32 = window.iter().map(|s| s * s).sum();
        (sum / window.len() as f32).sqrt()
    }
}

/// Shared reference to decoded audio; the scheduler and the assembler both hold one
pub type SharedAudioData = Arc<AudioData>;

/// One chunk's encoded payload as delivered by the stream.
///
/// Transient: handed to the decoder and dropped.
#[derive(Clone, Debug)]
pub struct EncodedChunk {
    /// Server-declared chunk index
    pub index: u32,
    /// Encoded audio container bytes
    pub payload: Vec<u8>,
    /// Sample rate the server claims for this chunk
    pub declared_sample_rate: Option<u32>,
    /// Text fragment spoken by this chunk, if the server sent it
    pub text: Option<String>,
}

impl EncodedChunk {
    /// Decode the base64 audio field of a `chunk` event
    pub fn from_event(event: &ChunkEvent) -> DecodeResult<Self> {
        let payload = base64::engine::general_purpose::STANDARD.decode(event.audio.trim())?;
        Ok(Self {
            index: event.chunk_index,
            payload,
            declared_sample_rate: Some(event.sample_rate),
            text: event.text.clone(),
        })
    }
}

/// A successfully decoded chunk, tagged with its index
#[derive(Clone, Debug)]
pub struct DecodedChunk {
    pub index: u32,
    pub audio: SharedAudioData,
}

impl DecodedChunk {
    pub fn new(index: u32, audio: AudioData) -> Self {
        Self {
            index,
            audio: Arc::new(audio),
        }
    }

    pub fn duration_secs(&self) -> f64 {
        self.audio.duration_secs()
    }

    pub fn channels(&self) -> usize {
        self.audio.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.audio.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_counts_frames_not_samples() {
        let audio = AudioData::new(vec![0.0; 48_000], 2, 24_000);
        assert_eq!(audio.frames(), 24_000);
        assert!((audio.duration_secs() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn channel_iterator_deinterleaves() {
        let audio = AudioData::new(vec![0.1, -0.1, 0.2, -0.2, 0.3, -0.3], 2, 8_000);
        let left: Vec<f32> = audio.channel(0).collect();
        let right: Vec<f32> = audio.channel(1).collect();
        assert_eq!(left, vec![0.1, 0.2, 0.3]);
        assert_eq!(right, vec![-0.1, -0.2, -0.3]);
        assert_eq!(audio.channel(2).count(), 0);
    }

    #[test]
    fn rms_of_constant_signal() {
        let audio = AudioData::new(vec![0.5; 100], 1, 100);
        assert!((audio.rms(10, 20) - 0.5).abs() < 1e-6);
        assert_eq!(audio.rms(200, 10), 0.0);
    }

    #[test]
    fn encoded_chunk_from_event() {
        let event = ChunkEvent {
            chunk_index: 3,
            audio: "AAEC".to_string(),
            sample_rate: 24_000,
            total_chunks: Some(5),
            text: Some("hello".to_string()),
        };
        let chunk = EncodedChunk::from_event(&event).unwrap();
        assert_eq!(chunk.index, 3);
        assert_eq!(chunk.payload, vec![0, 1, 2]);
        assert_eq!(chunk.declared_sample_rate, Some(24_000));
        assert_eq!(chunk.text.as_deref(), Some("hello"));
    }

    #[test]
    fn encoded_chunk_rejects_bad_base64() {
        let event = ChunkEvent {
            chunk_index: 0,
            audio: "not base64!!".to_string(),
            sample_rate: 24_000,
            total_chunks: None,
            text: None,
        };
        assert!(EncodedChunk::from_event(&event).is_err());
    }
}
