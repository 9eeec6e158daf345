//! Chunk decoding: encoded payload to PCM.

use crate::error::{DecodeError, DecodeResult};
use crate::types::{AudioData, EncodedChunk};
use async_trait::async_trait;
use std::io::Cursor;

/// Platform audio decoder seam.
///
/// Implementations must hand back samples exactly as the container holds
/// them; no resampling or normalization.
#[async_trait]
pub trait ChunkDecoder: Send + Sync {
    async fn decode(&self, chunk: &EncodedChunk) -> DecodeResult<AudioData>;

    /// Short name used in log lines
    fn name(&self) -> &'static str;
}

/// Decoder for RIFF/WAVE payloads (what the generation server emits)
#[derive(Debug, Clone, Copy, Default)]
pub struct WavChunkDecoder;

impl WavChunkDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode a WAV byte buffer synchronously
    pub fn decode_bytes(payload: &[u8]) -> DecodeResult<AudioData> {
        let mut reader = hound::WavReader::new(Cursor::new(payload))?;
        let spec = reader.spec();

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Int => match spec.bits_per_sample {
                8 => reader
                    .samples::<i8>()
                    .map(|s| s.map(|v| v as f32 / 128.0))
                    .collect::<Result<_, _>>()?,
                16 => reader
                    .samples::<i16>()
                    .map(|s| s.map(|v| v as f32 / 32_768.0))
                    .collect::<Result<_, _>>()?,
                24 => reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / 8_388_608.0))
                    .collect::<Result<_, _>>()?,
                32 => reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / 2_147_483_648.0))
                    .collect::<Result<_, _>>()?,
                bits => {
                    return Err(DecodeError::UnsupportedFormat(format!(
                        "unsupported bit depth: {bits}"
                    )));
                }
            },
            hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        };

        if samples.is_empty() {
            return Err(DecodeError::Empty);
        }

        Ok(AudioData {
            samples,
            channels: spec.channels as usize,
            sample_rate: spec.sample_rate,
        })
    }
}

#[async_trait]
impl ChunkDecoder for WavChunkDecoder {
    async fn decode(&self, chunk: &EncodedChunk) -> DecodeResult<AudioData> {
        let audio = Self::decode_bytes(&chunk.payload)?;
        warn_on_declared_rate(chunk, &audio);
        Ok(audio)
    }

    fn name(&self) -> &'static str {
        "wav"
    }
}

fn warn_on_declared_rate(chunk: &EncodedChunk, audio: &AudioData) {
    if let Some(declared) = chunk.declared_sample_rate {
        if declared != audio.sample_rate {
            log::warn!(
                "Chunk {} declares {} Hz but its container holds {} Hz; using the container rate",
                chunk.index,
                declared,
                audio.sample_rate
            );
        }
    }
}

/// Decoder for any container symphonia can probe (WAV, FLAC, OGG/Vorbis, MP3)
#[cfg(feature = "symphonia")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SymphoniaChunkDecoder;

#[cfg(feature = "symphonia")]
impl SymphoniaChunkDecoder {
    pub fn new() -> Self {
        Self
    }

    pub fn decode_bytes(payload: &[u8]) -> DecodeResult<AudioData> {
        use symphonia::core::audio::SampleBuffer;
        use symphonia::core::codecs::DecoderOptions;
        use symphonia::core::errors::Error as SymphoniaError;
        use symphonia::core::formats::FormatOptions;
        use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions};
        use symphonia::core::meta::MetadataOptions;
        use symphonia::core::probe::Hint;

        let mss = MediaSourceStream::new(
            Box::new(Cursor::new(payload.to_vec())),
            MediaSourceStreamOptions::default(),
        );

        let probed = symphonia::default::get_probe()
            .format(
                &Hint::new(),
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| DecodeError::UnsupportedFormat(e.to_string()))?;

        let mut format = probed.format;
        let track = format
            .default_track()
            .ok_or_else(|| DecodeError::Codec("no audio track found".into()))?;

        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| DecodeError::Codec("unknown sample rate".into()))?;
        let channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(1);
        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::Codec(e.to_string()))?;

        let mut sample_buf: Option<SampleBuffer<f32>> = None;
        let mut samples: Vec<f32> = Vec::new();

        loop {
            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(_)) | Err(SymphoniaError::ResetRequired) => break,
                Err(e) => return Err(DecodeError::Codec(e.to_string())),
            };

            if packet.track_id() != track_id {
                continue;
            }

            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let sb = sample_buf.get_or_insert_with(|| {
                        SampleBuffer::new(decoded.capacity() as u64, *decoded.spec())
                    });
                    sb.copy_interleaved_ref(decoded);
                    samples.extend_from_slice(sb.samples());
                }
                Err(SymphoniaError::IoError(_)) | Err(SymphoniaError::DecodeError(_)) => continue,
                Err(e) => return Err(DecodeError::Codec(e.to_string())),
            }
        }

        if samples.is_empty() {
            return Err(DecodeError::Empty);
        }

        Ok(AudioData {
            samples,
            channels,
            sample_rate,
        })
    }
}

#[cfg(feature = "symphonia")]
#[async_trait]
impl ChunkDecoder for SymphoniaChunkDecoder {
    async fn decode(&self, chunk: &EncodedChunk) -> DecodeResult<AudioData> {
        let audio = Self::decode_bytes(&chunk.payload)?;
        warn_on_declared_rate(chunk, &audio);
        Ok(audio)
    }

    fn name(&self) -> &'static str {
        "symphonia"
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a 16-bit PCM WAV payload from float samples
    pub(crate) fn wav_bytes(samples: &[f32], channels: u16, sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample((s * 32_767.0) as i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn chunk(payload: Vec<u8>, declared: Option<u32>) -> EncodedChunk {
        EncodedChunk {
            index: 0,
            payload,
            declared_sample_rate: declared,
            text: None,
        }
    }

    #[tokio::test]
    async fn decodes_mono_pcm16() {
        let payload = wav_bytes(&[0.0; 2_400], 1, 24_000);
        let audio = WavChunkDecoder::new()
            .decode(&chunk(payload, Some(24_000)))
            .await
            .unwrap();
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.sample_rate, 24_000);
        assert_eq!(audio.frames(), 2_400);
        assert!((audio.duration_secs() - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn preserves_sample_values() {
        let payload = wav_bytes(&[0.5, -0.5, 0.25, -1.0], 2, 16_000);
        let audio = WavChunkDecoder::new()
            .decode(&chunk(payload, None))
            .await
            .unwrap();
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.frames(), 2);
        let expected = [0.5, -0.5, 0.25, -1.0];
        for (got, want) in audio.samples.iter().zip(expected) {
            assert!((got - want).abs() < 1.0 / 16_000.0, "{got} vs {want}");
        }
    }

    #[tokio::test]
    async fn container_rate_wins_over_declared() {
        let payload = wav_bytes(&[0.1; 160], 1, 16_000);
        let audio = WavChunkDecoder::new()
            .decode(&chunk(payload, Some(24_000)))
            .await
            .unwrap();
        assert_eq!(audio.sample_rate, 16_000);
    }

    #[tokio::test]
    async fn garbage_payload_fails() {
        let result = WavChunkDecoder::new()
            .decode(&chunk(b"definitely not a wav file".to_vec(), None))
            .await;
        assert!(matches!(result, Err(DecodeError::Wav(_))));
    }

    #[tokio::test]
    async fn empty_data_chunk_fails() {
        let payload = wav_bytes(&[], 1, 24_000);
        let result = WavChunkDecoder::new().decode(&chunk(payload, None)).await;
        assert!(matches!(result, Err(DecodeError::Empty)));
    }

    #[cfg(feature = "symphonia")]
    #[test]
    fn symphonia_reads_wav_payloads() {
        let payload = wav_bytes(&[0.25; 480], 1, 24_000);
        let audio = SymphoniaChunkDecoder::decode_bytes(&payload).unwrap();
        assert_eq!(audio.sample_rate, 24_000);
        assert_eq!(audio.frames(), 480);
    }
}
