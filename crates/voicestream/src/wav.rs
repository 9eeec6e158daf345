//! 16-bit PCM RIFF/WAVE serialization.

use crate::error::{StreamError, StreamResult};
use crate::types::AudioData;
use std::io::Write;

/// Size of the canonical RIFF/WAVE header
pub const WAV_HEADER_LEN: usize = 44;

const BITS_PER_SAMPLE: u16 = 16;
const BYTES_PER_SAMPLE: u32 = (BITS_PER_SAMPLE / 8) as u32;
const PCM_FORMAT_TAG: u16 = 1;

/// Canonical 44-byte WAV header for 16-bit PCM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    /// Length of the `data` chunk in bytes
    pub data_len: u32,
}

impl WavHeader {
    pub fn pcm16(channels: u16, sample_rate: u32, data_len: u32) -> Self {
        Self {
            channels,
            sample_rate,
            bits_per_sample: BITS_PER_SAMPLE,
            data_len,
        }
    }

    /// Value of the `RIFF` chunk size field: everything after the first 8 bytes
    pub fn riff_size(&self) -> u32 {
        36 + self.data_len
    }

    pub fn block_align(&self) -> u16 {
        self.channels * (self.bits_per_sample / 8)
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.block_align() as u32
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(b"RIFF")?;
        writer.write_all(&self.riff_size().to_le_bytes())?;
        writer.write_all(b"WAVE")?;

        writer.write_all(b"fmt ")?;
        writer.write_all(&16u32.to_le_bytes())?;
        writer.write_all(&PCM_FORMAT_TAG.to_le_bytes())?;
        writer.write_all(&self.channels.to_le_bytes())?;
        writer.write_all(&self.sample_rate.to_le_bytes())?;
        writer.write_all(&self.byte_rate().to_le_bytes())?;
        writer.write_all(&self.block_align().to_le_bytes())?;
        writer.write_all(&self.bits_per_sample.to_le_bytes())?;

        writer.write_all(b"data")?;
        writer.write_all(&self.data_len.to_le_bytes())?;
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; WAV_HEADER_LEN] {
        let mut bytes = [0u8; WAV_HEADER_LEN];
        let mut cursor = &mut bytes[..];
        // Writing into a fixed 44-byte slice cannot run out of space.
        let _ = self.write_to(&mut cursor);
        bytes
    }
}

/// Clamp to [-1, 1] then scale by the asymmetric 16-bit full scale
pub fn quantize(sample: f32) -> i16 {
    let s = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    if s < 0.0 {
        (s * 32_768.0) as i16
    } else {
        (s * 32_767.0) as i16
    }
}

/// Serialize interleaved PCM into a complete WAV file
pub fn encode_pcm16(audio: &AudioData) -> StreamResult<(WavHeader, Vec<u8>)> {
    let channels = u16::try_from(audio.channels)
        .ok()
        .filter(|c| *c > 0)
        .ok_or_else(|| StreamError::Encode(format!("invalid channel count {}", audio.channels)))?;
    if audio.sample_rate == 0 {
        return Err(StreamError::Encode("sample rate must be non-zero".into()));
    }

    let data_len = u32::try_from(audio.samples.len())
        .ok()
        .and_then(|n| n.checked_mul(BYTES_PER_SAMPLE))
        .filter(|len| *len <= u32::MAX - 36)
        .ok_or_else(|| {
            StreamError::Encode(format!(
                "{} samples exceed the WAV size limit",
                audio.samples.len()
            ))
        })?;

    let header = WavHeader::pcm16(channels, audio.sample_rate, data_len);
    let mut out = Vec::with_capacity(WAV_HEADER_LEN + data_len as usize);
    out.extend_from_slice(&header.to_bytes());
    for &sample in &audio.samples {
        out.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    Ok((header, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn quantization_is_asymmetric_and_clamped() {
        assert_eq!(quantize(1.0), 32_767);
        assert_eq!(quantize(-1.0), -32_768);
        assert_eq!(quantize(2.5), 32_767);
        assert_eq!(quantize(-7.0), -32_768);
        assert_eq!(quantize(0.0), 0);
        assert_eq!(quantize(0.5), 16_383);
        assert_eq!(quantize(-0.5), -16_384);
        assert_eq!(quantize(f32::NAN), 0);
    }

    #[test]
    fn header_fields_are_byte_accurate() {
        let audio = AudioData::new(vec![0.0; 10], 2, 24_000);
        let (header, bytes) = encode_pcm16(&audio).unwrap();

        assert_eq!(bytes.len(), 44 + 20);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 36 + 20);
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(&bytes[12..16], b"fmt ");
        assert_eq!(u16::from_le_bytes([bytes[22], bytes[23]]), 2);
        assert_eq!(u32::from_le_bytes(bytes[24..28].try_into().unwrap()), 24_000);
        assert_eq!(u32::from_le_bytes(bytes[28..32].try_into().unwrap()), 96_000);
        assert_eq!(u16::from_le_bytes([bytes[32], bytes[33]]), 4);
        assert_eq!(u16::from_le_bytes([bytes[34], bytes[35]]), 16);
        assert_eq!(&bytes[36..40], b"data");
        assert_eq!(u32::from_le_bytes(bytes[40..44].try_into().unwrap()), 20);

        assert_eq!(header.byte_rate(), 96_000);
        assert_eq!(header.block_align(), 4);
    }

    #[test]
    fn hound_reads_encoded_output() {
        let samples = vec![0.0, 0.25, -0.25, 1.0, -1.0, 0.125];
        let audio = AudioData::new(samples.clone(), 1, 16_000);
        let (_, bytes) = encode_pcm16(&audio).unwrap();

        let mut reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16_000);
        assert_eq!(spec.bits_per_sample, 16);

        let decoded: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        let expected: Vec<i16> = samples.iter().map(|&s| quantize(s)).collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn rejects_zero_channels() {
        let audio = AudioData::new(vec![0.0; 4], 0, 16_000);
        assert!(matches!(encode_pcm16(&audio), Err(StreamError::Encode(_))));
    }
}
