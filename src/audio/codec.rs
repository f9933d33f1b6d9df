//! PCM16 wire codec for audio frames.
//!
//! Samples in \[-1, 1\] are quantized to 16-bit signed little-endian PCM and
//! carried as base64 text tagged `audio/pcm;rate=<hz>`, the inline-data
//! format the live agent speaks in both directions.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::time::Duration;

/// Scale between normalized floats and PCM16 integers.
const PCM16_SCALE: f32 = 32768.0;

/// Media type of raw PCM16 chunks, before parameters.
const PCM_MEDIA_TYPE: &str = "audio/pcm";

/// Reasons a chunk cannot be turned back into an [`AudioFrame`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The chunk carried no audio bytes.
    #[error("empty audio chunk")]
    Empty,

    /// The text payload is not valid base64.
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),

    /// Byte length is not a whole number of PCM16 sample frames.
    #[error("{len} bytes is not a whole number of {channels}-channel PCM16 frames")]
    Misaligned { len: usize, channels: u16 },

    /// The mime tag is not `audio/pcm` with a usable `rate=` parameter.
    #[error("unsupported audio format '{0}'")]
    UnsupportedFormat(String),

    /// A frame needs at least one channel.
    #[error("channel count must be at least 1")]
    InvalidChannels,
}

/// A block of audio moving through one pipeline stage.
///
/// Samples are interleaved when `channels > 1`. Frames are moved between
/// stages, never shared.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Interleaved f32 samples in \[-1, 1\].
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
}

impl AudioFrame {
    /// Create a frame from interleaved samples.
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Create a single-channel frame.
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(samples, sample_rate, 1)
    }

    /// Number of samples per channel.
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Logical playback duration: `samples / sample_rate / channels`.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = self.frame_count() as u128 * 1_000_000_000 / u128::from(self.sample_rate);
        Duration::from_nanos(nanos as u64)
    }

    /// De-interleaved samples of one channel.
    pub fn channel(&self, index: u16) -> impl Iterator<Item = f32> + '_ {
        let step = usize::from(self.channels.max(1));
        let skip = if index < self.channels {
            usize::from(index)
        } else {
            self.samples.len()
        };
        self.samples.iter().copied().skip(skip).step_by(step)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Transport form of an [`AudioFrame`]: base64 PCM16 plus a format tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    /// Base64 (standard alphabet, padded) little-endian PCM16 bytes.
    pub data: String,
    /// Format tag, e.g. `audio/pcm;rate=16000`.
    pub mime_type: String,
}

impl EncodedChunk {
    pub fn new(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Sample rate declared by the `rate=` parameter of the mime tag.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnsupportedFormat`] if the tag is not
    /// `audio/pcm` or lacks a positive rate.
    pub fn sample_rate(&self) -> Result<u32, CodecError> {
        let unsupported = || CodecError::UnsupportedFormat(self.mime_type.clone());
        let mut parts = self.mime_type.split(';').map(str::trim);

        let media_type = parts.next().unwrap_or_default();
        if !media_type.eq_ignore_ascii_case(PCM_MEDIA_TYPE) {
            return Err(unsupported());
        }

        parts
            .filter_map(|param| param.split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
            .and_then(|(_, value)| value.trim().parse::<u32>().ok())
            .filter(|rate| *rate > 0)
            .ok_or_else(unsupported)
    }
}

/// Format tag for PCM16 audio at `sample_rate`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("{PCM_MEDIA_TYPE};rate={sample_rate}")
}

/// Encode a frame as base64 PCM16.
///
/// Each sample is clamped to \[-1, 1\], scaled by 32768 and truncated toward
/// zero; `1.0` saturates to `i16::MAX`.
pub fn encode(frame: &AudioFrame) -> EncodedChunk {
    let mut bytes = Vec::with_capacity(frame.samples.len() * 2);
    for &sample in &frame.samples {
        bytes.extend_from_slice(&quantize(sample).to_le_bytes());
    }

    EncodedChunk {
        data: STANDARD.encode(&bytes),
        mime_type: pcm_mime_type(frame.sample_rate),
    }
}

/// Decode a base64 PCM16 chunk into a frame with `channels` interleaved channels.
///
/// # Errors
///
/// Fails on an empty payload, invalid base64, a byte length that does not
/// hold whole sample frames, or an unrecognized format tag.
pub fn decode(chunk: &EncodedChunk, channels: u16) -> Result<AudioFrame, CodecError> {
    if channels == 0 {
        return Err(CodecError::InvalidChannels);
    }
    let sample_rate = chunk.sample_rate()?;

    let payload = chunk.data.trim();
    if payload.is_empty() {
        return Err(CodecError::Empty);
    }
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }

    let frame_bytes = 2 * usize::from(channels);
    if bytes.len() % frame_bytes != 0 {
        return Err(CodecError::Misaligned {
            len: bytes.len(),
            channels,
        });
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / PCM16_SCALE)
        .collect();

    Ok(AudioFrame {
        samples,
        sample_rate,
        channels,
    })
}

fn quantize(sample: f32) -> i16 {
    // `as` truncates toward zero and saturates; NaN maps to 0.
    (sample.clamp(-1.0, 1.0) * PCM16_SCALE) as i16
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    const TOLERANCE: f32 = 1.0 / 32768.0;

    fn raw_chunk(bytes: &[u8], rate: u32) -> EncodedChunk {
        EncodedChunk::new(STANDARD.encode(bytes), pcm_mime_type(rate))
    }

    #[test]
    fn round_trip_stays_within_quantization_error() {
        let samples: Vec<f32> = (0..2001).map(|i| (i as f32 / 1000.0) - 1.0).collect();
        let frame = AudioFrame::mono(samples.clone(), 16_000);

        let decoded = decode(&encode(&frame), 1).unwrap();

        assert_eq!(decoded.samples.len(), samples.len());
        assert_eq!(decoded.sample_rate, 16_000);
        for (sample, restored) in samples.iter().zip(&decoded.samples) {
            assert!(
                (sample - restored).abs() <= TOLERANCE,
                "{sample} decoded as {restored}"
            );
        }
    }

    #[test]
    fn full_scale_saturates() {
        let frame = AudioFrame::mono(vec![1.0, -1.0, 2.5, -7.0], 16_000);
        let decoded = decode(&encode(&frame), 1).unwrap();
        assert_eq!(
            decoded.samples,
            vec![32767.0 / 32768.0, -1.0, 32767.0 / 32768.0, -1.0]
        );
    }

    #[test]
    fn encode_truncates_toward_zero() {
        // 0.5 / 32768 below one step truncates to 0 in both directions.
        let half_step = 0.5 / 32768.0;
        let chunk = encode(&AudioFrame::mono(vec![half_step, -half_step], 16_000));
        let bytes = STANDARD.decode(&chunk.data).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
    }

    #[test]
    fn encode_writes_little_endian() {
        let chunk = encode(&AudioFrame::mono(vec![0.25], 16_000));
        let bytes = STANDARD.decode(&chunk.data).unwrap();
        // 0.25 * 32768 = 8192 = 0x2000
        assert_eq!(bytes, vec![0x00, 0x20]);
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
    }

    #[test]
    fn decode_odd_length_is_misaligned() {
        let err = decode(&raw_chunk(&[1, 2, 3], 24_000), 1).unwrap_err();
        assert_eq!(
            err,
            CodecError::Misaligned {
                len: 3,
                channels: 1
            }
        );
    }

    #[test]
    fn decode_partial_stereo_frame_is_misaligned() {
        let err = decode(&raw_chunk(&[0, 0, 0, 0, 0, 0], 24_000), 2).unwrap_err();
        assert!(matches!(err, CodecError::Misaligned { len: 6, channels: 2 }));
    }

    #[test]
    fn decode_empty_payload_fails() {
        let chunk = EncodedChunk::new("", pcm_mime_type(24_000));
        assert_eq!(decode(&chunk, 1).unwrap_err(), CodecError::Empty);
    }

    #[test]
    fn decode_invalid_base64_fails() {
        let chunk = EncodedChunk::new("not*base64!", pcm_mime_type(24_000));
        assert!(matches!(
            decode(&chunk, 1).unwrap_err(),
            CodecError::InvalidBase64(_)
        ));
    }

    #[test]
    fn decode_rejects_zero_channels() {
        let chunk = raw_chunk(&[0, 0], 24_000);
        assert_eq!(decode(&chunk, 0).unwrap_err(), CodecError::InvalidChannels);
    }

    #[test]
    fn decode_reads_rate_from_mime_tag() {
        let chunk = EncodedChunk::new(STANDARD.encode([0u8, 0]), "audio/PCM; rate=24000");
        assert_eq!(decode(&chunk, 1).unwrap().sample_rate, 24_000);
    }

    #[test]
    fn decode_rejects_unknown_format() {
        for tag in ["audio/wav", "audio/pcm", "audio/pcm;rate=0", "audio/pcm;rate=fast"] {
            let chunk = EncodedChunk::new(STANDARD.encode([0u8, 0]), tag);
            assert!(
                matches!(decode(&chunk, 1), Err(CodecError::UnsupportedFormat(_))),
                "{tag} should be rejected"
            );
        }
    }

    #[test]
    fn decode_deinterleaves_channels() {
        // L = 0.5, R = -0.5, twice.
        let bytes: Vec<u8> = [16384i16, -16384, 16384, -16384]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let frame = decode(&raw_chunk(&bytes, 24_000), 2).unwrap();

        assert_eq!(frame.frame_count(), 2);
        assert_eq!(frame.channel(0).collect::<Vec<_>>(), vec![0.5, 0.5]);
        assert_eq!(frame.channel(1).collect::<Vec<_>>(), vec![-0.5, -0.5]);
        assert_eq!(frame.channel(2).count(), 0);
    }

    #[test]
    fn duration_counts_per_channel_frames() {
        assert_eq!(
            AudioFrame::mono(vec![0.0; 12_000], 24_000).duration(),
            Duration::from_millis(500)
        );
        assert_eq!(
            AudioFrame::new(vec![0.0; 7_200], 24_000, 2).duration(),
            Duration::from_millis(150)
        );
        assert_eq!(AudioFrame::mono(vec![0.0; 10], 0).duration(), Duration::ZERO);
    }
}
