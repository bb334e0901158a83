//! # PCM Decoding and Conversion
//!
//! Turns provider payloads into playable samples and microphone frames into
//! provider payloads. Everything the session manager plays or sends passes
//! through here.
//!
//! ## Audio Formats:
//! - **Provider output**: base64-encoded 16-bit little-endian PCM, mono, 24kHz
//! - **Provider input**: the same encoding at 16kHz
//! - **Microphone frames**: 32-bit float samples in [-1.0, 1.0] at the capture rate
//!
//! ## Key Rust Concepts:
//! - **Arc<[i16]>**: Immutable, cheaply clonable sample storage shared between the
//!   scheduler and the output
//! - **Cursor + ReadBytesExt**: Reading typed integers out of a byte slice

use crate::audio::error::{AudioError, AudioResult};
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::sync::Arc;

/// Sample rate the live service expects for microphone audio.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of the audio the provider sends back (TTS and live replies).
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// One decoded unit of audio: raw mono PCM plus where it came from.
///
/// ## Fields:
/// - `samples`: 16-bit signed PCM, mono
/// - `sample_rate`: Samples per second
/// - `sequence`: Arrival order within its player or session (0-based)
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Arc<[i16]>,
    pub sample_rate: u32,
    pub sequence: u64,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, sample_rate: u32, sequence: u64) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            sequence,
        }
    }

    /// Playback length in seconds.
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Where a chunk sits on a scheduling clock.
///
/// `start` and `duration` are in clock seconds. The next chunk of the same
/// timeline may not start before `end()`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct PlaybackSlot {
    pub start: f64,
    pub duration: f64,
}

impl PlaybackSlot {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Decode a base64 PCM16 payload into an [`AudioChunk`].
///
/// ## Validation:
/// 1. The payload must be valid standard base64
/// 2. The decoded byte count must be even (whole 16-bit samples)
///
/// An empty payload decodes to an empty chunk; callers decide whether that is worth
/// scheduling.
pub fn decode_base64_pcm(payload: &str, sample_rate: u32, sequence: u64) -> AudioResult<AudioChunk> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| AudioError::DecodeFailed(format!("invalid base64: {}", e)))?;

    let samples = pcm16_from_bytes(&bytes)?;
    Ok(AudioChunk::new(samples, sample_rate, sequence))
}

/// Read little-endian 16-bit samples out of raw bytes.
pub fn pcm16_from_bytes(bytes: &[u8]) -> AudioResult<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(AudioError::DecodeFailed(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Encode samples as base64 little-endian PCM16 (the provider's input format).
pub fn encode_base64_pcm(samples: &[i16]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail.
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Parse a binary microphone frame of little-endian `f32` samples.
pub fn f32_frame_from_bytes(bytes: &[u8]) -> AudioResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(AudioError::DecodeFailed(format!(
            "float frame length {} is not a multiple of 4",
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 4);
    while let Ok(sample) = cursor.read_f32::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Reduce the sample rate of a float frame by averaging each output window.
///
/// ## Method:
/// Each output sample is the mean of the input samples that fall into its time
/// window. Averaging doubles as a crude low-pass filter, which is enough for speech
/// going to a recognizer. Upsampling is never needed here, so a target rate at or
/// above the source rate returns the frame unchanged.
pub fn downsample(frame: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if to_rate == 0 || from_rate <= to_rate {
        return frame.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (frame.len() as f64 / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let start = (i as f64 * ratio).floor() as usize;
        let end = (((i + 1) as f64 * ratio).floor() as usize).min(frame.len());
        let window = &frame[start..end.max(start + 1).min(frame.len())];
        let sum: f32 = window.iter().sum();
        out.push(sum / window.len() as f32);
    }

    out
}

/// Quantize float samples in [-1.0, 1.0] to 16-bit PCM, clamping out-of-range input.
pub fn quantize(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| {
            let clamped = sample.clamp(-1.0, 1.0);
            if clamped < 0.0 {
                (clamped * 32768.0) as i16
            } else {
                (clamped * 32767.0) as i16
            }
        })
        .collect()
}
