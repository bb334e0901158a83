//! # Streaming Audio Session Manager
//!
//! Everything that decides what plays when. Two players share the same building
//! blocks:
//!
//! ## Key Components:
//! - **Clip Player** (`player`): One synthesized answer clip at a time, newest
//!   request wins
//! - **Live Session Controller** (`live`): Duplex voice session with gap-free
//!   scheduling of model replies and barge-in handling
//! - **Audio Output** (`output`): Monotonic scheduling clock + playback sink
//! - **PCM helpers** (`pcm`): base64/PCM16 decoding, downsampling, quantizing
//! - **WAV export** (`wav_export`): Cached clips as downloadable WAV files
//!
//! ## Audio Format Requirements:
//! - **Provider output**: 24kHz, 16-bit PCM, mono, base64
//! - **Provider input**: 16kHz, 16-bit PCM, mono, base64
//! - **Microphone frames**: little-endian f32, mono, at the configured capture rate

pub mod error;        // AudioError taxonomy
pub mod live;         // Live session controller
pub mod output;       // Scheduling clock and playback sink
pub mod pcm;          // PCM decoding and conversion
pub mod player;       // Clip player
pub mod wav_export;   // WAV encoding of clips

pub use error::{AudioError, AudioResult};
