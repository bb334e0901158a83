//! # Audio Error Taxonomy
//!
//! Errors produced by the clip player, the live session controller and the
//! collaborators they talk to (TTS, live connection, microphone).
//!
//! ## Key Rust Concepts:
//! - **thiserror**: Derives `Display` and `std::error::Error` from the `#[error]` attributes
//! - **Clone**: Errors are cloned into observer channels and logs, so every variant
//!   only holds owned `String`s
//!
//! ## What is *not* an error:
//! A TTS fetch that completes after a newer request was issued is reported as
//! `PlayOutcome::Stale` by the player. It is silently discarded.

/// Everything that can go wrong while fetching, decoding or playing audio.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AudioError {
    /// No authenticated, email-verified user. Cache operations are skipped.
    #[error("an authenticated, verified user is required")]
    AuthRequired,

    /// Network or provider failure while fetching an answer or speech.
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// The audio payload could not be turned into PCM samples.
    #[error("audio decode failed: {0}")]
    DecodeFailed(String),

    /// The live connection could not be opened.
    #[error("live connection failed: {0}")]
    ConnectionFailed(String),

    /// The microphone stream could not be acquired.
    #[error("microphone unavailable: {0}")]
    MicrophoneUnavailable(String),

    /// `start()` was called while a session is connecting or active.
    #[error("a live session is already connecting or active")]
    SessionAlreadyActive,

    /// The playback sink is gone (the UI disconnected).
    #[error("audio output is closed")]
    OutputClosed,
}

/// Shorthand used throughout the audio modules.
pub type AudioResult<T> = Result<T, AudioError>;
