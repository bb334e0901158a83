//! # Provider Clients
//!
//! Network clients for the generative AI service. Each implements one of the
//! collaborator traits the audio and answer modules are written against, so the
//! rest of the crate never sees HTTP or WebSocket details.
//!
//! ## Modules:
//! - **gemini**: REST `generateContent` for answers ([`crate::answers::AnswerGenerator`])
//!   and speech ([`crate::audio::player::SpeechSynthesizer`])
//! - **live**: WebSocket client for live voice ([`crate::audio::live::LiveConnector`])

pub mod gemini;
pub mod live;

pub use gemini::GeminiClient;
pub use live::GeminiLiveConnector;
