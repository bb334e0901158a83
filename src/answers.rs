//! # Answer Service
//!
//! Cache-through access to generated answers and their spoken audio. Entries are
//! keyed by `(user id, question id)` in an [`AnswerStore`]; a miss goes to the
//! [`AnswerGenerator`] (and, for audio, the [`SpeechSynthesizer`]) and the result
//! is written back.
//!
//! ## Identity Gate:
//! The store is per-user, so it is only touched when the [`IdentityProvider`]
//! reports a signed-in user with a verified email. Without one every read and
//! write is skipped and the answer is generated fresh each time.
//!
//! ## Key Rust Concepts:
//! - **Trait objects**: Store, generator and identity are `Arc<dyn Trait>` so tests
//!   can swap in in-memory doubles
//! - **tokio::sync::RwLock**: The in-memory store is shared across request handlers

use crate::audio::player::SpeechSynthesizer;
use crate::audio::{AudioError, AudioResult};
use crate::questions::Question;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A web page the answer was grounded on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundingSource {
    pub title: String,
    pub uri: String,
}

/// Freshly generated answer text.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedAnswer {
    pub text: String,
    pub sources: Vec<GroundingSource>,
}

/// Produces answer text for an interview question.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate_answer(&self, question: &str) -> AudioResult<GeneratedAnswer>;
}

/// One cached document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAnswer {
    pub question_id: String,
    pub answer: String,
    pub sources: Vec<GroundingSource>,
    /// Base64 PCM16 at the TTS output rate, once synthesized
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_base64: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserIdentity {
    pub user_id: String,
    pub email_verified: bool,
}

/// Who is asking.
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<UserIdentity>;
}

/// Identity resolved once (from request headers, for instance).
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity(pub Option<UserIdentity>);

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<UserIdentity> {
        self.0.clone()
    }
}

/// Per-user document store. Writes are last-write-wins.
#[async_trait]
pub trait AnswerStore: Send + Sync {
    async fn get(&self, user_id: &str, question_id: &str) -> AudioResult<Option<CachedAnswer>>;
    async fn put(&self, user_id: &str, answer: CachedAnswer) -> AudioResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryAnswerStore {
    entries: RwLock<HashMap<(String, String), CachedAnswer>>,
}

impl MemoryAnswerStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl AnswerStore for MemoryAnswerStore {
    async fn get(&self, user_id: &str, question_id: &str) -> AudioResult<Option<CachedAnswer>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&(user_id.to_string(), question_id.to_string()))
            .cloned())
    }

    async fn put(&self, user_id: &str, answer: CachedAnswer) -> AudioResult<()> {
        let key = (user_id.to_string(), answer.question_id.clone());
        self.entries.write().await.insert(key, answer);
        Ok(())
    }
}

/// The signed-in, verified user, or [`AudioError::AuthRequired`].
pub fn verified_user(identity: &dyn IdentityProvider) -> AudioResult<UserIdentity> {
    match identity.current_user() {
        Some(user) if user.email_verified => Ok(user),
        _ => Err(AudioError::AuthRequired),
    }
}

pub struct AnswerService {
    store: Arc<dyn AnswerStore>,
    generator: Arc<dyn AnswerGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
}

impl AnswerService {
    pub fn new(
        store: Arc<dyn AnswerStore>,
        generator: Arc<dyn AnswerGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        Self {
            store,
            generator,
            synthesizer,
        }
    }

    /// Answer text and sources for `question`, from the cache when possible.
    pub async fn answer(
        &self,
        identity: &dyn IdentityProvider,
        question: &Question,
    ) -> AudioResult<CachedAnswer> {
        let user = self.cache_user(identity);

        if let Some(hit) = self.lookup(user.as_ref(), &question.id).await {
            debug!(question_id = %question.id, "Answer cache hit");
            return Ok(hit);
        }

        info!(question_id = %question.id, "Generating answer");
        let generated = self.generator.generate_answer(&question.text).await?;
        let entry = CachedAnswer {
            question_id: question.id.clone(),
            answer: generated.text,
            sources: generated.sources,
            audio_base64: None,
            updated_at: Utc::now(),
        };

        self.store_entry(user.as_ref(), entry.clone()).await;
        Ok(entry)
    }

    /// Spoken answer for `question` as base64 PCM16.
    pub async fn audio(
        &self,
        identity: &dyn IdentityProvider,
        question: &Question,
    ) -> AudioResult<String> {
        let entry = self.answer(identity, question).await?;
        if let Some(audio) = entry.audio_base64 {
            return Ok(audio);
        }
        self.speech(identity, &question.id, &entry.answer).await
    }

    /// Speech for a clip, reusing cached audio when the cached text matches.
    pub async fn speech(
        &self,
        identity: &dyn IdentityProvider,
        clip_id: &str,
        text: &str,
    ) -> AudioResult<String> {
        let user = self.cache_user(identity);
        let cached = self.lookup(user.as_ref(), clip_id).await;

        if let Some(audio) = cached
            .as_ref()
            .filter(|entry| entry.answer == text)
            .and_then(|entry| entry.audio_base64.clone())
        {
            debug!(clip_id, "Speech cache hit");
            return Ok(audio);
        }

        info!(clip_id, chars = text.len(), "Synthesizing speech");
        let audio = self.synthesizer.synthesize(clip_id, text).await?;

        let entry = match cached {
            Some(entry) if entry.answer == text => CachedAnswer {
                audio_base64: Some(audio.clone()),
                updated_at: Utc::now(),
                ..entry
            },
            _ => CachedAnswer {
                question_id: clip_id.to_string(),
                answer: text.to_string(),
                sources: Vec::new(),
                audio_base64: Some(audio.clone()),
                updated_at: Utc::now(),
            },
        };
        self.store_entry(user.as_ref(), entry).await;

        Ok(audio)
    }

    fn cache_user(&self, identity: &dyn IdentityProvider) -> Option<UserIdentity> {
        match verified_user(identity) {
            Ok(user) => Some(user),
            Err(err) => {
                debug!(reason = %err, "Skipping answer cache");
                None
            }
        }
    }

    async fn lookup(&self, user: Option<&UserIdentity>, question_id: &str) -> Option<CachedAnswer> {
        let user = user?;
        match self.store.get(&user.user_id, question_id).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!(question_id, error = %err, "Answer cache read failed");
                None
            }
        }
    }

    async fn store_entry(&self, user: Option<&UserIdentity>, entry: CachedAnswer) {
        let Some(user) = user else { return };
        let question_id = entry.question_id.clone();
        if let Err(err) = self.store.put(&user.user_id, entry).await {
            warn!(%question_id, error = %err, "Answer cache write failed");
        }
    }
}

/// [`SpeechSynthesizer`] for one UI connection: the answer service's cache plus
/// the identity that connection was opened with.
pub struct CachedSpeech {
    service: Arc<AnswerService>,
    identity: Arc<dyn IdentityProvider>,
}

impl CachedSpeech {
    pub fn new(service: Arc<AnswerService>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self { service, identity }
    }
}

#[async_trait]
impl SpeechSynthesizer for CachedSpeech {
    async fn synthesize(&self, clip_id: &str, text: &str) -> AudioResult<String> {
        self.service.speech(self.identity.as_ref(), clip_id, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingGenerator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AnswerGenerator for CountingGenerator {
        async fn generate_answer(&self, question: &str) -> AudioResult<GeneratedAnswer> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(GeneratedAnswer {
                text: format!("answer #{} to {}", n, question),
                sources: vec![GroundingSource {
                    title: "Docs".to_string(),
                    uri: "https://example.com".to_string(),
                }],
            })
        }
    }

    #[derive(Default)]
    struct CountingSynth {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SpeechSynthesizer for CountingSynth {
        async fn synthesize(&self, _clip_id: &str, _text: &str) -> AudioResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("AAABAA==".to_string())
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl AnswerGenerator for FailingGenerator {
        async fn generate_answer(&self, _question: &str) -> AudioResult<GeneratedAnswer> {
            Err(AudioError::FetchFailed("HTTP 503".to_string()))
        }
    }

    fn question() -> Question {
        Question {
            id: "rust-1".to_string(),
            category: "Rust".to_string(),
            text: "Explain ownership.".to_string(),
        }
    }

    fn verified() -> StaticIdentity {
        StaticIdentity(Some(UserIdentity {
            user_id: "u1".to_string(),
            email_verified: true,
        }))
    }

    struct Fixture {
        store: Arc<MemoryAnswerStore>,
        generator: Arc<CountingGenerator>,
        synth: Arc<CountingSynth>,
        service: AnswerService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryAnswerStore::new());
        let generator = Arc::new(CountingGenerator::default());
        let synth = Arc::new(CountingSynth::default());
        let service = AnswerService::new(store.clone(), generator.clone(), synth.clone());
        Fixture {
            store,
            generator,
            synth,
            service,
        }
    }

    #[tokio::test]
    async fn test_verified_user_hits_cache() {
        let f = fixture();
        let identity = verified();

        let first = f.service.answer(&identity, &question()).await.unwrap();
        let second = f.service.answer(&identity, &question()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_unverified_user_skips_cache() {
        let f = fixture();
        let identity = StaticIdentity(Some(UserIdentity {
            user_id: "u1".to_string(),
            email_verified: false,
        }));

        let first = f.service.answer(&identity, &question()).await.unwrap();
        let second = f.service.answer(&identity, &question()).await.unwrap();

        assert_ne!(first.answer, second.answer);
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.store.len().await, 0);
    }

    #[tokio::test]
    async fn test_anonymous_audio_is_still_synthesized() {
        let f = fixture();
        let audio = f.service.audio(&StaticIdentity(None), &question()).await.unwrap();

        assert_eq!(audio, "AAABAA==");
        assert_eq!(f.synth.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.len().await, 0);
    }

    #[tokio::test]
    async fn test_audio_is_cached_alongside_answer() {
        let f = fixture();
        let identity = verified();

        f.service.audio(&identity, &question()).await.unwrap();
        f.service.audio(&identity, &question()).await.unwrap();

        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.synth.calls.load(Ordering::SeqCst), 1);

        let entry = f.store.get("u1", "rust-1").await.unwrap().unwrap();
        assert!(entry.audio_base64.is_some());
        assert_eq!(entry.sources.len(), 1);
    }

    #[tokio::test]
    async fn test_speech_for_changed_text_resynthesizes() {
        let f = fixture();
        let identity = verified();

        f.service.speech(&identity, "clip", "first text").await.unwrap();
        f.service.speech(&identity, "clip", "first text").await.unwrap();
        f.service.speech(&identity, "clip", "second text").await.unwrap();

        assert_eq!(f.synth.calls.load(Ordering::SeqCst), 2);
        let entry = f.store.get("u1", "clip").await.unwrap().unwrap();
        assert_eq!(entry.answer, "second text");
    }

    #[tokio::test]
    async fn test_generator_error_propagates() {
        let store = Arc::new(MemoryAnswerStore::new());
        let service = AnswerService::new(
            store.clone(),
            Arc::new(FailingGenerator),
            Arc::new(CountingSynth::default()),
        );

        let err = service.answer(&verified(), &question()).await.unwrap_err();
        assert_eq!(err, AudioError::FetchFailed("HTTP 503".to_string()));
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_cached_speech_uses_connection_identity() {
        let f = fixture();
        let service = Arc::new(f.service);
        let speech = CachedSpeech::new(service, Arc::new(verified()));

        speech.synthesize("clip", "hello").await.unwrap();
        speech.synthesize("clip", "hello").await.unwrap();

        assert_eq!(f.synth.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_verified_user_gate() {
        assert_eq!(verified_user(&StaticIdentity(None)), Err(AudioError::AuthRequired));
        assert!(verified_user(&verified()).is_ok());
    }
}
