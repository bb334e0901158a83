//! # Gemini REST Client
//!
//! One `generateContent` endpoint serves two purposes:
//! - **Answers**: Text generation with Google Search grounding; the cited pages
//!   come back in `groundingMetadata`
//! - **Speech**: The TTS model returns base64 PCM16 at 24kHz in
//!   `candidates[0].content.parts[].inlineData.data`
//!
//! Models, voice, timeout and key are read from the shared configuration on every
//! call, so `PUT /api/v1/config` takes effect on the next request.
//!
//! Request bodies and response parsing are plain functions over
//! `serde_json::Value` so they can be tested without a network.

use crate::answers::{AnswerGenerator, GeneratedAnswer, GroundingSource};
use crate::audio::player::SpeechSynthesizer;
use crate::audio::{AudioError, AudioResult};
use crate::config::{provider_settings, ProviderConfig, SharedConfig};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, error};

const ANSWER_INSTRUCTIONS: &str = "You are an experienced interviewer helping a candidate \
prepare. Give a concise, well-structured model answer to the interview question below, the \
way a strong candidate would say it out loud. Use short paragraphs and no markdown tables.";

pub struct GeminiClient {
    http: reqwest::Client,
    config: SharedConfig,
}

/// One `generateContent` call, resolved against the settings of the moment.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentCall {
    pub model: String,
    pub body: Value,
}

impl GeminiClient {
    pub fn new(config: SharedConfig) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, config })
    }

    pub fn answer_call(&self, question: &str) -> ContentCall {
        let provider = provider_settings(&self.config);
        ContentCall {
            model: provider.answer_model,
            body: answer_request(question),
        }
    }

    pub fn speech_call(&self, text: &str) -> ContentCall {
        let provider = provider_settings(&self.config);
        ContentCall {
            body: speech_request(text, &provider.voice),
            model: provider.tts_model,
        }
    }

    async fn generate_content(&self, call: ContentCall) -> AudioResult<Value> {
        let provider: ProviderConfig = provider_settings(&self.config);
        if provider.api_key.trim().is_empty() {
            return Err(AudioError::FetchFailed("no provider API key configured".to_string()));
        }

        let model = call.model.as_str();
        let url = format!(
            "{}/models/{}:generateContent",
            provider.api_base.trim_end_matches('/'),
            model
        );
        let started = Instant::now();

        let response = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(provider.request_timeout_secs))
            .header("x-goog-api-key", &provider.api_key)
            .json(&call.body)
            .send()
            .await
            .map_err(|e| {
                error!(model, error = %e, "Provider request failed");
                AudioError::FetchFailed(e.to_string())
            })?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| AudioError::FetchFailed(format!("invalid provider response: {}", e)))?;

        debug!(
            model,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Provider responded"
        );

        if !status.is_success() {
            let message = provider_error_message(&payload).unwrap_or("no error message");
            error!(model, status = status.as_u16(), message, "Provider returned an error");
            return Err(AudioError::FetchFailed(format!("HTTP {}: {}", status.as_u16(), message)));
        }

        Ok(payload)
    }
}

#[async_trait]
impl AnswerGenerator for GeminiClient {
    async fn generate_answer(&self, question: &str) -> AudioResult<GeneratedAnswer> {
        let payload = self.generate_content(self.answer_call(question)).await?;
        parse_answer(&payload)
    }
}

#[async_trait]
impl SpeechSynthesizer for GeminiClient {
    async fn synthesize(&self, clip_id: &str, text: &str) -> AudioResult<String> {
        let call = self.speech_call(text);
        debug!(clip_id, model = %call.model, "Requesting speech");
        let payload = self.generate_content(call).await?;
        parse_inline_audio(&payload)
    }
}

pub fn answer_request(question: &str) -> Value {
    json!({
        "systemInstruction": { "parts": [{ "text": ANSWER_INSTRUCTIONS }] },
        "contents": [{ "role": "user", "parts": [{ "text": question }] }],
        "tools": [{ "google_search": {} }]
    })
}

pub fn speech_request(text: &str, voice: &str) -> Value {
    json!({
        "contents": [{ "parts": [{ "text": text }] }],
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
            }
        }
    })
}

fn first_candidate(payload: &Value) -> AudioResult<&Value> {
    payload
        .pointer("/candidates/0")
        .ok_or_else(|| AudioError::FetchFailed("provider returned no candidates".to_string()))
}

fn parts(candidate: &Value) -> impl Iterator<Item = &Value> {
    candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

/// Joined text parts plus de-duplicated grounding sources.
pub fn parse_answer(payload: &Value) -> AudioResult<GeneratedAnswer> {
    let candidate = first_candidate(payload)?;

    let text = parts(candidate)
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    if text.trim().is_empty() {
        return Err(AudioError::FetchFailed("provider returned an empty answer".to_string()));
    }

    let mut seen = HashSet::new();
    let sources = candidate
        .pointer("/groundingMetadata/groundingChunks")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|chunk| {
            let web = chunk.get("web")?;
            let uri = web.get("uri")?.as_str()?.to_string();
            let title = web
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or(&uri)
                .to_string();
            Some(GroundingSource { title, uri })
        })
        .filter(|source| seen.insert(source.uri.clone()))
        .collect();

    Ok(GeneratedAnswer {
        text: text.trim().to_string(),
        sources,
    })
}

/// The base64 audio payload of the first inline-data part.
pub fn parse_inline_audio(payload: &Value) -> AudioResult<String> {
    let candidate = first_candidate(payload)?;
    parts(candidate)
        .find_map(|part| part.pointer("/inlineData/data").and_then(Value::as_str))
        .map(str::to_string)
        .ok_or_else(|| AudioError::FetchFailed("provider returned no audio".to_string()))
}

fn provider_error_message(payload: &Value) -> Option<&str> {
    payload.pointer("/error/message").and_then(Value::as_str)
}
