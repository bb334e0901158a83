//! # Gemini Live Connector
//!
//! WebSocket client for the live conversational service, plugged into the
//! session controller through [`LiveConnector`].
//!
//! ## Wire Protocol:
//! 1. Open `{live_url}?key=...` and send one `setup` message (model, voice,
//!    transcription switches)
//! 2. Stream microphone audio as `realtimeInput` messages (base64 PCM16 at 16kHz)
//! 3. Read `serverContent` messages: model audio in `modelTurn.parts[].inlineData`,
//!    plus `interrupted`, `turnComplete` and transcriptions
//!
//! ## Key Rust Concepts:
//! - **StreamExt::split**: Separates the socket into a sink (shared behind a
//!   `tokio::sync::Mutex`, since sends are awaited) and a stream owned by the
//!   reader task

use crate::audio::live::{LiveConnection, LiveConnector, LiveEvent, LiveLink};
use crate::audio::pcm::encode_base64_pcm;
use crate::audio::{AudioError, AudioResult};
use crate::config::{provider_settings, SharedConfig};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_BUFFER: usize = 64;

const COACH_INSTRUCTIONS: &str = "You are a friendly interview coach running a mock interview. \
Ask one question at a time, let the candidate answer, then give brief, specific feedback \
before moving on.";

/// Opens live connections with the model and voice configured at connect time.
pub struct GeminiLiveConnector {
    config: SharedConfig,
    input_sample_rate: u32,
}

impl GeminiLiveConnector {
    pub fn new(config: SharedConfig, input_sample_rate: u32) -> Self {
        Self {
            config,
            input_sample_rate,
        }
    }

    /// Setup message for the next connection.
    pub fn setup(&self) -> Value {
        let provider = provider_settings(&self.config);
        setup_message(&provider.live_model, &provider.voice)
    }
}

#[async_trait]
impl LiveConnector for GeminiLiveConnector {
    async fn connect(&self) -> AudioResult<LiveLink> {
        let provider = provider_settings(&self.config);
        if provider.api_key.trim().is_empty() {
            return Err(AudioError::ConnectionFailed(
                "no provider API key configured".to_string(),
            ));
        }

        let url = format!("{}?key={}", provider.live_url, provider.api_key);
        let (socket, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| AudioError::ConnectionFailed(e.to_string()))?;
        let (mut sink, stream) = socket.split();

        let setup = self.setup();
        sink.send(Message::Text(setup.to_string()))
            .await
            .map_err(|e| AudioError::ConnectionFailed(format!("setup failed: {}", e)))?;
        info!(model = %provider.live_model, voice = %provider.voice, "Live connection opened");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(read_events(stream, tx));

        Ok(LiveLink {
            connection: Arc::new(GeminiLiveConnection {
                sink: Mutex::new(sink),
                input_sample_rate: self.input_sample_rate,
            }),
            events: rx,
        })
    }
}

struct GeminiLiveConnection {
    sink: Mutex<SplitSink<WsStream, Message>>,
    input_sample_rate: u32,
}

#[async_trait]
impl LiveConnection for GeminiLiveConnection {
    async fn send_audio(&self, pcm: &[i16]) -> AudioResult<()> {
        let message = realtime_input(pcm, self.input_sample_rate);
        self.sink
            .lock()
            .await
            .send(Message::Text(message.to_string()))
            .await
            .map_err(|e| AudioError::ConnectionFailed(e.to_string()))
    }

    async fn close(&self) -> AudioResult<()> {
        self.sink
            .lock()
            .await
            .close()
            .await
            .map_err(|e| AudioError::ConnectionFailed(e.to_string()))
    }
}

async fn read_events(mut stream: SplitStream<WsStream>, events: mpsc::Sender<LiveEvent>) {
    while let Some(frame) = stream.next().await {
        let parsed = match frame {
            Ok(Message::Text(text)) => parse_server_message(&text),
            // The service sends JSON in binary frames too
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => parse_server_message(text),
                Err(e) => Err(AudioError::DecodeFailed(e.to_string())),
            },
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|reason| !reason.is_empty());
                info!(reason = ?reason, "Live service closed the connection");
                let _ = events.send(LiveEvent::Closed(reason)).await;
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "Live connection error");
                let _ = events.send(LiveEvent::Error(e.to_string())).await;
                return;
            }
        };

        let batch = match parsed {
            Ok(batch) => batch,
            Err(err) => {
                warn!(error = %err, "Ignoring unreadable live message");
                continue;
            }
        };

        for event in batch {
            if events.send(event).await.is_err() {
                debug!("Live event receiver dropped, stopping reader");
                return;
            }
        }
    }

    let _ = events.send(LiveEvent::Closed(None)).await;
}

pub fn setup_message(model: &str, voice: &str) -> Value {
    json!({
        "setup": {
            "model": model,
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
                }
            },
            "systemInstruction": { "parts": [{ "text": COACH_INSTRUCTIONS }] },
            "inputAudioTranscription": {},
            "outputAudioTranscription": {}
        }
    })
}

pub fn realtime_input(pcm: &[i16], sample_rate: u32) -> Value {
    json!({
        "realtimeInput": {
            "audio": {
                "data": encode_base64_pcm(pcm),
                "mimeType": format!("audio/pcm;rate={}", sample_rate)
            }
        }
    })
}

/// Turn one server message into the events it carries, in playback order:
/// interruption first, then audio, transcripts, and turn completion last.
pub fn parse_server_message(text: &str) -> AudioResult<Vec<LiveEvent>> {
    let message: Value =
        serde_json::from_str(text).map_err(|e| AudioError::DecodeFailed(e.to_string()))?;
    let mut events = Vec::new();

    if message.get("setupComplete").is_some() {
        events.push(LiveEvent::Ready);
    }

    if let Some(content) = message.get("serverContent") {
        if content.get("interrupted").and_then(Value::as_bool) == Some(true) {
            events.push(LiveEvent::Interrupted);
        }

        let audio = content
            .pointer("/modelTurn/parts")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|part| part.pointer("/inlineData/data").and_then(Value::as_str))
            .map(|data| LiveEvent::Audio(data.to_string()));
        events.extend(audio);

        if let Some(text) = content.pointer("/inputTranscription/text").and_then(Value::as_str) {
            events.push(LiveEvent::InputTranscript(text.to_string()));
        }
        if let Some(text) = content.pointer("/outputTranscription/text").and_then(Value::as_str) {
            events.push(LiveEvent::OutputTranscript(text.to_string()));
        }

        if content.get("turnComplete").and_then(Value::as_bool) == Some(true) {
            events.push(LiveEvent::TurnComplete);
        }
    }

    if let Some(go_away) = message.get("goAway") {
        let time_left = go_away.get("timeLeft").and_then(Value::as_str).unwrap_or("unknown");
        events.push(LiveEvent::Closed(Some(format!(
            "service is going away (time left: {})",
            time_left
        ))));
    }

    if let Some(error) = message.pointer("/error/message").and_then(Value::as_str) {
        events.push(LiveEvent::Error(error.to_string()));
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{shared, AppConfig};

    #[test]
    fn test_setup_complete() {
        let events = parse_server_message(r#"{"setupComplete": {}}"#).unwrap();
        assert_eq!(events, vec![LiveEvent::Ready]);
    }

    #[test]
    fn test_model_turn_audio_parts() {
        let events = parse_server_message(
            r#"{"serverContent": {"modelTurn": {"parts": [
                {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}},
                {"text": "ignored"},
                {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "BBB="}}
            ]}}}"#,
        )
        .unwrap();
        assert_eq!(
            events,
            vec![LiveEvent::Audio("AAA=".to_string()), LiveEvent::Audio("BBB=".to_string())]
        );
    }

    #[test]
    fn test_interrupted_and_turn_complete_ordering() {
        let events = parse_server_message(
            r#"{"serverContent": {"turnComplete": true, "interrupted": true,
                "outputTranscription": {"text": "Sure"}}}"#,
        )
        .unwrap();
        assert_eq!(
            events,
            vec![
                LiveEvent::Interrupted,
                LiveEvent::OutputTranscript("Sure".to_string()),
                LiveEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_input_transcription() {
        let events =
            parse_server_message(r#"{"serverContent": {"inputTranscription": {"text": "hello"}}}"#)
                .unwrap();
        assert_eq!(events, vec![LiveEvent::InputTranscript("hello".to_string())]);
    }

    #[test]
    fn test_go_away_closes() {
        let events = parse_server_message(r#"{"goAway": {"timeLeft": "5s"}}"#).unwrap();
        assert!(matches!(events.as_slice(), [LiveEvent::Closed(Some(_))]));
    }

    #[test]
    fn test_unknown_and_invalid_messages() {
        assert!(parse_server_message(r#"{"usageMetadata": {}}"#).unwrap().is_empty());
        assert!(parse_server_message("not json").is_err());
    }

    #[test]
    fn test_realtime_input_message() {
        let message = realtime_input(&[0, 1], 16_000);
        assert_eq!(
            message.pointer("/realtimeInput/audio/mimeType").unwrap(),
            "audio/pcm;rate=16000"
        );
        assert_eq!(message.pointer("/realtimeInput/audio/data").unwrap(), "AAABAA==");
    }

    #[test]
    fn test_setup_message() {
        let message = setup_message("models/live", "Kore");
        assert_eq!(message.pointer("/setup/model").unwrap(), "models/live");
        assert!(message.pointer("/setup/inputAudioTranscription").is_some());
    }

    #[test]
    fn test_setup_uses_current_model_and_voice() {
        let config = shared(AppConfig::default());
        let connector = GeminiLiveConnector::new(config.clone(), 16_000);
        let voice_path = "/setup/generationConfig/speechConfig/voiceConfig/prebuiltVoiceConfig/voiceName";
        assert_eq!(connector.setup().pointer(voice_path).unwrap(), "Kore");

        config
            .write()
            .unwrap()
            .update_from_json(r#"{"provider": {"voice": "Puck", "live_model": "models/other"}}"#)
            .unwrap();

        let setup = connector.setup();
        assert_eq!(setup.pointer(voice_path).unwrap(), "Puck");
        assert_eq!(setup.pointer("/setup/model").unwrap(), "models/other");
    }

    #[tokio::test]
    async fn test_connect_without_key_fails() {
        let connector = GeminiLiveConnector::new(shared(AppConfig::default()), 16_000);
        let err = connector.connect().await.err().unwrap();
        assert!(matches!(err, AudioError::ConnectionFailed(_)));
    }
}
