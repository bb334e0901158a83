//! # Voice WebSocket Handler
//!
//! One `/ws/voice` connection is one UI. Each connection owns a Clip Player and a
//! Live Session Controller, and this actor is the bridge between them and the
//! browser.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: Server sends `ready` with the audio formats it expects
//! 2. **Control**: Client sends JSON messages (`start_session`, `stop_session`,
//!    `play_clip`, `play_question`, `stop_clip`, `ping`/`pong`)
//! 3. **Microphone**: While a live session runs, binary messages carry
//!    little-endian `f32` mono frames at the capture rate
//! 4. **Playback**: Server sends `schedule` messages (base64 PCM16 plus a start
//!    time on that channel's clock) and `source_stopped`/`source_ended`
//! 5. **State**: `session_state`, `playing`, transcripts and errors as they happen
//!
//! ## Clocks:
//! Each channel (`clip`, `live`) has its own clock starting at 0.0 when the
//! connection opens. A `schedule` start time is seconds on that clock.
//!
//! ## Key Rust Concepts:
//! - **Actor model**: Each connection is an actix actor; background work runs in
//!   `tokio::spawn` and reports back through `addr.do_send`
//! - **add_message_stream**: Player and session channels are merged into the
//!   actor's mailbox, and ending them does not stop the actor

use crate::answers::{AnswerService, CachedSpeech, IdentityProvider, StaticIdentity};
use crate::audio::live::{
    LiveAudioFormat, LiveSessionController, MicrophoneSource, MicrophoneStream, SessionNotice,
    SessionState,
};
use crate::audio::output::{lock, OutputChannel, OutputEvent, PlaybackEvent, SourceId, StreamOutput};
use crate::audio::pcm::{encode_base64_pcm, f32_frame_from_bytes};
use crate::audio::player::{ClipPlayer, ClipRequest, PlayOutcome};
use crate::audio::{AudioError, AudioResult};
use crate::error::AppError;
use crate::handlers::request_identity;
use crate::questions::Question;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::{UnboundedReceiverStream, WatchStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Microphone frames buffered between the socket and the uplink task.
const MIC_QUEUE: usize = 32;

/// Messages from the UI.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a live voice session. `sample_rate` overrides the configured capture rate.
    StartSession {
        #[serde(default)]
        sample_rate: Option<u32>,
    },
    StopSession,
    /// Speak arbitrary text as clip `id`
    PlayClip { id: String, text: String },
    /// Speak the answer to a catalog question
    PlayQuestion { id: String },
    StopClip,
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    User,
    Model,
}

/// Messages to the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ready {
        connection_id: String,
        capture_sample_rate: u32,
        frame_size: usize,
        output_sample_rate: u32,
    },
    Schedule {
        channel: OutputChannel,
        source: SourceId,
        /// Seconds on the channel's clock
        start: f64,
        duration: f64,
        sample_rate: u32,
        sequence: u64,
        /// Base64 little-endian PCM16, mono
        audio: String,
    },
    SourceEnded {
        channel: OutputChannel,
        source: SourceId,
    },
    SourceStopped {
        channel: OutputChannel,
        source: SourceId,
    },
    SessionState {
        state: SessionState,
    },
    Playing {
        playing: bool,
        clip_id: Option<String>,
    },
    Transcript {
        role: TranscriptRole,
        text: String,
    },
    TurnComplete,
    Interrupted,
    Error {
        code: String,
        message: String,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
}

impl From<OutputEvent> for ServerMessage {
    fn from(event: OutputEvent) -> Self {
        let channel = event.channel;
        match event.event {
            PlaybackEvent::Scheduled { source, slot, chunk } => ServerMessage::Schedule {
                channel,
                source,
                start: slot.start,
                duration: slot.duration,
                sample_rate: chunk.sample_rate,
                sequence: chunk.sequence,
                audio: encode_base64_pcm(&chunk.samples),
            },
            PlaybackEvent::Ended { source } => ServerMessage::SourceEnded { channel, source },
            PlaybackEvent::Stopped { source } => ServerMessage::SourceStopped { channel, source },
        }
    }
}

impl From<SessionNotice> for ServerMessage {
    fn from(notice: SessionNotice) -> Self {
        match notice {
            SessionNotice::State(state) => ServerMessage::SessionState { state },
            SessionNotice::InputTranscript(text) => ServerMessage::Transcript {
                role: TranscriptRole::User,
                text,
            },
            SessionNotice::OutputTranscript(text) => ServerMessage::Transcript {
                role: TranscriptRole::Model,
                text,
            },
            SessionNotice::TurnComplete => ServerMessage::TurnComplete,
            SessionNotice::Interrupted => ServerMessage::Interrupted,
            SessionNotice::Error(message) => ServerMessage::Error {
                code: "live_session_error".to_string(),
                message,
            },
        }
    }
}

impl ServerMessage {
    fn failure(err: &AudioError) -> Self {
        ServerMessage::Error {
            code: error_code(err).to_string(),
            message: err.to_string(),
        }
    }
}

fn error_code(err: &AudioError) -> &'static str {
    match err {
        AudioError::AuthRequired => "auth_required",
        AudioError::FetchFailed(_) => "fetch_failed",
        AudioError::DecodeFailed(_) => "decode_failed",
        AudioError::ConnectionFailed(_) => "connection_failed",
        AudioError::MicrophoneUnavailable(_) => "microphone_unavailable",
        AudioError::SessionAlreadyActive => "session_already_active",
        AudioError::OutputClosed => "output_closed",
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

struct MicInner {
    sender: Option<mpsc::Sender<Vec<f32>>>,
    sample_rate: u32,
    closed: bool,
}

/// Microphone fed by binary WebSocket frames.
///
/// Frames that arrive while no session is listening, or faster than the uplink
/// drains them, are dropped.
pub struct ChannelMicrophone {
    inner: Mutex<MicInner>,
}

impl ChannelMicrophone {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Mutex::new(MicInner {
                sender: None,
                sample_rate,
                closed: false,
            }),
        }
    }

    /// Applies to the next `open()`.
    pub fn set_sample_rate(&self, sample_rate: u32) {
        lock(&self.inner).sample_rate = sample_rate;
    }

    /// Hand one frame to the open stream. Returns whether it was accepted.
    pub fn push(&self, frame: Vec<f32>) -> bool {
        let mut inner = lock(&self.inner);
        let Some(sender) = inner.sender.as_ref() else {
            return false;
        };
        match sender.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Microphone queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                inner.sender = None;
                false
            }
        }
    }

    /// The client is gone; no further stream can be opened.
    pub fn close(&self) {
        let mut inner = lock(&self.inner);
        inner.closed = true;
        inner.sender = None;
    }
}

impl MicrophoneSource for ChannelMicrophone {
    fn open(&self) -> AudioResult<MicrophoneStream> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(AudioError::MicrophoneUnavailable(
                "client disconnected".to_string(),
            ));
        }
        if inner.sample_rate == 0 {
            return Err(AudioError::MicrophoneUnavailable(
                "capture sample rate is 0".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(MIC_QUEUE);
        inner.sender = Some(tx);
        Ok(MicrophoneStream {
            frames: rx,
            sample_rate: inner.sample_rate,
        })
    }
}

/// Everything the actor's mailbox receives besides raw socket frames.
#[derive(Message)]
#[rtype(result = "()")]
enum Outbound {
    Playback(OutputEvent),
    Session(SessionNotice),
    Playing(bool),
    Failure(AudioError),
}

/// Channels handed to the actor once it starts.
struct Feeds {
    output: mpsc::UnboundedReceiver<OutputEvent>,
    notices: mpsc::UnboundedReceiver<SessionNotice>,
    playing: watch::Receiver<bool>,
}

pub struct VoiceWebSocket {
    connection_id: Uuid,
    state: web::Data<AppState>,
    identity: Arc<dyn IdentityProvider>,
    player: Arc<ClipPlayer>,
    live: LiveSessionController,
    microphone: Arc<ChannelMicrophone>,
    feeds: Option<Feeds>,
    capture_sample_rate: u32,
    input_sample_rate: u32,
    frame_size: usize,
    output_sample_rate: u32,
    last_heartbeat: Instant,
}

impl VoiceWebSocket {
    pub fn new(state: web::Data<AppState>, identity: StaticIdentity) -> Self {
        let config = state.get_config();
        let identity: Arc<dyn IdentityProvider> = Arc::new(identity);

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let speech = Arc::new(CachedSpeech::new(state.answers.clone(), identity.clone()));
        let player = Arc::new(ClipPlayer::new(
            speech,
            Arc::new(StreamOutput::new(OutputChannel::Clip, output_tx.clone())),
            config.audio.output_sample_rate,
        ));

        let microphone = Arc::new(ChannelMicrophone::new(config.audio.capture_sample_rate));
        let live = LiveSessionController::new(
            state.live_connector.clone(),
            microphone.clone(),
            Arc::new(StreamOutput::new(OutputChannel::Live, output_tx)),
            LiveAudioFormat {
                input_sample_rate: config.audio.input_sample_rate,
                output_sample_rate: config.audio.output_sample_rate,
            },
            notice_tx,
        );

        let playing = player.subscribe();

        Self {
            connection_id: Uuid::new_v4(),
            state,
            identity,
            player,
            live,
            microphone,
            feeds: Some(Feeds {
                output: output_rx,
                notices: notice_rx,
                playing,
            }),
            capture_sample_rate: config.audio.capture_sample_rate,
            input_sample_rate: config.audio.input_sample_rate,
            frame_size: config.audio.frame_size,
            output_sample_rate: config.audio.output_sample_rate,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(error = %err, "Failed to serialize voice message"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        self.send(
            ctx,
            &ServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    fn handle_client_message(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message {
            ClientMessage::StartSession { sample_rate } => {
                let rate = sample_rate.unwrap_or(self.capture_sample_rate);
                if rate < self.input_sample_rate {
                    self.send_error(
                        ctx,
                        "invalid_sample_rate",
                        &format!(
                            "capture rate {} is below the session input rate {}",
                            rate, self.input_sample_rate
                        ),
                    );
                    return;
                }
                self.microphone.set_sample_rate(rate);

                let live = self.live.clone();
                let addr = ctx.address();
                tokio::spawn(async move {
                    if let Err(err) = live.start().await {
                        addr.do_send(Outbound::Failure(err));
                    }
                });
            }
            ClientMessage::StopSession => {
                let live = self.live.clone();
                tokio::spawn(async move { live.stop().await });
            }
            // Requests are registered here, in mailbox order, so a later stop_clip or
            // play_* always supersedes them no matter when the spawned work runs.
            ClientMessage::PlayClip { id, text } => {
                let request = self.player.begin(&id);
                let player = self.player.clone();
                let addr = ctx.address();
                tokio::spawn(async move {
                    let outcome = player.speak(request, &text).await;
                    report_clip(&id, outcome, &addr);
                });
            }
            ClientMessage::PlayQuestion { id } => {
                let Some(question) = self.state.catalog.get(&id).cloned() else {
                    self.send_error(ctx, "unknown_question", &format!("question '{}'", id));
                    return;
                };
                let request = self.player.begin(&question.id);
                let player = self.player.clone();
                let answers = self.state.answers.clone();
                let identity = self.identity.clone();
                let addr = ctx.address();
                tokio::spawn(async move {
                    let outcome = speak_answer(&player, request, &answers, identity.as_ref(), &question).await;
                    report_clip(&question.id, outcome, &addr);
                });
            }
            ClientMessage::StopClip => self.player.stop(),
            ClientMessage::Ping { timestamp } => self.send(ctx, &ServerMessage::Pong { timestamp }),
            ClientMessage::Pong { .. } => {}
        }
    }

    fn handle_microphone_frame(&mut self, bytes: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        match f32_frame_from_bytes(bytes) {
            Ok(frame) => {
                if !self.microphone.push(frame) {
                    debug!(bytes = bytes.len(), "Microphone frame not forwarded");
                }
            }
            Err(err) => self.send(ctx, &ServerMessage::failure(&err)),
        }
    }
}

/// Generate (or look up) the answer to `question` and speak it. Both steps run
/// under `request`, so a stop or newer clip during either one discards the result.
async fn speak_answer(
    player: &ClipPlayer,
    request: ClipRequest,
    answers: &AnswerService,
    identity: &dyn IdentityProvider,
    question: &Question,
) -> AudioResult<PlayOutcome> {
    debug!(clip_id = request.id(), "Fetching answer audio");
    player
        .finish(request, answers.audio(identity, question))
        .await
}

fn report_clip(id: &str, outcome: AudioResult<PlayOutcome>, addr: &Addr<VoiceWebSocket>) {
    match outcome {
        Ok(PlayOutcome::Started { source, .. }) => debug!(clip_id = %id, source, "Clip started"),
        Ok(PlayOutcome::Stale) => debug!(clip_id = %id, "Clip superseded before it started"),
        Err(err) => addr.do_send(Outbound::Failure(err)),
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "Voice connection started");

        if let Some(feeds) = self.feeds.take() {
            ctx.add_message_stream(UnboundedReceiverStream::new(feeds.output).map(Outbound::Playback));
            ctx.add_message_stream(UnboundedReceiverStream::new(feeds.notices).map(Outbound::Session));
            ctx.add_message_stream(WatchStream::new(feeds.playing).map(Outbound::Playing));
        }

        self.send(
            ctx,
            &ServerMessage::Ready {
                connection_id: self.connection_id.to_string(),
                capture_sample_rate: self.capture_sample_rate,
                frame_size: self.frame_size,
                output_sample_rate: self.output_sample_rate,
            },
        );

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(connection_id = %act.connection_id, "Voice connection heartbeat timeout");
                ctx.stop();
            } else {
                act.send(ctx, &ServerMessage::Ping { timestamp: now_millis() });
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.microphone.close();
        self.player.stop();

        let live = self.live.clone();
        tokio::spawn(async move { live.stop().await });

        self.state.release_session();
        info!(connection_id = %self.connection_id, "Voice connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => self.handle_client_message(message, ctx),
                Err(err) => {
                    warn!(error = %err, "Unreadable voice control message");
                    self.send_error(ctx, "invalid_message", &err.to_string());
                }
            },
            Ok(ws::Message::Binary(bytes)) => self.handle_microphone_frame(&bytes, ctx),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = %self.connection_id, ?reason, "Voice connection closing");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                self.send_error(ctx, "unsupported_frame", "fragmented messages are not supported");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "Voice WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        let message = match msg {
            Outbound::Playback(event) => ServerMessage::from(event),
            Outbound::Session(notice) => ServerMessage::from(notice),
            Outbound::Playing(playing) => ServerMessage::Playing {
                playing,
                clip_id: if playing { self.player.active_id() } else { None },
            },
            Outbound::Failure(err) => ServerMessage::failure(&err),
        };
        self.send(ctx, &message);
    }
}

pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    if !state.try_acquire_session() {
        let limit = state.get_config().performance.max_concurrent_sessions;
        warn!(limit, "Voice session limit reached, rejecting connection");
        return Err(AppError::TooManySessions(format!("limit of {} voice sessions reached", limit)).into());
    }

    info!(peer = ?req.connection_info().peer_addr(), "New voice connection request");

    let actor = VoiceWebSocket::new(state.clone(), request_identity(&req));
    let response = ws::start(actor, &req, stream);
    if response.is_err() {
        // The actor never started, so stopped() will not release the slot.
        state.release_session();
    }
    response
}
