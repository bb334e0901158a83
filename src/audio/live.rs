//! # Live Voice Session Controller
//!
//! Manages one duplex voice conversation with the remote conversational service.
//! Microphone frames stream out; model audio streams in and is scheduled
//! back-to-back on the output clock.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: No connection, nothing scheduled
//! 2. **Connecting**: Microphone acquired, connection being opened
//! 3. **Active**: Uplink and downlink tasks running
//! 4. Back to **Idle** on `stop()`, remote close, or remote error
//!
//! ## Scheduling:
//! Every inbound chunk starts at `max(next_start, clock_now)` and pushes
//! `next_start` to the end of that chunk. Chunks that arrive in a burst therefore
//! play in arrival order with no gap and no overlap. An `interrupted` signal from
//! the service (the user barged in) stops every scheduled source and resets
//! `next_start` to 0.
//!
//! ## Staleness:
//! Each `start()`/`stop()` bumps an epoch. Connection results and inbound events
//! tagged with an older epoch are ignored, so a slow connect that finishes after
//! the user pressed stop cannot revive the session.
//!
//! ## Key Rust Concepts:
//! - **Weak<T>**: Background tasks hold a weak reference so they never keep a
//!   dropped controller alive
//! - **JoinHandle::abort**: Cancels uplink/downlink tasks on teardown
//! - **async_trait**: Object-safe async collaborators for the connection

use crate::audio::error::{AudioError, AudioResult};
use crate::audio::output::{lock, AudioOutput, SourceId};
use crate::audio::pcm::{decode_base64_pcm, downsample, quantize, AudioChunk, PlaybackSlot};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Inbound message from the live service, already parsed from the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// The service finished its setup handshake
    Ready,
    /// Base64 PCM16 model audio
    Audio(String),
    /// The model was interrupted (user started speaking mid-response)
    Interrupted,
    /// The model finished a response turn
    TurnComplete,
    /// Transcription of the user's speech
    InputTranscript(String),
    /// Transcription of the model's speech
    OutputTranscript(String),
    /// The service closed the connection
    Closed(Option<String>),
    /// The service reported an error
    Error(String),
}

/// Outbound half of an open live connection.
#[async_trait]
pub trait LiveConnection: Send + Sync {
    /// Forward one frame of PCM16 audio at the service's input rate.
    async fn send_audio(&self, pcm: &[i16]) -> AudioResult<()>;

    /// Close the connection.
    async fn close(&self) -> AudioResult<()>;
}

/// Both halves of an open connection.
pub struct LiveLink {
    pub connection: Arc<dyn LiveConnection>,
    pub events: mpsc::Receiver<LiveEvent>,
}

/// Opens connections to the live service.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(&self) -> AudioResult<LiveLink>;
}

/// A captured microphone stream: float frames at `sample_rate`.
pub struct MicrophoneStream {
    pub frames: mpsc::Receiver<Vec<f32>>,
    pub sample_rate: u32,
}

/// Where microphone audio comes from.
pub trait MicrophoneSource: Send + Sync {
    fn open(&self) -> AudioResult<MicrophoneStream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
}

/// Things the UI wants to know about while a session runs.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    State(SessionState),
    InputTranscript(String),
    OutputTranscript(String),
    TurnComplete,
    Interrupted,
    Error(String),
}

/// The active connection. Only the controller ever holds one.
struct SessionHandle {
    id: Uuid,
    connection: Arc<dyn LiveConnection>,
}

struct LiveInner {
    state: SessionState,
    epoch: u64,
    handle: Option<SessionHandle>,
    next_start: f64,
    sources: BTreeSet<SourceId>,
    sequence: u64,
    tasks: Vec<JoinHandle<()>>,
}

/// Live-session settings taken from the audio configuration.
#[derive(Debug, Clone, Copy)]
pub struct LiveAudioFormat {
    /// Rate the service expects microphone audio at
    pub input_sample_rate: u32,
    /// Rate of the audio the service sends back
    pub output_sample_rate: u32,
}

struct Shared {
    connector: Arc<dyn LiveConnector>,
    microphone: Arc<dyn MicrophoneSource>,
    output: Arc<dyn AudioOutput>,
    format: LiveAudioFormat,
    notices: mpsc::UnboundedSender<SessionNotice>,
    inner: Mutex<LiveInner>,
}

/// Cloneable handle to one live voice session controller.
#[derive(Clone)]
pub struct LiveSessionController {
    shared: Arc<Shared>,
}

/// What the downlink should do after an event.
enum Flow {
    Continue,
    Teardown,
}

impl LiveSessionController {
    pub fn new(
        connector: Arc<dyn LiveConnector>,
        microphone: Arc<dyn MicrophoneSource>,
        output: Arc<dyn AudioOutput>,
        format: LiveAudioFormat,
        notices: mpsc::UnboundedSender<SessionNotice>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                microphone,
                output,
                format,
                notices,
                inner: Mutex::new(LiveInner {
                    state: SessionState::Idle,
                    epoch: 0,
                    handle: None,
                    next_start: 0.0,
                    sources: BTreeSet::new(),
                    sequence: 0,
                    tasks: Vec::new(),
                }),
            }),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        lock(&self.shared.inner).state
    }

    /// Clock time at which the next inbound chunk may start.
    #[cfg(test)]
    pub fn next_start_time(&self) -> f64 {
        lock(&self.shared.inner).next_start
    }

    /// Number of sources this session has scheduled that have not ended yet.
    #[cfg(test)]
    pub fn scheduled_sources(&self) -> usize {
        lock(&self.shared.inner).sources.len()
    }

    /// Open the microphone and the live connection.
    ///
    /// ## State Transition:
    /// Idle → Connecting → Active. On any failure the controller returns to Idle
    /// with nothing retained.
    pub async fn start(&self) -> AudioResult<()> {
        let epoch = {
            let mut inner = lock(&self.shared.inner);
            if inner.state != SessionState::Idle {
                return Err(AudioError::SessionAlreadyActive);
            }
            self.shared.clear_sources(&mut inner);
            inner.next_start = 0.0;
            inner.sequence = 0;
            inner.epoch += 1;
            inner.state = SessionState::Connecting;
            inner.epoch
        };
        self.shared.notify(SessionNotice::State(SessionState::Connecting));
        info!(epoch, "Live session connecting");

        let microphone = match self.shared.microphone.open() {
            Ok(microphone) => microphone,
            Err(err) => {
                error!(error = %err, "Could not acquire microphone");
                self.shared.abandon_start(epoch);
                return Err(err);
            }
        };

        let link = match self.shared.connector.connect().await {
            Ok(link) => link,
            Err(err) => {
                error!(error = %err, "Could not open live connection");
                self.shared.abandon_start(epoch);
                return Err(err);
            }
        };

        let handle = SessionHandle {
            id: Uuid::new_v4(),
            connection: link.connection.clone(),
        };
        let session_id = handle.id;

        {
            let mut inner = lock(&self.shared.inner);
            if inner.epoch == epoch && inner.state == SessionState::Connecting {
                let weak = Arc::downgrade(&self.shared);
                let uplink = tokio::spawn(pump_microphone(
                    microphone,
                    self.shared.format.input_sample_rate,
                    link.connection.clone(),
                ));
                let downlink = tokio::spawn(pump_events(weak, epoch, link.events));

                inner.handle = Some(handle);
                inner.tasks = vec![uplink, downlink];
                inner.state = SessionState::Active;
                drop(inner);

                self.shared.notify(SessionNotice::State(SessionState::Active));
                info!(%session_id, epoch, "Live session active");
                return Ok(());
            }
        }

        // stop() ran while we were connecting.
        warn!(%session_id, "Live session stopped while connecting, closing connection");
        if let Err(err) = link.connection.close().await {
            warn!(error = %err, "Error closing abandoned live connection");
        }
        Err(AudioError::ConnectionFailed("session stopped while connecting".to_string()))
    }

    /// End the session. Safe in every state and on repeated calls.
    ///
    /// Connection close errors are logged and swallowed; teardown is best-effort.
    pub async fn stop(&self) {
        let (handle, tasks, was) = {
            let mut inner = lock(&self.shared.inner);
            self.shared.reset(&mut inner)
        };

        for task in tasks {
            task.abort();
        }

        if let Some(handle) = handle {
            if let Err(err) = handle.connection.close().await {
                warn!(session_id = %handle.id, error = %err, "Error closing live connection");
            }
            info!(session_id = %handle.id, "Live session stopped");
        }

        if was != SessionState::Idle {
            self.shared.notify(SessionNotice::State(SessionState::Idle));
        }
    }
}

impl Shared {
    fn notify(&self, notice: SessionNotice) {
        // Nobody listening is fine.
        let _ = self.notices.send(notice);
    }

    fn clear_sources(&self, inner: &mut LiveInner) {
        for source in std::mem::take(&mut inner.sources) {
            self.output.stop(source);
        }
    }

    /// Return to Idle, handing back whatever needs async cleanup.
    fn reset(&self, inner: &mut LiveInner) -> (Option<SessionHandle>, Vec<JoinHandle<()>>, SessionState) {
        let was = inner.state;
        inner.epoch += 1;
        inner.state = SessionState::Idle;
        inner.next_start = 0.0;
        self.clear_sources(inner);
        (inner.handle.take(), std::mem::take(&mut inner.tasks), was)
    }

    fn abandon_start(&self, epoch: u64) {
        let mut inner = lock(&self.inner);
        if inner.epoch == epoch && inner.state == SessionState::Connecting {
            inner.state = SessionState::Idle;
            drop(inner);
            self.notify(SessionNotice::State(SessionState::Idle));
        }
    }

    fn handle_event(self: &Arc<Self>, epoch: u64, event: LiveEvent) -> Flow {
        let mut inner = lock(&self.inner);
        if inner.epoch != epoch || inner.state != SessionState::Active {
            return Flow::Teardown;
        }

        match event {
            LiveEvent::Ready => {
                debug!("Live service ready");
            }
            LiveEvent::Audio(payload) => {
                let sequence = inner.sequence;
                inner.sequence += 1;
                match decode_base64_pcm(&payload, self.format.output_sample_rate, sequence) {
                    Ok(chunk) => {
                        if let Some(slot) = self.schedule(&mut inner, chunk) {
                            debug!(sequence, start = slot.start, duration = slot.duration, "Scheduled model audio");
                        }
                    }
                    Err(err) => error!(sequence, error = %err, "Dropping undecodable model audio"),
                }
            }
            LiveEvent::Interrupted => {
                info!(sources = inner.sources.len(), "Model interrupted, clearing playback");
                self.clear_sources(&mut inner);
                inner.next_start = 0.0;
                drop(inner);
                self.notify(SessionNotice::Interrupted);
            }
            LiveEvent::TurnComplete => {
                drop(inner);
                self.notify(SessionNotice::TurnComplete);
            }
            LiveEvent::InputTranscript(text) => {
                drop(inner);
                self.notify(SessionNotice::InputTranscript(text));
            }
            LiveEvent::OutputTranscript(text) => {
                drop(inner);
                self.notify(SessionNotice::OutputTranscript(text));
            }
            LiveEvent::Closed(reason) => {
                info!(reason = ?reason, "Live service closed the session");
                return Flow::Teardown;
            }
            LiveEvent::Error(message) => {
                error!(%message, "Live service error");
                drop(inner);
                self.notify(SessionNotice::Error(message));
                return Flow::Teardown;
            }
        }

        Flow::Continue
    }

    /// Place a chunk right after the previous one, or now if the timeline ran dry.
    fn schedule(self: &Arc<Self>, inner: &mut LiveInner, chunk: AudioChunk) -> Option<PlaybackSlot> {
        let start = inner.next_start.max(self.output.current_time());
        let handle = match self.output.start(chunk, start) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "Could not schedule model audio");
                return None;
            }
        };

        inner.next_start = handle.slot.end();
        inner.sources.insert(handle.id);

        let weak = Arc::downgrade(self);
        let source = handle.id;
        let ended = handle.ended;
        tokio::spawn(async move {
            if ended.await.is_ok() {
                if let Some(shared) = weak.upgrade() {
                    lock(&shared.inner).sources.remove(&source);
                }
            }
        });

        Some(handle.slot)
    }

    /// Tear down after the remote side ended the session.
    fn remote_teardown(&self, epoch: u64) {
        let (handle, tasks, was) = {
            let mut inner = lock(&self.inner);
            if inner.epoch != epoch {
                return;
            }
            self.reset(&mut inner)
        };

        // The current task is among these; aborting it takes effect at its next
        // await point, and it has none left.
        for task in tasks {
            task.abort();
        }

        if let Some(handle) = handle {
            tokio::spawn(async move {
                if let Err(err) = handle.connection.close().await {
                    debug!(session_id = %handle.id, error = %err, "Close after remote end failed");
                }
            });
        }

        if was != SessionState::Idle {
            self.notify(SessionNotice::State(SessionState::Idle));
        }
    }
}

/// Uplink: convert and forward every captured frame as soon as it arrives.
async fn pump_microphone(
    mut microphone: MicrophoneStream,
    input_sample_rate: u32,
    connection: Arc<dyn LiveConnection>,
) {
    while let Some(frame) = microphone.frames.recv().await {
        let pcm = quantize(&downsample(&frame, microphone.sample_rate, input_sample_rate));
        if let Err(err) = connection.send_audio(&pcm).await {
            debug!(error = %err, samples = pcm.len(), "Dropped microphone frame");
        }
    }
    debug!("Microphone stream ended");
}

/// Downlink: feed inbound events to the controller until the session ends.
async fn pump_events(shared: Weak<Shared>, epoch: u64, mut events: mpsc::Receiver<LiveEvent>) {
    while let Some(event) = events.recv().await {
        let Some(controller) = shared.upgrade() else {
            return;
        };
        if let Flow::Teardown = controller.handle_event(epoch, event) {
            controller.remote_teardown(epoch);
            return;
        }
    }

    if let Some(controller) = shared.upgrade() {
        info!("Live event stream ended");
        controller.remote_teardown(epoch);
    }
}
