//! # Clip Player
//!
//! Plays one synthesized answer clip at a time. A clip is requested with an id and
//! its text; speech is fetched from a [`SpeechSynthesizer`], decoded and started
//! immediately on the player's own output clock.
//!
//! ## Ordering:
//! Requests can overlap: the user may click "listen" on a second question while the
//! first one is still being synthesized. Every request and `stop` bumps a generation
//! counter. A fetch that completes under an older generation is discarded
//! ([`PlayOutcome::Stale`]), so only the most recently requested clip ever starts.
//!
//! A request can be registered up front with [`ClipPlayer::begin`] and completed
//! later with any audio source ([`ClipPlayer::finish`]), so work that has to happen
//! before speech can even be requested (generating the answer text) is covered by
//! the same ordering.
//!
//! ## Observable state:
//! `is_playing` flips to `true` when a clip starts and back to `false` on natural
//! end, explicit stop, or any failure. UIs subscribe through [`ClipPlayer::subscribe`].
//!
//! ## Key Rust Concepts:
//! - **async_trait**: Object-safe async collaborator (`Arc<dyn SpeechSynthesizer>`)
//! - **watch channel**: A single observable value with change notification
//! - **Mutex never held across .await**: State is read and written in short
//!   synchronous sections before and after the fetch

use crate::audio::error::AudioResult;
use crate::audio::output::{lock, AudioOutput, SourceId};
use crate::audio::pcm::{decode_base64_pcm, PlaybackSlot};
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Text-to-speech collaborator.
///
/// Returns base64-encoded 16-bit PCM, mono, at the player's output rate.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, clip_id: &str, text: &str) -> AudioResult<String>;
}

/// Result of a [`ClipPlayer::play`] call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayOutcome {
    /// The clip is on the output timeline
    Started { source: SourceId, slot: PlaybackSlot },
    /// A newer request (or a stop) superseded this one while it was fetching
    Stale,
}

#[derive(Debug, Default)]
struct ClipState {
    /// Bumped by every play and stop
    generation: u64,
    /// Id of the clip that is being fetched or played
    active_id: Option<String>,
    /// Source currently on the output
    current: Option<SourceId>,
    /// Arrival order of decoded clips
    sequence: u64,
}

/// A clip request registered with [`ClipPlayer::begin`]. It goes stale as soon as
/// another request or a stop is made on the same player.
#[derive(Debug)]
pub struct ClipRequest {
    id: String,
    generation: u64,
}

impl ClipRequest {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Plays one clip at a time with last-request-wins semantics.
pub struct ClipPlayer {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    output: Arc<dyn AudioOutput>,
    sample_rate: u32,
    state: Arc<Mutex<ClipState>>,
    playing: Arc<watch::Sender<bool>>,
}

impl ClipPlayer {
    /// `sample_rate` is the rate of the PCM the synthesizer returns.
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        output: Arc<dyn AudioOutput>,
        sample_rate: u32,
    ) -> Self {
        let (playing, _) = watch::channel(false);
        Self {
            synthesizer,
            output,
            sample_rate,
            state: Arc::new(Mutex::new(ClipState::default())),
            playing: Arc::new(playing),
        }
    }

    /// Fetch speech for `text` and play it, replacing whatever this player was doing.
    ///
    /// ## Steps:
    /// 1. Stop the current clip and mark `id` as the active request
    /// 2. Await the TTS fetch (the only suspension point)
    /// 3. Drop the result if the generation moved on meanwhile
    /// 4. Decode and start at time 0 on the player's clock
    ///
    /// ## Errors:
    /// `FetchFailed` / `DecodeFailed` / `OutputClosed` are logged and returned; the
    /// player is left not playing with no active id. Nothing is retried.
    pub async fn play(&self, id: &str, text: &str) -> AudioResult<PlayOutcome> {
        let request = self.begin(id);
        self.speak(request, text).await
    }

    /// Stop the current clip and make `id` the active request. Synchronous, so a
    /// caller can order it against `stop` and other requests before any await.
    pub fn begin(&self, id: &str) -> ClipRequest {
        let mut state = lock(&self.state);
        self.halt(&mut state);
        state.active_id = Some(id.to_string());
        ClipRequest {
            id: id.to_string(),
            generation: state.generation,
        }
    }

    /// Complete `request` with speech for `text` from the synthesizer.
    pub async fn speak(&self, request: ClipRequest, text: &str) -> AudioResult<PlayOutcome> {
        let id = request.id.clone();
        info!(clip_id = %id, generation = request.generation, chars = text.len(), "Fetching clip speech");
        self.finish(request, self.synthesizer.synthesize(&id, text)).await
    }

    /// Complete `request` with base64 PCM16 from `fetch`.
    ///
    /// Whatever `fetch` awaits is covered by the request: if a newer request or a
    /// stop happens before it resolves, the result (success or error) is dropped
    /// and [`PlayOutcome::Stale`] returned.
    pub async fn finish<F>(&self, request: ClipRequest, fetch: F) -> AudioResult<PlayOutcome>
    where
        F: Future<Output = AudioResult<String>>,
    {
        let ClipRequest { id, generation } = request;
        let fetched = fetch.await;

        let mut state = lock(&self.state);
        if state.generation != generation {
            debug!(clip_id = %id, generation, current = state.generation, "Discarding stale clip");
            return Ok(PlayOutcome::Stale);
        }

        let started = fetched.and_then(|payload| {
            let chunk = decode_base64_pcm(&payload, self.sample_rate, state.sequence)?;
            self.output.start(chunk, 0.0)
        });

        let handle = match started {
            Ok(handle) => handle,
            Err(err) => {
                error!(clip_id = %id, error = %err, "Clip playback failed");
                state.active_id = None;
                self.playing.send_replace(false);
                return Err(err);
            }
        };

        state.sequence += 1;
        state.current = Some(handle.id);
        self.playing.send_replace(true);
        info!(clip_id = %id, source = handle.id, duration = handle.slot.duration, "Clip started");

        // Natural end: clear the flags, unless something newer took over.
        let shared = self.state.clone();
        let playing = self.playing.clone();
        let source = handle.id;
        let ended = handle.ended;
        tokio::spawn(async move {
            if ended.await.is_ok() {
                let mut state = lock(&shared);
                if state.generation == generation && state.current == Some(source) {
                    state.current = None;
                    state.active_id = None;
                    playing.send_replace(false);
                    debug!(source, "Clip finished");
                }
            }
        });

        Ok(PlayOutcome::Started {
            source: handle.id,
            slot: handle.slot,
        })
    }

    /// Halt the current clip and invalidate any in-flight fetch. Safe to call at any
    /// time, any number of times.
    pub fn stop(&self) {
        let mut state = lock(&self.state);
        self.halt(&mut state);
    }

    #[cfg(test)]
    pub fn is_playing(&self) -> bool {
        *self.playing.borrow()
    }

    /// Watch the "is playing" flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.playing.subscribe()
    }

    pub fn active_id(&self) -> Option<String> {
        lock(&self.state).active_id.clone()
    }

    fn halt(&self, state: &mut ClipState) {
        state.generation += 1;
        state.active_id = None;
        if let Some(source) = state.current.take() {
            self.output.stop(source);
        }
        self.playing.send_replace(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::error::AudioError;
    use crate::audio::output::{OutputChannel, OutputEvent, PlaybackEvent, StreamOutput};
    use crate::audio::pcm::{encode_base64_pcm, OUTPUT_SAMPLE_RATE};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Synthesizer with a per-clip latency and clip length.
    struct MockSynthesizer {
        clips: HashMap<String, (Duration, Result<String, AudioError>)>,
    }

    impl MockSynthesizer {
        fn new() -> Self {
            Self { clips: HashMap::new() }
        }

        fn clip(mut self, id: &str, latency_ms: u64, seconds: f64) -> Self {
            let samples = vec![100i16; (seconds * OUTPUT_SAMPLE_RATE as f64) as usize];
            self.clips.insert(
                id.to_string(),
                (Duration::from_millis(latency_ms), Ok(encode_base64_pcm(&samples))),
            );
            self
        }

        fn reply(mut self, id: &str, reply: Result<String, AudioError>) -> Self {
            self.clips.insert(id.to_string(), (Duration::ZERO, reply));
            self
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for MockSynthesizer {
        async fn synthesize(&self, clip_id: &str, _text: &str) -> AudioResult<String> {
            let (latency, reply) = self
                .clips
                .get(clip_id)
                .cloned()
                .unwrap_or((Duration::ZERO, Err(AudioError::FetchFailed("unknown clip".into()))));
            tokio::time::sleep(latency).await;
            reply
        }
    }

    fn player(synth: MockSynthesizer) -> (ClipPlayer, mpsc::UnboundedReceiver<OutputEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let output = Arc::new(StreamOutput::new(OutputChannel::Clip, tx));
        (ClipPlayer::new(Arc::new(synth), output, OUTPUT_SAMPLE_RATE), rx)
    }

    fn scheduled_sources(rx: &mut mpsc::UnboundedReceiver<OutputEvent>) -> Vec<usize> {
        let mut lengths = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PlaybackEvent::Scheduled { chunk, .. } = event.event {
                lengths.push(chunk.samples.len());
            }
        }
        lengths
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_request_wins_when_older_resolves_last() {
        let synth = MockSynthesizer::new().clip("q1", 200, 1.0).clip("q2", 10, 0.5);
        let (player, mut rx) = player(synth);

        let (first, second) = tokio::join!(player.play("q1", "first"), player.play("q2", "second"));

        assert_eq!(first.unwrap(), PlayOutcome::Stale);
        assert!(matches!(second.unwrap(), PlayOutcome::Started { .. }));
        assert_eq!(scheduled_sources(&mut rx), vec![12_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_request_wins_when_older_resolves_first() {
        let synth = MockSynthesizer::new().clip("q1", 10, 1.0).clip("q2", 200, 0.5);
        let (player, mut rx) = player(synth);

        let (first, second) = tokio::join!(player.play("q1", "first"), player.play("q2", "second"));

        assert_eq!(first.unwrap(), PlayOutcome::Stale);
        assert!(matches!(second.unwrap(), PlayOutcome::Started { .. }));
        assert_eq!(scheduled_sources(&mut rx), vec![12_000]);
        assert_eq!(player.active_id().as_deref(), Some("q2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_playing_flag_follows_clip_lifetime() {
        let (player, _rx) = player(MockSynthesizer::new().clip("q1", 0, 0.5));
        let mut flag = player.subscribe();

        let outcome = player.play("q1", "answer").await.unwrap();
        let PlayOutcome::Started { slot, .. } = outcome else {
            panic!("clip should start");
        };
        assert_eq!(slot.start, 0.0);
        assert!(player.is_playing());

        // Natural end of clip.
        flag.wait_for(|playing| !playing).await.unwrap();
        assert!(!player.is_playing());
        assert_eq!(player.active_id(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let (player, mut rx) = player(MockSynthesizer::new().clip("q1", 0, 2.0));

        player.stop();
        player.play("q1", "answer").await.unwrap();
        player.stop();
        player.stop();

        assert!(!player.is_playing());
        assert_eq!(player.active_id(), None);

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let stops = events
            .iter()
            .filter(|e| matches!(e.event, PlaybackEvent::Stopped { .. }))
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_fetch_discards_result() {
        let (player, mut rx) = player(MockSynthesizer::new().clip("q1", 100, 1.0));

        let (outcome, _) = tokio::join!(player.play("q1", "answer"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            player.stop();
        });

        assert_eq!(outcome.unwrap(), PlayOutcome::Stale);
        assert!(!player.is_playing());
        assert!(scheduled_sources(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_and_decode_failures_leave_player_idle() {
        let synth = MockSynthesizer::new()
            .reply("down", Err(AudioError::FetchFailed("503".into())))
            .reply("garbled", Ok("%%% not audio %%%".into()));
        let (player, _rx) = player(synth);

        assert_eq!(
            player.play("down", "text").await.unwrap_err(),
            AudioError::FetchFailed("503".into())
        );
        assert!(!player.is_playing());

        assert!(matches!(
            player.play("garbled", "text").await,
            Err(AudioError::DecodeFailed(_))
        ));
        assert!(!player.is_playing());
        assert_eq!(player.active_id(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacing_clip_stops_previous_source() {
        let synth = MockSynthesizer::new().clip("q1", 0, 3.0).clip("q2", 0, 1.0);
        let (player, mut rx) = player(synth);

        let PlayOutcome::Started { source: first, .. } = player.play("q1", "a").await.unwrap() else {
            panic!("first clip should start");
        };
        player.play("q2", "b").await.unwrap();

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.event).collect();
        assert!(events.contains(&PlaybackEvent::Stopped { source: first }));
        assert_eq!(player.active_id().as_deref(), Some("q2"));
        assert!(player.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_covers_work_before_the_fetch() {
        let (player, mut rx) = player(MockSynthesizer::new().clip("q1", 0, 1.0));
        let request = player.begin("q1");

        let (outcome, _) = tokio::join!(
            player.finish(request, async {
                // Answer text still being generated
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok::<_, AudioError>(encode_base64_pcm(&[100i16; 2400]))
            }),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                player.stop();
            }
        );

        assert_eq!(outcome.unwrap(), PlayOutcome::Stale);
        assert!(scheduled_sources(&mut rx).is_empty());
        assert_eq!(player.active_id(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_request_error_is_not_reported() {
        let (player, mut rx) = player(MockSynthesizer::new().clip("q2", 0, 0.5));
        let request = player.begin("q1");

        let (first, second) = tokio::join!(
            player.finish(request, async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Err::<String, _>(AudioError::FetchFailed("HTTP 503".into()))
            }),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                player.play("q2", "newer").await
            }
        );

        assert_eq!(first.unwrap(), PlayOutcome::Stale);
        assert!(matches!(second.unwrap(), PlayOutcome::Started { .. }));
        assert_eq!(scheduled_sources(&mut rx), vec![12_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clip_decoded_at_player_rate() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let output = Arc::new(StreamOutput::new(OutputChannel::Clip, tx));
        let synth = MockSynthesizer::new().clip("q1", 0, 1.0);
        let player = ClipPlayer::new(Arc::new(synth), output, 16_000);

        let PlayOutcome::Started { slot, .. } = player.play("q1", "a").await.unwrap() else {
            panic!("clip should start");
        };
        // 24000 samples at 16kHz
        assert!((slot.duration - 1.5).abs() < 1e-9);
        let Ok(OutputEvent {
            event: PlaybackEvent::Scheduled { chunk, .. },
            ..
        }) = rx.try_recv()
        else {
            panic!("expected a scheduled chunk");
        };
        assert_eq!(chunk.sample_rate, 16_000);
    }
}
