//! # Audio Output and Scheduling Clock
//!
//! An [`AudioOutput`] is the thing that actually plays sources: it owns a
//! monotonic clock and accepts chunks scheduled at a start time on that clock.
//! The players never touch hardware; they only decide *when* something plays.
//!
//! ## Implementations:
//! - [`StreamOutput`]: The server-side output. Every scheduled source is forwarded
//!   to the connected UI as a [`PlaybackEvent`] and a timer on the output's clock
//!   fires the natural end-of-source notification.
//!
//! ## Clock:
//! Each output has its own origin (`tokio::time::Instant` captured at creation),
//! so `current_time()` starts at 0.0 and only moves forward. Using tokio's clock
//! means tests can pause and advance time deterministically.

use crate::audio::error::{AudioError, AudioResult};
use crate::audio::pcm::{AudioChunk, PlaybackSlot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Identifier of one scheduled source within an output.
pub type SourceId = u64;

/// Which player a playback event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputChannel {
    /// Discrete answer clips from the clip player
    Clip,
    /// Model replies from the live voice session
    Live,
}

/// What happened to a source on the output's timeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// A source was placed on the timeline
    Scheduled {
        source: SourceId,
        slot: PlaybackSlot,
        chunk: AudioChunk,
    },
    /// A source played to its end
    Ended { source: SourceId },
    /// A source was cut off before its end
    Stopped { source: SourceId },
}

/// A playback event tagged with the output it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputEvent {
    pub channel: OutputChannel,
    pub event: PlaybackEvent,
}

/// Returned by [`AudioOutput::start`].
///
/// `ended` resolves with `Ok(())` when the source plays to its end and with an
/// error when the source is stopped first (the sender is dropped).
#[derive(Debug)]
pub struct SourceHandle {
    pub id: SourceId,
    pub slot: PlaybackSlot,
    pub ended: oneshot::Receiver<()>,
}

/// A playback sink with its own monotonic clock.
pub trait AudioOutput: Send + Sync {
    /// Current clock time in seconds.
    fn current_time(&self) -> f64;

    /// Schedule `chunk` to begin at `start_at` clock seconds.
    ///
    /// A start time in the past means "now": the returned slot carries the
    /// effective start.
    fn start(&self, chunk: AudioChunk, start_at: f64) -> AudioResult<SourceHandle>;

    /// Cut a source off. Unknown or already finished sources are ignored.
    fn stop(&self, source: SourceId);
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Output that forwards scheduled sources to a channel (the UI connection).
pub struct StreamOutput {
    channel: OutputChannel,
    origin: Instant,
    events: mpsc::UnboundedSender<OutputEvent>,
    next_id: AtomicU64,
    /// End-of-source timers for sources that are still on the timeline
    sources: Arc<Mutex<HashMap<SourceId, JoinHandle<()>>>>,
}

impl StreamOutput {
    pub fn new(channel: OutputChannel, events: mpsc::UnboundedSender<OutputEvent>) -> Self {
        Self {
            channel,
            origin: Instant::now(),
            events,
            next_id: AtomicU64::new(1),
            sources: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of sources scheduled or playing right now.
    #[cfg(test)]
    pub fn active_sources(&self) -> usize {
        lock(&self.sources).len()
    }

    fn emit(&self, event: PlaybackEvent) -> AudioResult<()> {
        self.events
            .send(OutputEvent {
                channel: self.channel,
                event,
            })
            .map_err(|_| AudioError::OutputClosed)
    }
}

impl AudioOutput for StreamOutput {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn start(&self, chunk: AudioChunk, start_at: f64) -> AudioResult<SourceHandle> {
        if self.events.is_closed() {
            return Err(AudioError::OutputClosed);
        }

        let slot = PlaybackSlot {
            start: start_at.max(self.current_time()),
            duration: chunk.duration_seconds(),
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.emit(PlaybackEvent::Scheduled {
            source: id,
            slot,
            chunk,
        })?;

        let (ended_tx, ended_rx) = oneshot::channel();
        let deadline = self.origin + Duration::from_secs_f64(slot.end());
        let registry = self.sources.clone();
        let events = self.events.clone();
        let channel = self.channel;

        // Hold the registry lock while spawning so the timer cannot remove its
        // entry before it has been inserted.
        let mut sources = lock(&self.sources);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if lock(&registry).remove(&id).is_some() {
                let _ = events.send(OutputEvent {
                    channel,
                    event: PlaybackEvent::Ended { source: id },
                });
                let _ = ended_tx.send(());
            }
        });
        sources.insert(id, timer);

        debug!(?channel, source = id, start = slot.start, duration = slot.duration, "Scheduled source");

        Ok(SourceHandle {
            id,
            slot,
            ended: ended_rx,
        })
    }

    fn stop(&self, source: SourceId) {
        let timer = lock(&self.sources).remove(&source);
        if let Some(timer) = timer {
            timer.abort();
            // The UI may already be gone; nothing left to stop then.
            let _ = self.emit(PlaybackEvent::Stopped { source });
            debug!(channel = ?self.channel, source, "Stopped source");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(seconds: f64) -> AudioChunk {
        AudioChunk::new(vec![0; (seconds * 24_000.0) as usize], 24_000, 0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_ends_on_clock() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let output = StreamOutput::new(OutputChannel::Clip, tx);

        let handle = output.start(chunk(0.5), 0.0).unwrap();
        assert_eq!(handle.slot.start, 0.0);
        assert_eq!(output.active_sources(), 1);

        handle.ended.await.expect("source should end naturally");
        assert!(output.current_time() >= 0.5);
        assert_eq!(output.active_sources(), 0);

        assert!(matches!(rx.recv().await.unwrap().event, PlaybackEvent::Scheduled { .. }));
        assert_eq!(
            rx.recv().await.unwrap().event,
            PlaybackEvent::Ended { source: handle.id }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_start_means_now() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let output = StreamOutput::new(OutputChannel::Live, tx);

        tokio::time::advance(Duration::from_secs(2)).await;
        let handle = output.start(chunk(0.1), 0.5).unwrap();
        assert!((handle.slot.start - 2.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cuts_source_off() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let output = StreamOutput::new(OutputChannel::Clip, tx);

        let handle = output.start(chunk(1.0), 0.0).unwrap();
        output.stop(handle.id);
        output.stop(handle.id);

        assert!(handle.ended.await.is_err());
        assert_eq!(output.active_sources(), 0);

        rx.recv().await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap().event,
            PlaybackEvent::Stopped { source: handle.id }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_output_rejects_sources() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let output = StreamOutput::new(OutputChannel::Clip, tx);
        assert_eq!(output.start(chunk(0.1), 0.0).unwrap_err(), AudioError::OutputClosed);
    }
}
