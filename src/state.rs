//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every voice WebSocket actor.
//!
//! ## What lives here:
//! - **config**: Runtime-updatable configuration (`Arc<RwLock<AppConfig>>`), shared
//!   with the provider clients
//! - **metrics**: Request counters written by the metrics middleware
//! - **catalog**: The question catalog, immutable after startup
//! - **answers**: The cache-through answer service
//! - **live_connector**: Opens live voice connections for new sessions
//!
//! ## Key Rust Concepts:
//! - **Arc<RwLock<T>>**: Many readers or one writer, shared across worker threads
//! - **Arc<dyn Trait>**: Collaborators are trait objects so tests can swap them
//! - **PoisonError::into_inner**: A panicked writer leaves plain counters and config
//!   values that are still usable, so lock poisoning is not propagated

use crate::answers::AnswerService;
use crate::audio::live::LiveConnector;
use crate::config::{AppConfig, SharedConfig};
use crate::questions::QuestionCatalog;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: SharedConfig,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub catalog: Arc<QuestionCatalog>,
    pub answers: Arc<AnswerService>,
    pub live_connector: Arc<dyn LiveConnector>,
    pub start_time: Instant,
}

#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Open `/ws/voice` connections
    pub active_sessions: u32,
    /// Key: "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// `config` is the same handle the provider clients read from.
    pub fn new(
        config: SharedConfig,
        catalog: QuestionCatalog,
        answers: Arc<AnswerService>,
        live_connector: Arc<dyn LiveConnector>,
    ) -> Self {
        Self {
            config,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            catalog: Arc::new(catalog),
            answers,
            live_connector,
            start_time: Instant::now(),
        }
    }

    /// A copy of the current configuration; the lock is released immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration if it validates.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    fn with_metrics<R>(&self, f: impl FnOnce(&mut AppMetrics) -> R) -> R {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut metrics)
    }

    pub fn increment_request_count(&self) {
        self.with_metrics(|m| m.request_count += 1);
    }

    pub fn increment_error_count(&self) {
        self.with_metrics(|m| m.error_count += 1);
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        self.with_metrics(|m| {
            let metric = m.endpoint_metrics.entry(endpoint.to_string()).or_default();
            metric.request_count += 1;
            metric.total_duration_ms += duration_ms;
            if is_error {
                metric.error_count += 1;
            }
        });
    }

    /// Reserve a voice session slot. Returns `false` when the configured limit
    /// is already reached.
    pub fn try_acquire_session(&self) -> bool {
        let limit = self.get_config().performance.max_concurrent_sessions;
        self.with_metrics(|m| {
            if (m.active_sessions as usize) < limit {
                m.active_sessions += 1;
                true
            } else {
                false
            }
        })
    }

    pub fn release_session(&self) {
        self.with_metrics(|m| m.active_sessions = m.active_sessions.saturating_sub(1));
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// 0.0 to 1.0
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::answers::{AnswerGenerator, GeneratedAnswer, MemoryAnswerStore};
    use crate::config::shared;
    use crate::audio::live::LiveLink;
    use crate::audio::player::SpeechSynthesizer;
    use crate::audio::{AudioError, AudioResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Canned provider used by handler and state tests.
    #[derive(Default)]
    pub struct CannedProvider {
        pub answer_calls: AtomicUsize,
    }

    impl CannedProvider {
        pub fn answer_calls(&self) -> usize {
            self.answer_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AnswerGenerator for CannedProvider {
        async fn generate_answer(&self, question: &str) -> AudioResult<GeneratedAnswer> {
            self.answer_calls.fetch_add(1, Ordering::SeqCst);
            Ok(GeneratedAnswer {
                text: format!("A model answer to: {}", question),
                sources: Vec::new(),
            })
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for CannedProvider {
        async fn synthesize(&self, _clip_id: &str, _text: &str) -> AudioResult<String> {
            // Four PCM16 samples: 0, 1, -1, 256
            Ok("AAABAP//AAE=".to_string())
        }
    }

    pub struct OfflineConnector;

    #[async_trait]
    impl LiveConnector for OfflineConnector {
        async fn connect(&self) -> AudioResult<LiveLink> {
            Err(AudioError::ConnectionFailed("offline".to_string()))
        }
    }

    pub fn test_state(config: AppConfig) -> AppState {
        test_state_with(config, Arc::new(CannedProvider::default()))
    }

    pub fn test_state_with(config: AppConfig, provider: Arc<CannedProvider>) -> AppState {
        let answers = Arc::new(AnswerService::new(
            Arc::new(MemoryAnswerStore::new()),
            provider.clone(),
            provider,
        ));
        let catalog = QuestionCatalog::builtin().expect("built-in catalog");
        AppState::new(shared(config), catalog, answers, Arc::new(OfflineConnector))
    }
}
