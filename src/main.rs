//! # Interview Coach Backend - Main Application Entry Point
//!
//! Actix-web server behind the interview study app: question catalog, AI answers
//! with spoken playback, and live voice practice sessions.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **state**: Shared state handed to every handler and voice connection
//! - **audio**: Clip player, live session controller and their building blocks
//! - **providers**: Network clients for the generative AI service
//! - **questions**: The question catalog
//! - **answers**: Cache-through answer and speech lookups
//! - **websocket**: `/ws/voice`, one clip player + one live session per UI
//! - **handlers** / **health**: HTTP endpoints
//! - **middleware**: Request logging and metrics
//! - **error**: HTTP error responses

mod answers;
mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod providers;
mod questions;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use answers::{AnswerService, MemoryAnswerStore};
use config::AppConfig;
use providers::{GeminiClient, GeminiLiveConnector};
use questions::QuestionCatalog;
use state::AppState;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting interview-coach-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if !config.has_api_key() {
        warn!("No provider API key configured; answers, speech and live sessions will fail");
    }

    let catalog = QuestionCatalog::load(&config.questions.catalog_path)
        .context("loading question catalog")?;
    info!(
        categories = catalog.categories().len(),
        questions = catalog.len(),
        "Question catalog loaded"
    );

    // One handle for the HTTP layer and the provider clients, so runtime config
    // updates reach the next provider call
    let shared_config = crate::config::shared(config.clone());

    let provider = Arc::new(GeminiClient::new(shared_config.clone())?);
    let answers = Arc::new(AnswerService::new(
        Arc::new(MemoryAnswerStore::new()),
        provider.clone(),
        provider,
    ));
    let live_connector = Arc::new(GeminiLiveConnector::new(
        shared_config.clone(),
        config.audio.input_sample_rate,
    ));

    let app_state = AppState::new(shared_config, catalog, answers, live_connector);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let shutdown = shutdown_signal();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/questions", web::get().to(handlers::list_questions))
                    .route("/questions/{id}/answer", web::get().to(handlers::get_answer))
                    .route("/questions/{id}/audio.wav", web::get().to(handlers::get_answer_audio)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/voice", web::get().to(websocket::voice_websocket))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown(shutdown) => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins; otherwise debug for this crate and info for actix.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "interview_coach_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Flips to `true` on SIGTERM or SIGINT.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(mut sigterm), Ok(mut sigint)) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = sigint.recv() => info!("Received SIGINT"),
                    }
                }
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C");
        }

        let _ = tx.send(true);
    });

    rx
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            // Signal task gave up; keep serving until the server exits on its own.
            std::future::pending::<()>().await;
        }
    }
}
