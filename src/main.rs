//! # Transcribe Jobs - Main Application Entry Point
//!
//! Asynchronous transcription service. Clients submit an audio file path and
//! poll for the result; a pool of background workers does the heavy work.
//! `transcribe-jobs transcribe --input <file>` runs one file without the
//! server and writes the result as JSON.
//!
//! ## Application Architecture:
//! - **cli**: Command-line parsing and the one-shot `transcribe` command
//! - **config**: Application configuration (TOML file + environment variables)
//! - **state**: Shared HTTP state and request metrics
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request logging and metrics collection
//! - **handlers**: Job submission, job status and runtime config endpoints
//! - **error**: HTTP error types and JSON error responses
//! - **jobs**: Job records, the job store, the task queue and the submission gateway
//! - **transcription**: Worker loop, model slot, pipeline and the Whisper engine
//! - **audio**: Normalization of input files to 16 kHz mono
//! - **device**: Compute device selection
//!
//! ## Runtime Layout:
//! HTTP handlers only touch the gateway. Workers run on blocking threads,
//! pull work items from the queue and write progress back to the store.

mod audio;
mod cli;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod jobs;
mod middleware;
mod state;
#[cfg(test)]
mod testing;
mod transcription;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use audio::WavNormalizer;
use clap::Parser;
use cli::{Cli, Command, TranscribeArgs};
use config::AppConfig;
use jobs::{Gateway, InMemoryJobStore, JobStore, TaskQueue};
use state::AppState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::{spawn_workers, WhisperTranscriber};

/// The main application entry point.
///
/// Parses the command line, sets up logging and loads configuration, then
/// either serves (the default) or runs a single transcription.
#[actix_web::main]
async fn main() -> Result<()> {
    // .ok(): a missing .env file is fine
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Transcribe(args) => transcribe(args, config).await,
    }
}

/// Run one file on a blocking thread, then exit.
async fn transcribe(args: TranscribeArgs, config: AppConfig) -> Result<()> {
    let run = args.resolve(&config)?;
    info!(input = %run.input.display(), model = %run.key, "Starting one-shot transcription");

    std::fs::create_dir_all(&config.storage.temp_dir)?;
    let normalizer = WavNormalizer::new(&config.storage.temp_dir);
    tokio::task::spawn_blocking(move || {
        cli::transcribe_file(WhisperTranscriber::from_env(), &normalizer, &run).map(|_| ())
    })
    .await?
}

/// Run the HTTP service.
///
/// ## What this function does:
/// 1. **Creates the job store, task queue and gateway**
/// 2. **Starts the worker pool** on blocking threads
/// 3. **Runs the HTTP server** until a shutdown signal arrives
/// 4. **Drains**: stops the server, closes the queue and waits for workers
async fn serve(config: AppConfig) -> Result<()> {
    info!("Starting transcribe-jobs v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}, {} worker(s), default model {} on {}",
        config.server.host,
        config.server.port,
        config.worker.worker_count,
        config.worker.default_model,
        config.worker.device
    );

    std::fs::create_dir_all(&config.storage.temp_dir)?;

    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let queue = TaskQueue::new(config.queue.capacity);
    let gateway = Gateway::new(
        Arc::clone(&store),
        queue.clone(),
        config.gateway.unknown_job_as_pending,
    );

    // One token stops both the signal listener and the workers
    let shutdown = CancellationToken::new();

    let temp_dir = config.storage.temp_dir.clone();
    let workers = spawn_workers(
        config.worker.worker_count,
        |_| (WhisperTranscriber::from_env(), WavNormalizer::new(&temp_dir)),
        Arc::clone(&store),
        queue.clone(),
        config.worker_settings(),
        shutdown.clone(),
    );

    let app_state = AppState::new(config.clone(), gateway);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers(shutdown.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware runs in reverse order of registration for responses
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .configure(configure_routes)
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
        _ = shutdown.cancelled() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    // Workers finish the job in hand; anything still queued is dropped with the process
    shutdown.cancel();
    queue.close();
    for handle in workers {
        if let Err(e) = handle.await {
            warn!("Worker task ended abnormally: {}", e);
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(handlers::root))
        .route("/health", web::get().to(health::health_check))
        .service(
            web::scope("/api/v1")
                .route("/health", web::get().to(health::api_health))
                .route("/metrics", web::get().to(health::detailed_metrics))
                .route("/config", web::get().to(handlers::get_config))
                .route("/config", web::put().to(handlers::update_config))
                .route("/analyze", web::post().to(handlers::analyze))
                .route("/status/{job_id}", web::get().to(handlers::job_status)),
        );
}

/// Initialize tracing.
///
/// `RUST_LOG` controls what gets logged; without it the default is
/// "transcribe_jobs=debug,actix_web=info".
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transcribe_jobs=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Cancel `shutdown` on SIGTERM or SIGINT.
///
/// If the Unix handlers cannot be installed, Ctrl+C is still honored.
fn setup_signal_handlers(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(mut sigterm), Ok(mut sigint)) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = sigint.recv() => info!("Received SIGINT"),
                        _ = shutdown.cancelled() => return,
                    }
                    shutdown.cancel();
                    return;
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Failed to install signal handlers, falling back to Ctrl+C: {}", e);
                }
            }
        }

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                info!("Received Ctrl+C");
                shutdown.cancel();
            }
            _ = shutdown.cancelled() => {}
        }
    });
}
