//! Server entry point.
//!
//! Wires configuration, logging, shared state, and the recognition engine
//! into an actix-web server, then runs it until a shutdown signal arrives.

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use live_translate_backend::config::AppConfig;
use live_translate_backend::engine::azure::AzureSpeechEngine;
use live_translate_backend::engine::RecognitionEngine;
use live_translate_backend::state::AppState;
use live_translate_backend::{handlers, health, middleware, websocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set by the signal task; polled by the shutdown waiter.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!(
        "Starting live-translate-backend v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        "Configuration loaded: {}:{}",
        config.server.host, config.server.port
    );

    // One engine instance serves every connection; sessions open their own
    // provider streams through it.
    let engine: Arc<dyn RecognitionEngine> =
        Arc::new(AzureSpeechEngine::new(&config.speech, &config.audio));
    if !engine.is_configured() {
        warn!(
            "Speech credentials are not configured; sessions and uploads will \
             be rejected until AZURE_SPEECH_KEY and AZURE_SPEECH_REGION are set"
        );
    }
    let engine_data = web::Data::from(engine);

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(engine_data.clone())
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::EndpointMetrics)
            .wrap(middleware::RequestTrace)
            .route("/ws", web::get().to(websocket::translate_websocket))
            .route("/health", web::get().to(health::health_check))
            .route("/transcribe", web::post().to(handlers::transcribe_upload))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_translate_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
