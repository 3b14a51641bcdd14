//! Echo Core server
//!
//! Main entry point: wires the coordination components together and
//! serves the HTTP API.

use echo_core::camera::{CameraManager, FfmpegGrabber};
use echo_core::config::AppConfig;
use echo_core::event_bus::EventBus;
use echo_core::metrics::{MetricsCache, SysinfoSampler};
use echo_core::speech::{HttpSpeechBackend, SpeechQueue};
use echo_core::state_store::StateStore;
use echo_core::stream_mux::StreamMultiplexer;
use echo_core::{web_api, AppState};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> echo_core::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(AppConfig::default());
    tracing::info!(
        port = config.port,
        cameras = config.cameras.len(),
        speech_queue_max = config.speech_queue_max,
        event_history = config.event_history,
        "Starting Echo core"
    );

    let bus = Arc::new(EventBus::new(config.event_history));

    let state_store = Arc::new(StateStore::load(config.state_path.clone(), bus.clone()).await?);

    let grabber = Arc::new(FfmpegGrabber::new(config.ffmpeg_cmd.clone()));
    let cameras = Arc::new(CameraManager::new(
        config.camera_configs(),
        grabber,
        bus.clone(),
    ));
    let stream_mux = Arc::new(StreamMultiplexer::new(cameras.clone()));

    let speech = Arc::new(SpeechQueue::new(config.speech_queue_max, bus.clone()));
    let backend = Arc::new(HttpSpeechBackend::new(&config));
    let speech_worker =
        speech.spawn_worker(backend, state_store.clone(), config.tts_voice.clone());
    tracing::info!("Speech worker started");

    let metrics = Arc::new(MetricsCache::new(
        Arc::new(SysinfoSampler::new()),
        config.metrics_cache_ttl,
    ));

    let state = AppState {
        config: config.clone(),
        bus,
        state_store,
        cameras: cameras.clone(),
        stream_mux,
        speech: speech.clone(),
        metrics,
        started_at: Instant::now(),
    };

    let app = web_api::create_router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain: let the current utterance finish, then release every
    // camera device before exiting.
    speech.shutdown();
    cameras.stop_all().await;
    let _ = speech_worker.await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
