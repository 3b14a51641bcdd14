//! Application state
//!
//! Holds all shared components behind Arcs; cloned into every handler.

use crate::camera::CameraManager;
use crate::config::AppConfig;
use crate::event_bus::EventBus;
use crate::metrics::MetricsCache;
use crate::speech::SpeechQueue;
use crate::state_store::StateStore;
use crate::stream_mux::StreamMultiplexer;
use std::sync::Arc;
use std::time::Instant;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub bus: Arc<EventBus>,
    pub state_store: Arc<StateStore>,
    pub cameras: Arc<CameraManager>,
    pub stream_mux: Arc<StreamMultiplexer>,
    pub speech: Arc<SpeechQueue>,
    pub metrics: Arc<MetricsCache>,
    pub started_at: Instant,
}
