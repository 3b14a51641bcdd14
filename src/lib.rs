//! Echo Core
//!
//! Runtime media/state coordination layer for the Echo Pi assistant.
//!
//! ## Architecture (6 Components)
//!
//! 1. StateStore - persistent mode/toggles, linearized mutation
//! 2. CameraManager - refcounted capture loops, latest-frame-wins
//! 3. StreamMultiplexer - per-subscriber MJPEG delivery
//! 4. SpeechQueue - single-speaker ordered utterances
//! 5. EventBus - bounded-history pub/sub fan-out
//! 6. MetricsCache - TTL-cached host metrics
//!
//! ## Design Principles
//!
//! - All cross-component communication goes through the EventBus or
//!   explicit calls; no ambient globals
//! - Per-resource failures are absorbed locally; nothing here may crash
//!   the process
//! - Backpressure resolves by dropping, never by blocking a producer

pub mod camera;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod metrics;
pub mod models;
pub mod speech;
pub mod state;
pub mod state_store;
pub mod stream_mux;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
