//! StateStore - Persistent Assistant State
//!
//! ## Responsibilities
//!
//! - Hold the single process-wide `SystemState` (mode + toggles)
//! - Serialize concurrent mutations so no update is lost
//! - Persist a full JSON snapshot to disk after every change
//! - Publish a `state` event on every mutation
//!
//! Durability is best-effort: a failed disk write is returned to the
//! caller, but the in-memory state keeps the mutation.

use crate::error::{Error, Result};
use crate::event_bus::EventBus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;

/// Assistant activity mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistantMode {
    Idle,
    Listening,
    Speaking,
    Sleeping,
}

impl Default for AssistantMode {
    fn default() -> Self {
        Self::Idle
    }
}

/// The process-wide assistant state. Mutated only through `StateStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    #[serde(default)]
    pub mode: AssistantMode,
    #[serde(default)]
    pub toggles: HashMap<String, bool>,
    #[serde(default = "Utc::now")]
    pub last_activity: DateTime<Utc>,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            mode: AssistantMode::Idle,
            toggles: HashMap::new(),
            last_activity: Utc::now(),
        }
    }
}

/// Partial update: only the provided fields are applied
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatePatch {
    pub mode: Option<AssistantMode>,
    pub toggles: Option<HashMap<String, bool>>,
}

/// StateStore instance
pub struct StateStore {
    path: PathBuf,
    state: Mutex<SystemState>,
    bus: Arc<EventBus>,
}

impl StateStore {
    /// Create the store, reloading the persisted snapshot if one exists.
    ///
    /// An unreadable or corrupt snapshot is replaced with defaults.
    pub async fn load(path: PathBuf, bus: Arc<EventBus>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let state = match fs::read(&path).await {
            Ok(raw) => match serde_json::from_slice::<SystemState>(&raw) {
                Ok(state) => {
                    tracing::info!(path = %path.display(), mode = ?state.mode, "State snapshot reloaded");
                    state
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "State snapshot corrupt, using defaults");
                    SystemState::default()
                }
            },
            Err(_) => SystemState::default(),
        };

        let store = Self {
            path,
            state: Mutex::new(state),
            bus,
        };
        // Make sure a snapshot exists even before the first mutation.
        let snapshot = store.state.lock().await.clone();
        store.persist(&snapshot).await?;
        Ok(store)
    }

    /// Current state snapshot
    pub async fn get(&self) -> SystemState {
        self.state.lock().await.clone()
    }

    /// Apply a partial update atomically, persist, and publish a `state`
    /// event. The mutex is held across the disk write so persisted state
    /// always reflects the last applied mutation.
    pub async fn set(&self, patch: StatePatch) -> Result<SystemState> {
        let (snapshot, persisted) = {
            let mut state = self.state.lock().await;
            if let Some(mode) = patch.mode {
                state.mode = mode;
            }
            if let Some(toggles) = patch.toggles {
                state.toggles.extend(toggles);
            }
            state.last_activity = Utc::now();
            let snapshot = state.clone();
            let persisted = self.persist(&snapshot).await;
            (snapshot, persisted)
        };

        // The in-memory mutation is visible either way, so the event
        // fires even when the disk write failed.
        self.bus
            .publish("state", serde_json::to_value(&snapshot)?);

        persisted?;
        Ok(snapshot)
    }

    async fn persist(&self, state: &SystemState) -> Result<()> {
        let payload = serde_json::to_vec_pretty(state)?;
        fs::write(&self.path, payload)
            .await
            .map_err(|e| Error::Persistence(format!("{}: {}", self.path.display(), e)))
    }
}
