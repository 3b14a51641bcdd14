//! SpeechQueue - Single-Speaker Ordered Utterances
//!
//! ## Responsibilities
//!
//! - Bounded FIFO of pending utterances (reject on full, never block)
//! - One dedicated worker: at most one utterance active system-wide
//! - Synthesis/playback failures mark the item failed and move on
//! - Mirror activity into the StateStore (speaking while active, idle
//!   when the queue drains)

mod backend;

pub use backend::{HttpSpeechBackend, SpeechBackend};

use crate::error::{Error, Result};
use crate::event_bus::EventBus;
use crate::state_store::{AssistantMode, StatePatch, StateStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

/// Utterance lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechStatus {
    Queued,
    Active,
    Done,
    Failed,
    Cancelled,
}

impl SpeechStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeechStatus::Queued => "queued",
            SpeechStatus::Active => "active",
            SpeechStatus::Done => "done",
            SpeechStatus::Failed => "failed",
            SpeechStatus::Cancelled => "cancelled",
        }
    }
}

/// One enqueued utterance
#[derive(Debug, Clone, Serialize)]
pub struct SpeechRequest {
    pub id: Uuid,
    pub text: String,
    pub voice: Option<String>,
    pub status: SpeechStatus,
    pub created_at: DateTime<Utc>,
}

/// Read-only queue snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SpeechStatusSnapshot {
    pub active: Option<SpeechRequest>,
    pub pending: Vec<SpeechRequest>,
}

struct Inner {
    queue: VecDeque<SpeechRequest>,
    active: Option<SpeechRequest>,
}

/// SpeechQueue instance
pub struct SpeechQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    notify: Notify,
    shutdown: AtomicBool,
    bus: Arc<EventBus>,
}

impl SpeechQueue {
    pub fn new(capacity: usize, bus: Arc<EventBus>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                active: None,
            }),
            capacity: capacity.max(1),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            bus,
        }
    }

    /// Enqueue an utterance. Fails immediately with a capacity error when
    /// the queue is full; never blocks.
    pub fn enqueue(&self, text: &str, voice: Option<String>) -> Result<SpeechRequest> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Validation("text is required".to_string()));
        }

        let request = SpeechRequest {
            id: Uuid::new_v4(),
            text: text.to_string(),
            voice,
            status: SpeechStatus::Queued,
            created_at: Utc::now(),
        };

        {
            let mut inner = self.inner.lock().expect("speech queue lock poisoned");
            if inner.queue.len() >= self.capacity {
                return Err(Error::Capacity(format!(
                    "speech queue full ({} queued)",
                    self.capacity
                )));
            }
            inner.queue.push_back(request.clone());
        }

        self.bus.publish(
            "speech",
            json!({ "id": request.id, "status": "queued", "text": request.text }),
        );
        self.notify.notify_one();
        Ok(request)
    }

    /// Snapshot of the active and pending utterances
    pub fn status(&self) -> SpeechStatusSnapshot {
        let inner = self.inner.lock().expect("speech queue lock poisoned");
        SpeechStatusSnapshot {
            active: inner.active.clone(),
            pending: inner.queue.iter().cloned().collect(),
        }
    }

    /// Remove a still-queued utterance. The active one cannot be
    /// cancelled reliably (it may finish playing) and is refused.
    pub fn cancel(&self, id: Uuid) -> Result<SpeechRequest> {
        let cancelled = {
            let mut inner = self.inner.lock().expect("speech queue lock poisoned");
            if let Some(pos) = inner.queue.iter().position(|r| r.id == id) {
                inner.queue.remove(pos).map(|mut request| {
                    request.status = SpeechStatus::Cancelled;
                    request
                })
            } else if inner.active.as_ref().is_some_and(|a| a.id == id) {
                return Err(Error::Conflict(format!("utterance {} already playing", id)));
            } else {
                return Err(Error::NotFound(format!("utterance {} not found", id)));
            }
        };

        let Some(request) = cancelled else {
            return Err(Error::NotFound(format!("utterance {} not found", id)));
        };
        self.bus.publish(
            "speech",
            json!({ "id": request.id, "status": "cancelled" }),
        );
        Ok(request)
    }

    /// Stop the worker after the current utterance
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // notify_one leaves a permit, so the worker wakes even if it is
        // not parked in notified() yet.
        self.notify.notify_one();
    }

    /// Spawn the single dedicated worker.
    ///
    /// Items are spoken strictly in enqueue order. Backend failures mark
    /// the item failed and the worker proceeds to the next one.
    pub fn spawn_worker(
        self: &Arc<Self>,
        backend: Arc<dyn SpeechBackend>,
        state_store: Arc<StateStore>,
        default_voice: String,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                if queue.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let Some(item) = queue.pop_next() else {
                    queue.notify.notified().await;
                    continue;
                };
                queue
                    .speak_one(item, backend.as_ref(), &state_store, &default_voice)
                    .await;
            }
            tracing::info!("Speech worker stopped");
        })
    }

    fn pop_next(&self) -> Option<SpeechRequest> {
        let mut inner = self.inner.lock().expect("speech queue lock poisoned");
        let mut item = inner.queue.pop_front()?;
        item.status = SpeechStatus::Active;
        inner.active = Some(item.clone());
        Some(item)
    }

    async fn speak_one(
        &self,
        item: SpeechRequest,
        backend: &dyn SpeechBackend,
        state_store: &StateStore,
        default_voice: &str,
    ) {
        tracing::info!(id = %item.id, "Speaking utterance");
        self.bus.publish(
            "speech",
            json!({ "id": item.id, "status": "active", "text": item.text }),
        );
        if let Err(e) = state_store
            .set(StatePatch {
                mode: Some(AssistantMode::Speaking),
                ..Default::default()
            })
            .await
        {
            tracing::warn!(error = %e, "Failed to record speaking state");
        }

        let voice = item.voice.as_deref().unwrap_or(default_voice);
        let outcome = match backend.synthesize(&item.text, voice).await {
            Ok(audio) => backend.play(&audio).await,
            Err(e) => Err(e),
        };

        let status = match outcome {
            Ok(()) => SpeechStatus::Done,
            Err(e) => {
                tracing::error!(id = %item.id, error = %e, "Utterance failed");
                SpeechStatus::Failed
            }
        };

        let drained = {
            let mut inner = self.inner.lock().expect("speech queue lock poisoned");
            inner.active = None;
            inner.queue.is_empty()
        };

        self.bus
            .publish("speech", json!({ "id": item.id, "status": status.as_str() }));

        if drained {
            if let Err(e) = state_store
                .set(StatePatch {
                    mode: Some(AssistantMode::Idle),
                    ..Default::default()
                })
                .await
            {
                tracing::warn!(error = %e, "Failed to record idle state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    struct FakeBackend {
        spoken: Mutex<Vec<String>>,
        delay: Duration,
        fail_on: Option<String>,
    }

    impl FakeBackend {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                spoken: Mutex::new(Vec::new()),
                delay,
                fail_on: None,
            })
        }

        fn failing_on(text: &str) -> Arc<Self> {
            Arc::new(Self {
                spoken: Mutex::new(Vec::new()),
                delay: Duration::from_millis(1),
                fail_on: Some(text.to_string()),
            })
        }

        fn spoken(&self) -> Vec<String> {
            self.spoken.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SpeechBackend for FakeBackend {
        async fn synthesize(&self, text: &str, _voice: &str) -> Result<Vec<u8>> {
            if self.fail_on.as_deref() == Some(text) {
                return Err(Error::Speech("synthesis refused".to_string()));
            }
            Ok(text.as_bytes().to_vec())
        }

        async fn play(&self, audio: &[u8]) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.spoken
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(audio).into_owned());
            Ok(())
        }
    }

    struct Fixture {
        queue: Arc<SpeechQueue>,
        bus: Arc<EventBus>,
        state_store: Arc<StateStore>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(capacity: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(200));
        let state_store = Arc::new(
            StateStore::load(dir.path().join("state.json"), bus.clone())
                .await
                .unwrap(),
        );
        Fixture {
            queue: Arc::new(SpeechQueue::new(capacity, bus.clone())),
            bus,
            state_store,
            _dir: dir,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within timeout");
    }

    async fn wait_for_mode(store: &StateStore, mode: AssistantMode) {
        for _ in 0..200 {
            if store.get().await.mode == mode {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("mode {:?} not reached within timeout", mode);
    }

    #[tokio::test]
    async fn test_enqueue_beyond_capacity_rejected() {
        let fx = fixture(2).await;

        let a = fx.queue.enqueue("one", None).unwrap();
        let b = fx.queue.enqueue("two", None).unwrap();
        assert!(matches!(
            fx.queue.enqueue("three", None),
            Err(Error::Capacity(_))
        ));

        let status = fx.queue.status();
        assert_eq!(status.pending.len(), 2);
        assert_eq!(status.pending[0].id, a.id);
        assert_eq!(status.pending[1].id, b.id);
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let fx = fixture(4).await;
        assert!(matches!(
            fx.queue.enqueue("   ", None),
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let fx = fixture(8).await;
        let backend = FakeBackend::new(Duration::from_millis(10));
        fx.queue
            .spawn_worker(backend.clone(), fx.state_store.clone(), "alloy".to_string());

        fx.queue.enqueue("A", None).unwrap();
        fx.queue.enqueue("B", None).unwrap();

        wait_until(|| backend.spoken().len() == 2).await;
        assert_eq!(backend.spoken(), vec!["A", "B"]);

        wait_for_mode(&fx.state_store, AssistantMode::Idle).await;
        let status = fx.queue.status();
        assert!(status.active.is_none());
        assert!(status.pending.is_empty());
    }

    #[tokio::test]
    async fn test_at_most_one_active() {
        let fx = fixture(8).await;
        let backend = FakeBackend::new(Duration::from_millis(200));
        fx.queue
            .spawn_worker(backend.clone(), fx.state_store.clone(), "alloy".to_string());

        let a = fx.queue.enqueue("first", None).unwrap();
        let b = fx.queue.enqueue("second", None).unwrap();

        wait_for_mode(&fx.state_store, AssistantMode::Speaking).await;
        let status = fx.queue.status();
        assert_eq!(status.active.as_ref().unwrap().id, a.id);
        assert_eq!(status.active.as_ref().unwrap().status, SpeechStatus::Active);
        assert_eq!(status.pending.len(), 1);
        assert_eq!(status.pending[0].id, b.id);

        wait_until(|| backend.spoken().len() == 2).await;
    }

    #[tokio::test]
    async fn test_failed_utterance_does_not_stop_worker() {
        let fx = fixture(8).await;
        let backend = FakeBackend::failing_on("bad");
        fx.queue
            .spawn_worker(backend.clone(), fx.state_store.clone(), "alloy".to_string());

        let bad = fx.queue.enqueue("bad", None).unwrap();
        fx.queue.enqueue("good", None).unwrap();

        wait_until(|| backend.spoken() == vec!["good"]).await;

        let failed = fx
            .bus
            .history()
            .into_iter()
            .find(|e| e.data["id"] == bad.id.to_string() && e.data["status"] == "failed");
        assert!(failed.is_some());
    }

    #[tokio::test]
    async fn test_cancel_queued_item() {
        let fx = fixture(8).await;

        fx.queue.enqueue("keep", None).unwrap();
        let doomed = fx.queue.enqueue("cancel me", None).unwrap();

        let cancelled = fx.queue.cancel(doomed.id).unwrap();
        assert_eq!(cancelled.status, SpeechStatus::Cancelled);
        assert_eq!(fx.queue.status().pending.len(), 1);

        assert!(matches!(
            fx.queue.cancel(Uuid::new_v4()),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let fx = fixture(8).await;
        let backend = FakeBackend::new(Duration::from_millis(1));
        let handle = fx
            .queue
            .spawn_worker(backend, fx.state_store.clone(), "alloy".to_string());

        fx.queue.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
