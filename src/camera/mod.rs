//! CameraManager - Reference-Counted Capture Loops
//!
//! ## Responsibilities
//!
//! - One capture loop per active camera device, shared by all subscribers
//! - Latest-frame-wins buffering (slow consumers never block capture)
//! - Reference-counted start/stop so devices are released deterministically
//! - Bounded-backoff retry on device failures, never fatal to the process

mod grabber;

pub use grabber::{FfmpegGrabber, Frame, FrameSource, FrameStream};

use crate::config::CameraConfig;
use crate::error::{Error, Result};
use crate::event_bus::EventBus;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

/// Retry policy for device open/read failures
#[derive(Debug, Clone, Copy)]
pub struct CaptureRetry {
    /// Consecutive failures tolerated before the loop gives up
    pub max_failures: u32,
    pub backoff_start: Duration,
    pub backoff_ceiling: Duration,
}

impl Default for CaptureRetry {
    fn default() -> Self {
        Self {
            max_failures: 8,
            backoff_start: Duration::from_millis(200),
            backoff_ceiling: Duration::from_secs(5),
        }
    }
}

/// State of one active camera
struct CameraHandle {
    config: CameraConfig,
    subscribers: AtomicUsize,
    running: AtomicBool,
    /// Latest decoded frame, atomically swapped by the capture loop
    frame_rx: watch::Receiver<Option<Arc<Frame>>>,
    stop_tx: watch::Sender<bool>,
}

/// Per-camera status for the API
#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub name: String,
    pub device: String,
    pub running: bool,
    pub subscribers: usize,
}

/// CameraManager instance
pub struct CameraManager {
    configs: HashMap<String, CameraConfig>,
    source: Arc<dyn FrameSource>,
    bus: Arc<EventBus>,
    handles: RwLock<HashMap<String, Arc<CameraHandle>>>,
    retry: CaptureRetry,
}

impl CameraManager {
    /// Create a new manager for the configured devices
    pub fn new(
        configs: Vec<CameraConfig>,
        source: Arc<dyn FrameSource>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            configs: configs.into_iter().map(|c| (c.name.clone(), c)).collect(),
            source,
            bus,
            handles: RwLock::new(HashMap::new()),
            retry: CaptureRetry::default(),
        }
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: CaptureRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Start (or join) the capture loop for `name`.
    ///
    /// Idempotent and reference-counted: the first caller spawns the
    /// loop, later callers only increment the subscriber count. The
    /// registry write lock makes concurrent starts yield exactly one loop.
    pub async fn start(self: &Arc<Self>, name: &str) -> Result<()> {
        let config = self
            .configs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Unknown camera: {}", name)))?;

        let mut handles = self.handles.write().await;
        if let Some(handle) = handles.get(name) {
            let count = handle.subscribers.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!(camera = %name, subscribers = count, "Camera subscriber added");
            return Ok(());
        }

        let (frame_tx, frame_rx) = watch::channel(None);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = Arc::new(CameraHandle {
            config,
            subscribers: AtomicUsize::new(1),
            running: AtomicBool::new(true),
            frame_rx,
            stop_tx,
        });
        handles.insert(name.to_string(), handle.clone());
        drop(handles);

        tokio::spawn(capture_loop(self.clone(), handle, frame_tx, stop_rx));
        tracing::info!(camera = %name, "Capture loop started");
        self.bus
            .publish("camera", json!({ "name": name, "running": true }));
        Ok(())
    }

    /// Drop one subscriber of `name`; the last one out stops the loop
    /// and releases the device.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let mut handles = self.handles.write().await;
        let Some(handle) = handles.get(name) else {
            return Ok(());
        };

        let prev = handle
            .subscribers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
        match prev {
            Err(_) => {
                tracing::warn!(camera = %name, "Stop called with no subscribers");
            }
            Ok(prev) if prev > 1 => {
                tracing::debug!(camera = %name, subscribers = prev - 1, "Camera subscriber removed");
            }
            Ok(_) => {
                if let Some(handle) = handles.remove(name) {
                    handle.stop_tx.send_replace(true);
                    tracing::info!(camera = %name, "Capture loop stopping (no subscribers)");
                    self.bus
                        .publish("camera", json!({ "name": name, "running": false }));
                }
            }
        }
        Ok(())
    }

    /// Most recent decoded frame, if the camera is running and has one
    pub async fn snapshot(&self, name: &str) -> Option<Arc<Frame>> {
        let handles = self.handles.read().await;
        handles.get(name).and_then(|h| h.frame_rx.borrow().clone())
    }

    /// Logical name -> device path map
    pub fn list(&self) -> HashMap<String, String> {
        self.configs
            .iter()
            .map(|(name, c)| (name.clone(), c.device.clone()))
            .collect()
    }

    /// Configured capture fps for `name`
    pub fn fps(&self, name: &str) -> Option<u32> {
        self.configs.get(name).map(|c| c.fps)
    }

    /// Status of every configured camera
    pub async fn status(&self) -> Vec<CameraStatus> {
        let handles = self.handles.read().await;
        let mut statuses: Vec<CameraStatus> = self
            .configs
            .values()
            .map(|config| {
                let handle = handles.get(&config.name);
                CameraStatus {
                    name: config.name.clone(),
                    device: config.device.clone(),
                    running: handle.map(|h| h.running.load(Ordering::SeqCst)).unwrap_or(false),
                    subscribers: handle
                        .map(|h| h.subscribers.load(Ordering::SeqCst))
                        .unwrap_or(0),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Stop every capture loop and release all devices (shutdown path)
    pub async fn stop_all(&self) {
        let mut handles = self.handles.write().await;
        for (name, handle) in handles.drain() {
            handle.stop_tx.send_replace(true);
            tracing::info!(camera = %name, "Capture loop stopping (shutdown)");
            self.bus
                .publish("camera", json!({ "name": name, "running": false }));
        }
    }
}

/// Dedicated loop for one camera: read, decode, overwrite the latest
/// frame slot. Failures retry with bounded backoff; past the ceiling the
/// loop detaches itself so a later `start` spawns fresh.
async fn capture_loop(
    manager: Arc<CameraManager>,
    handle: Arc<CameraHandle>,
    frame_tx: watch::Sender<Option<Arc<Frame>>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let config = handle.config.clone();
    let retry = manager.retry;
    let mut failures = 0u32;
    let mut backoff = retry.backoff_start;
    let mut last_error = String::new();
    let mut gave_up = false;

    'run: loop {
        if *stop_rx.borrow() {
            break;
        }

        match manager.source.open(&config).await {
            Ok(mut stream) => loop {
                tokio::select! {
                    _ = stop_rx.changed() => break 'run,
                    frame = stream.next_frame() => match frame {
                        Ok(frame) => {
                            failures = 0;
                            backoff = retry.backoff_start;
                            frame_tx.send_replace(Some(Arc::new(frame)));
                        }
                        Err(e) => {
                            failures += 1;
                            last_error = e.to_string();
                            tracing::warn!(camera = %config.name, error = %e, failures, "Frame read failed");
                            break;
                        }
                    }
                }
            },
            Err(e) => {
                failures += 1;
                last_error = e.to_string();
                tracing::warn!(camera = %config.name, error = %e, failures, "Device open failed");
            }
        }

        if failures >= retry.max_failures {
            gave_up = true;
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = stop_rx.changed() => break,
        }
        backoff = (backoff * 2).min(retry.backoff_ceiling);
    }

    handle.running.store(false, Ordering::SeqCst);

    if gave_up {
        let mut handles = manager.handles.write().await;
        if let Some(current) = handles.get(&config.name) {
            if Arc::ptr_eq(current, &handle) {
                handles.remove(&config.name);
            }
        }
        drop(handles);
        tracing::error!(camera = %config.name, error = %last_error, "Capture loop gave up after retries");
        manager.bus.publish(
            "camera",
            json!({ "name": config.name, "running": false, "error": last_error }),
        );
    } else {
        tracing::info!(camera = %config.name, "Capture loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;

    struct FakeSource {
        opens: AtomicUsize,
        fail: bool,
    }

    impl FakeSource {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl FrameSource for FakeSource {
        async fn open(&self, _config: &CameraConfig) -> Result<Box<dyn FrameStream>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Device("no such device".to_string()));
            }
            Ok(Box::new(FakeStream { seq: 0 }))
        }
    }

    struct FakeStream {
        seq: u32,
    }

    #[async_trait]
    impl FrameStream for FakeStream {
        async fn next_frame(&mut self) -> Result<Frame> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.seq += 1;
            Ok(Frame {
                data: Bytes::from(format!("frame-{}", self.seq)),
                captured_at: Utc::now(),
            })
        }
    }

    fn test_config(name: &str) -> CameraConfig {
        CameraConfig {
            name: name.to_string(),
            device: format!("/dev/{}", name),
            width: 640,
            height: 480,
            fps: 30,
        }
    }

    fn manager(source: Arc<FakeSource>) -> Arc<CameraManager> {
        let bus = Arc::new(EventBus::new(50));
        Arc::new(CameraManager::new(
            vec![test_config("head")],
            source,
            bus,
        ))
    }

    async fn wait_for_frame(manager: &Arc<CameraManager>, name: &str) -> Arc<Frame> {
        for _ in 0..100 {
            if let Some(frame) = manager.snapshot(name).await {
                return frame;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no frame within timeout");
    }

    #[tokio::test]
    async fn test_concurrent_starts_share_one_loop() {
        let source = FakeSource::new(false);
        let manager = manager(source.clone());

        let (a, b) = tokio::join!(manager.start("head"), manager.start("head"));
        a.unwrap();
        b.unwrap();

        let status = manager.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].subscribers, 2);
        assert!(status[0].running);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_last_subscriber_releases_device() {
        let source = FakeSource::new(false);
        let manager = manager(source);

        manager.start("head").await.unwrap();
        manager.start("head").await.unwrap();

        manager.stop("head").await.unwrap();
        assert!(manager.status().await[0].running);

        manager.stop("head").await.unwrap();
        let status = manager.status().await;
        assert!(!status[0].running);
        assert_eq!(status[0].subscribers, 0);
        assert!(manager.snapshot("head").await.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_returns_latest_frame() {
        let source = FakeSource::new(false);
        let manager = manager(source);

        manager.start("head").await.unwrap();
        let first = wait_for_frame(&manager, "head").await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let later = wait_for_frame(&manager, "head").await;
        assert_ne!(first.data, later.data);

        manager.stop("head").await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_camera_rejected() {
        let source = FakeSource::new(false);
        let manager = manager(source);
        assert!(matches!(
            manager.start("nope").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_device_gives_up_and_surfaces_status() {
        let source = FakeSource::new(true);
        let bus = Arc::new(EventBus::new(50));
        let manager = Arc::new(
            CameraManager::new(vec![test_config("head")], source.clone(), bus.clone())
                .with_retry(CaptureRetry {
                    max_failures: 2,
                    backoff_start: Duration::from_millis(5),
                    backoff_ceiling: Duration::from_millis(10),
                }),
        );

        manager.start("head").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = manager.status().await;
        assert!(!status[0].running);
        assert_eq!(source.opens.load(Ordering::SeqCst), 2);

        let failed_event = bus
            .history()
            .into_iter()
            .find(|e| e.event_type == "camera" && e.data.get("error").is_some());
        assert!(failed_event.is_some());

        // A later start spawns a fresh loop.
        manager.start("head").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(source.opens.load(Ordering::SeqCst) > 2);
    }
}
