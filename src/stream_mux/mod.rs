//! StreamMultiplexer - Per-Subscriber MJPEG Delivery
//!
//! ## Responsibilities
//!
//! - One independent encode/pace loop per HTTP subscriber
//! - Pace emission to the camera's configured fps, never faster
//! - Disconnect a stalled client instead of letting it stall the system
//! - Release the camera reference count when the subscriber goes away
//!
//! Subscribers of the same camera share one capture loop but never each
//! other's pump, so a slow client cannot hold a healthy one back.

use crate::camera::{CameraManager, Frame};
use crate::error::Result;
use bytes::{BufMut, Bytes, BytesMut};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;

/// Multipart boundary token
const BOUNDARY: &str = "frame";

/// In-flight chunks buffered per subscriber before the stall timer runs
const CHUNK_BUFFER: usize = 4;

/// How long a client may refuse bytes before being disconnected
const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// StreamMultiplexer instance
pub struct StreamMultiplexer {
    cameras: Arc<CameraManager>,
    stall_timeout: Duration,
}

impl StreamMultiplexer {
    /// Response content type for the multipart stream
    pub const CONTENT_TYPE: &'static str = "multipart/x-mixed-replace; boundary=frame";

    pub fn new(cameras: Arc<CameraManager>) -> Self {
        Self {
            cameras,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    /// Override the stall timeout
    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Open an MJPEG byte stream for one subscriber.
    ///
    /// Starts (or joins) the camera's capture loop, then spawns a pump
    /// that polls the latest frame at the camera's fps and emits it as a
    /// multipart chunk. The pump stops and decrements the camera's
    /// reference count when the client disconnects or stalls.
    pub async fn open(&self, name: &str) -> Result<ReceiverStream<std::result::Result<Bytes, Infallible>>> {
        self.cameras.start(name).await?;

        let fps = self.cameras.fps(name).unwrap_or(15).max(1);
        let period = Duration::from_secs_f64(1.0 / f64::from(fps));
        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);

        let cameras = self.cameras.clone();
        let name = name.to_string();
        let stall_timeout = self.stall_timeout;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                // No frame yet (camera warming up or failed): the tick
                // itself is the backoff, just try again.
                let Some(frame) = cameras.snapshot(&name).await else {
                    continue;
                };

                let chunk = encode_part(&frame);
                match timeout(stall_timeout, tx.send(Ok(chunk))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        tracing::warn!(camera = %name, "Stream subscriber stalled, disconnecting");
                        break;
                    }
                }
            }

            if let Err(e) = cameras.stop(&name).await {
                tracing::warn!(camera = %name, error = %e, "Failed to release camera");
            }
            tracing::debug!(camera = %name, "Stream subscriber closed");
        });

        Ok(ReceiverStream::new(rx))
    }
}

/// One multipart chunk: boundary, part headers, JPEG bytes, trailing CRLF
fn encode_part(frame: &Frame) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        frame.data.len()
    );
    let mut chunk = BytesMut::with_capacity(header.len() + frame.data.len() + 2);
    chunk.put_slice(header.as_bytes());
    chunk.put_slice(&frame.data);
    chunk.put_slice(b"\r\n");
    chunk.freeze()
}
