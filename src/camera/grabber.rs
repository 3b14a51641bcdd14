//! Frame acquisition boundary
//!
//! `FrameSource` is the seam between the capture loops and the actual
//! video plumbing. The production implementation shells out to ffmpeg
//! reading the V4L2 device as an MJPEG stream on stdout; tests plug in
//! fakes.

use crate::config::CameraConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

/// A single decoded (JPEG) frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub captured_at: DateTime<Utc>,
}

/// Opens a camera device and yields a stream of frames
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn open(&self, config: &CameraConfig) -> Result<Box<dyn FrameStream>>;
}

/// A live frame stream for one opened device
#[async_trait]
pub trait FrameStream: Send {
    /// Next decoded frame. Errors are per-frame; the caller decides
    /// whether to retry or reopen.
    async fn next_frame(&mut self) -> Result<Frame>;
}

/// Upper bound on buffered bytes while hunting for a frame boundary.
/// Anything larger than this is not a sane JPEG from a V4L2 webcam.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// ffmpeg-based `FrameSource`
pub struct FfmpegGrabber {
    ffmpeg_cmd: Vec<String>,
}

impl FfmpegGrabber {
    pub fn new(ffmpeg_cmd: Vec<String>) -> Self {
        let ffmpeg_cmd = if ffmpeg_cmd.is_empty() {
            vec!["ffmpeg".to_string()]
        } else {
            ffmpeg_cmd
        };
        Self { ffmpeg_cmd }
    }
}

#[async_trait]
impl FrameSource for FfmpegGrabber {
    async fn open(&self, config: &CameraConfig) -> Result<Box<dyn FrameStream>> {
        let mut command = Command::new(&self.ffmpeg_cmd[0]);
        command
            .args(&self.ffmpeg_cmd[1..])
            .args(["-hide_banner", "-loglevel", "error"])
            .args(["-f", "v4l2"])
            .arg("-framerate")
            .arg(config.fps.to_string())
            .arg("-video_size")
            .arg(format!("{}x{}", config.width, config.height))
            .arg("-i")
            .arg(&config.device)
            .args(["-c:v", "mjpeg", "-q:v", "5"])
            .args(["-f", "mjpeg", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| Error::Device(format!("spawn ffmpeg for {}: {}", config.device, e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Device("ffmpeg stdout unavailable".to_string()))?;

        tracing::info!(
            camera = %config.name,
            device = %config.device,
            fps = config.fps,
            "Camera device opened"
        );

        Ok(Box::new(FfmpegFrameStream {
            _child: child,
            stdout,
            buf: BytesMut::with_capacity(64 * 1024),
        }))
    }
}

struct FfmpegFrameStream {
    // Held so kill_on_drop releases the device when the stream is dropped
    _child: Child,
    stdout: ChildStdout,
    buf: BytesMut,
}

#[async_trait]
impl FrameStream for FfmpegFrameStream {
    async fn next_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(data) = extract_jpeg(&mut self.buf) {
                return Ok(Frame {
                    data,
                    captured_at: Utc::now(),
                });
            }
            if self.buf.len() > MAX_FRAME_BYTES {
                self.buf.clear();
                return Err(Error::Device("oversized frame, resynchronizing".to_string()));
            }
            let read = self.stdout.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(Error::Device("video stream ended".to_string()));
            }
        }
    }
}

/// Pull the first complete JPEG (SOI..EOI) out of the buffer, discarding
/// any leading junk. Returns `None` until a full frame is buffered.
pub(crate) fn extract_jpeg(buf: &mut BytesMut) -> Option<Bytes> {
    let soi = find_marker(buf, [0xFF, 0xD8])?;
    if soi > 0 {
        let _ = buf.split_to(soi);
    }
    // EOI cannot appear unescaped inside entropy-coded data, so the first
    // match after SOI is the real frame end.
    let eoi = find_marker(&buf[2..], [0xFF, 0xD9])? + 2;
    Some(buf.split_to(eoi + 2).freeze())
}

fn find_marker(haystack: &[u8], marker: [u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jpeg(body: &[u8]) -> Vec<u8> {
        let mut frame = vec![0xFF, 0xD8];
        frame.extend_from_slice(body);
        frame.extend_from_slice(&[0xFF, 0xD9]);
        frame
    }

    #[test]
    fn test_extract_single_frame() {
        let mut buf = BytesMut::from(&fake_jpeg(b"abc")[..]);
        let frame = extract_jpeg(&mut buf).unwrap();
        assert_eq!(&frame[..2], &[0xFF, 0xD8]);
        assert_eq!(&frame[frame.len() - 2..], &[0xFF, 0xD9]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_extract_discards_leading_junk() {
        let mut buf = BytesMut::from(&b"junk"[..]);
        buf.extend_from_slice(&fake_jpeg(b"abc"));
        let frame = extract_jpeg(&mut buf).unwrap();
        assert_eq!(&frame[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_extract_two_concatenated_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&fake_jpeg(b"first"));
        buf.extend_from_slice(&fake_jpeg(b"second"));

        let first = extract_jpeg(&mut buf).unwrap();
        let second = extract_jpeg(&mut buf).unwrap();
        assert_eq!(first.len(), 4 + 5);
        assert_eq!(second.len(), 4 + 6);
        assert!(extract_jpeg(&mut buf).is_none());
    }

    #[test]
    fn test_extract_partial_frame_waits() {
        let mut buf = BytesMut::from(&[0xFF, 0xD8, 0x01, 0x02][..]);
        assert!(extract_jpeg(&mut buf).is_none());
        // Buffer untouched until the frame completes.
        assert_eq!(buf.len(), 4);

        buf.extend_from_slice(&[0xFF, 0xD9]);
        assert!(extract_jpeg(&mut buf).is_some());
    }
}
