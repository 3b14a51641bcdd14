//! Application configuration
//!
//! All settings are read from the environment, matching the deployment
//! scripts' `.env` surface. Unset keys fall back to Pi-friendly defaults.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Per-camera capture configuration
#[derive(Debug, Clone)]
pub struct CameraConfig {
    /// Logical camera name, stable across restarts (e.g. "head")
    pub name: String,
    /// Device path (e.g. "/dev/video0")
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// API token; `None` disables the key check
    pub api_token: Option<String>,
    /// Path of the persisted SystemState snapshot
    pub state_path: PathBuf,
    /// Maximum queued (not yet speaking) utterances
    pub speech_queue_max: usize,
    /// Event ring buffer capacity
    pub event_history: usize,
    /// Metrics cache TTL
    pub metrics_cache_ttl: Duration,
    /// Camera device map: logical name -> device path
    pub cameras: HashMap<String, String>,
    /// Capture resolution applied to every camera
    pub camera_resolution: (u32, u32),
    /// Capture frame rate applied to every camera
    pub camera_fps: u32,
    /// API key for the TTS endpoint; empty enables the espeak fallback
    pub openai_api_key: String,
    /// Speech synthesis endpoint
    pub tts_url: String,
    pub tts_model: String,
    pub tts_voice: String,
    /// Audio playback command (argv)
    pub audio_player: Vec<String>,
    /// ffmpeg command used for camera capture (argv)
    pub ffmpeg_cmd: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8600),
            api_token: std::env::var("ECHO_API_TOKEN")
                .ok()
                .filter(|t| !t.is_empty() && t != "change-me"),
            state_path: std::env::var("ECHO_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/echo/state.json")),
            speech_queue_max: std::env::var("SPEECH_QUEUE_MAX")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(16),
            event_history: std::env::var("EVENT_HISTORY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            metrics_cache_ttl: std::env::var("METRICS_CACHE_TTL")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .map(Duration::from_secs_f64)
                .unwrap_or_else(|| Duration::from_secs_f64(2.0)),
            cameras: std::env::var("ECHO_CAMERAS")
                .map(|v| parse_device_map(&v))
                .unwrap_or_else(|_| parse_device_map("head=/dev/video0")),
            camera_resolution: std::env::var("CAM_W")
                .ok()
                .and_then(|w| w.parse().ok())
                .zip(
                    std::env::var("CAM_H")
                        .ok()
                        .and_then(|h| h.parse().ok()),
                )
                .unwrap_or((1280, 720)),
            camera_fps: std::env::var("CAM_FPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            openai_api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            tts_url: std::env::var("ECHO_TTS_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1/audio/speech".to_string()),
            tts_model: std::env::var("ECHO_TTS_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini-tts".to_string()),
            tts_voice: std::env::var("ECHO_TTS_VOICE").unwrap_or_else(|_| "alloy".to_string()),
            audio_player: split_cmd(
                &std::env::var("ECHO_AUDIO_PLAYER").unwrap_or_else(|_| "aplay".to_string()),
            ),
            ffmpeg_cmd: split_cmd(
                &std::env::var("FFMPEG_CMD").unwrap_or_else(|_| "ffmpeg".to_string()),
            ),
        }
    }
}

impl AppConfig {
    /// Build the capture configs for every camera in the device map
    pub fn camera_configs(&self) -> Vec<CameraConfig> {
        let (width, height) = self.camera_resolution;
        self.cameras
            .iter()
            .map(|(name, device)| CameraConfig {
                name: name.clone(),
                device: device.clone(),
                width,
                height,
                fps: self.camera_fps,
            })
            .collect()
    }
}

/// Parse a `name=/dev/path,name2=/dev/path2` device map
pub(crate) fn parse_device_map(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (name, device) = pair.split_once('=')?;
            let name = name.trim();
            let device = device.trim();
            if name.is_empty() || device.is_empty() {
                return None;
            }
            Some((name.to_string(), device.to_string()))
        })
        .collect()
}

/// Split a command string on whitespace into argv form
pub(crate) fn split_cmd(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_map() {
        let map = parse_device_map("head=/dev/video0, side=/dev/video2");
        assert_eq!(map.len(), 2);
        assert_eq!(map["head"], "/dev/video0");
        assert_eq!(map["side"], "/dev/video2");
    }

    #[test]
    fn test_parse_device_map_skips_malformed() {
        let map = parse_device_map("head=/dev/video0,broken,=,x=");
        assert_eq!(map.len(), 1);
        assert_eq!(map["head"], "/dev/video0");
    }

    #[test]
    fn test_split_cmd() {
        assert_eq!(split_cmd("aplay -q"), vec!["aplay", "-q"]);
        assert!(split_cmd("").is_empty());
    }
}
