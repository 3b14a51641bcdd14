//! Speech synthesis + playback boundary
//!
//! `SpeechBackend` is the seam the queue worker drives. The production
//! implementation synthesizes through an OpenAI-style speech endpoint
//! (espeak fallback when no API key is configured) and plays the result
//! through a configurable player command.

use crate::config::AppConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use uuid::Uuid;

/// External synthesis + playback service
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Render `text` to playable audio bytes
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>>;

    /// Play audio to completion on the device speaker
    async fn play(&self, audio: &[u8]) -> Result<()>;
}

/// HTTP TTS + player-command backend
pub struct HttpSpeechBackend {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    player_cmd: Vec<String>,
}

impl HttpSpeechBackend {
    pub fn new(config: &AppConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            url: config.tts_url.clone(),
            api_key: config.openai_api_key.clone(),
            model: config.tts_model.clone(),
            player_cmd: config.audio_player.clone(),
        }
    }

    async fn espeak_fallback(&self, text: &str) -> Result<Vec<u8>> {
        tracing::warn!("OPENAI_API_KEY missing, using espeak fallback");
        let output = Command::new("espeak")
            .args(["--stdout", text])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Speech(format!("spawn espeak: {}", e)))?;
        if !output.status.success() {
            return Err(Error::Speech(format!("espeak exited with {}", output.status)));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl SpeechBackend for HttpSpeechBackend {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        if self.api_key.is_empty() {
            return self.espeak_fallback(text).await;
        }

        let payload = serde_json::json!({
            "model": self.model,
            "voice": voice,
            "input": text,
        });

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        let audio = response.bytes().await?;
        tracing::debug!(bytes = audio.len(), voice = %voice, "Utterance synthesized");
        Ok(audio.to_vec())
    }

    async fn play(&self, audio: &[u8]) -> Result<()> {
        let Some((program, args)) = self.player_cmd.split_first() else {
            return Err(Error::Config("audio player command is empty".to_string()));
        };

        let path = std::env::temp_dir().join(format!("echo-speech-{}.wav", Uuid::new_v4()));
        tokio::fs::write(&path, audio).await?;

        let status = Command::new(program)
            .args(args)
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::Speech(format!("spawn {}: {}", program, e)));

        let _ = tokio::fs::remove_file(&path).await;

        match status? {
            s if s.success() => Ok(()),
            s => Err(Error::Speech(format!("{} exited with {}", program, s))),
        }
    }
}
