//! Configuration types for the live consult session.

use crate::audio::codec::pcm_mime_type;
use crate::error::{LiveError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variables consulted, in order, when no API key is configured.
pub const API_KEY_ENV_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

/// Top-level configuration for a live session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Remote agent link settings.
    pub link: LinkConfig,
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz sent to the agent.
    pub input_sample_rate: u32,
    /// Playback sample rate in Hz.
    pub output_sample_rate: u32,
    /// Playback device channels; agent audio is duplicated across them.
    pub output_channels: u16,
    /// Samples per outbound capture frame.
    ///
    /// 4096 samples at 16kHz is 256ms: long enough to keep per-frame
    /// overhead low, short enough to keep capture-to-send latency bounded.
    pub frame_size: usize,
    /// Raw device blocks buffered between the capture callback and the
    /// capture stage before blocks are dropped.
    pub capture_queue_frames: usize,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            output_channels: 1,
            frame_size: 4096,
            capture_queue_frames: 32,
            input_device: None,
            output_device: None,
        }
    }
}

/// Remote conversational agent link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// WebSocket endpoint of the bidirectional generate-content service.
    pub endpoint: String,
    /// Agent model identifier.
    pub model: String,
    /// Instruction given to the agent at session setup.
    pub system_instruction: String,
    /// API key. Never written back to disk; falls back to
    /// [`API_KEY_ENV_VARS`] when unset.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Seconds to wait for the link to connect and confirm setup.
    pub open_timeout_secs: u64,
    /// Milliseconds to wait for the link task to finish after close.
    pub close_timeout_ms: u64,
    /// Encoded frames queued for sending before new frames are dropped.
    pub outbound_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_owned(),
            model: "gemini-2.5-flash-native-audio-preview-12-2025".to_owned(),
            system_instruction: "You are MedPredict AI, a professional medical assistant. \
                Provide concise, helpful health advice based on symptoms described. \
                Keep it clinically focused. Remind users you are AI and not a doctor \
                when giving medical advice."
                .to_owned(),
            api_key: None,
            open_timeout_secs: 15,
            close_timeout_ms: 2000,
            outbound_capacity: 64,
        }
    }
}

impl LinkConfig {
    /// The configured API key, or the first non-empty key from the environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| {
                API_KEY_ENV_VARS
                    .iter()
                    .filter_map(|var| std::env::var(var).ok())
                    .find(|key| !key.trim().is_empty())
            })
    }
}

impl LiveConfig {
    /// Mime tag for outbound capture chunks.
    pub fn input_mime_type(&self) -> String {
        pcm_mime_type(self.audio.input_sample_rate)
    }

    /// Check values that would otherwise fail deep inside a running session.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 7] = [
            ("audio.input_sample_rate", self.audio.input_sample_rate > 0),
            ("audio.output_sample_rate", self.audio.output_sample_rate > 0),
            ("audio.output_channels", self.audio.output_channels > 0),
            ("audio.frame_size", self.audio.frame_size > 0),
            ("audio.capture_queue_frames", self.audio.capture_queue_frames > 0),
            ("link.outbound_capacity", self.link.outbound_capacity > 0),
            ("link.open_timeout_secs", self.link.open_timeout_secs > 0),
        ];
        match checks.iter().find(|(_, ok)| !ok) {
            Some((field, _)) => Err(LiveError::Config(format!("{field} must be greater than zero"))),
            None => Ok(()),
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| LiveError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| LiveError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/medpredict/live.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| std::env::temp_dir().join("medpredict-config"))
            .join("medpredict")
            .join("live.toml")
    }
}
