use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SkaldError};

/// WebSocket server endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    /// WebSocket URL for the voice session endpoint
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws", self.host, self.port)
    }
}

/// Audio capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Device capture rate in Hz (resampled down to `target_rate`)
    pub capture_rate: u32,
    /// Rate the rest of the pipeline runs at (VAD, AEC, wire)
    pub target_rate: u32,
    /// Capture chunk size in samples at `capture_rate`
    pub chunk_size: usize,
    pub channels: u16,
    /// "default"/"pulse" use the system default input; anything else is a
    /// case-sensitive substring match over enumerated devices
    pub input_device_name: String,
    /// When true, capture continues during playback with an elevated VAD
    /// threshold (and AEC if configured); when false, the mic pauses
    pub echo_cancellation: bool,
    /// Seconds without device data before the process gives up
    pub stall_timeout: f64,
    /// VAD threshold used during playback when no AEC is cancelling echo
    pub vad_threshold_playback: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_rate: 48_000,
            target_rate: 16_000,
            chunk_size: 1440,
            channels: 1,
            input_device_name: "default".to_string(),
            echo_cancellation: true,
            stall_timeout: 5.0,
            vad_threshold_playback: 0.99,
        }
    }
}

impl AudioConfig {
    /// Duration of one capture chunk in milliseconds
    pub fn chunk_duration_ms(&self) -> f64 {
        self.chunk_size as f64 / self.capture_rate as f64 * 1000.0
    }
}

/// Voice activity detection tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// Speech probability threshold while not playing
    pub threshold: f32,
    /// Audio to keep before speech starts, in milliseconds
    pub pre_buffer_ms: f64,
    /// Silence required before declaring end of speech, in milliseconds
    pub silence_duration_ms: f64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            pre_buffer_ms: 300.0,
            silence_duration_ms: 900.0,
        }
    }
}

/// Acoustic echo cancellation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AecConfig {
    pub enabled: bool,
    /// Engine frame size in samples at `target_rate` (10 ms = 160 @ 16 kHz)
    pub frame_size: usize,
    /// Echo tail length the adaptive filter models, in milliseconds
    pub filter_length_ms: u64,
    /// Run the DC-blocking preprocess stage before cancellation
    pub enable_preprocess: bool,
    /// Playback history kept for reference reads, in milliseconds
    pub buffer_duration_ms: u64,
    /// Estimated speaker-to-mic delay (acoustic path + sink buffering)
    pub speaker_to_mic_delay_ms: u64,
}

impl Default for AecConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frame_size: 160,
            filter_length_ms: 400,
            enable_preprocess: true,
            buffer_duration_ms: 15_000,
            speaker_to_mic_delay_ms: 50,
        }
    }
}

/// When cached prompts are discarded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClearPolicy {
    /// TTL in hours; entries older than this are removed at startup
    TtlHours(f64),
    Mode(ClearMode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearMode {
    OnStart,
    Never,
}

impl Default for ClearPolicy {
    fn default() -> Self {
        Self::Mode(ClearMode::Never)
    }
}

/// Audio prompt cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub directory: PathBuf,
    #[serde(default)]
    pub clear_policy: ClearPolicy,
    /// Maximum cache size in MB (0 = unlimited)
    pub max_size_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("audio_cache"),
            clear_policy: ClearPolicy::default(),
            max_size_mb: 100,
        }
    }
}

/// Network behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Seconds to wait between reconnection attempts
    pub reconnect_delay: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: 3.0,
        }
    }
}

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub aec: AecConfig,
    pub cache: CacheConfig,
    pub network: NetworkConfig,
}

impl AppConfig {
    /// Get the default config directory path
    pub fn default_config_dir() -> Result<PathBuf> {
        directories::ProjectDirs::from("io", "skald", "Skald")
            .map(|proj_dirs| proj_dirs.config_dir().to_path_buf())
            .ok_or_else(|| SkaldError::Config("Failed to get config directory".to_string()))
    }

    /// Get the default config file path
    pub fn default_config_file() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("config.toml"))
    }

    /// Load config from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save config to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| SkaldError::Config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        Ok(())
    }
}
