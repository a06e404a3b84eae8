use serde::{Deserialize, Serialize};
use tracing::warn;

/// Stream kind announced by the server (advisory label)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Loading,
    Tts,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Loading => write!(f, "loading"),
            StreamKind::Tts => write!(f, "tts"),
        }
    }
}

/// Cache availability reported back to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Have,
    Need,
}

/// Session state announced by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Inactive,
    Deactivated,
}

/// Messages sent to the server
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Base64-encoded int16 LE PCM at the target rate
    AudioChunk { data: String, timestamp: String },
    EndSpeech { timestamp: String },
    AudioCacheStatus {
        cache_key: String,
        status: CacheStatus,
    },
}

fn default_tempo() -> f32 {
    1.0
}

fn default_chunk_index() -> u32 {
    1
}

/// Messages received from the server. Audio payloads stay base64-encoded
/// here; the dispatcher decodes at the point of use.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AudioStreamStart {
        stream: StreamKind,
        sample_rate: u32,
        channels: u16,
        sample_format: String,
        #[serde(default = "default_tempo")]
        tempo: f32,
    },
    AudioStreamChunk {
        stream: StreamKind,
        data: String,
    },
    AudioStreamEnd {
        stream: StreamKind,
    },
    AudioSentence {
        data: String,
        sentence_index: u32,
        total_sentences: u32,
        duration_ms: u64,
        sample_rate: u32,
        #[serde(default = "default_tempo")]
        tempo_applied: f32,
    },
    AudioCachePlay {
        cache_key: String,
        #[serde(rename = "loop", default)]
        looped: bool,
    },
    AudioCacheStore {
        cache_key: String,
        data: String,
        sample_rate: u32,
        channels: u16,
        duration_ms: u64,
    },
    /// Legacy loading cue: one complete WAV, played async
    AudioLoading {
        data: String,
    },
    /// Legacy chunked TTS: complete WAVs played back-to-back
    AudioPlayback {
        data: String,
        #[serde(default = "default_chunk_index")]
        chunk: u32,
        #[serde(default = "default_chunk_index")]
        total_chunks: u32,
    },
    ResponseComplete {},
    Status {
        state: SessionState,
    },
}

impl ServerMessage {
    /// Parse a raw server frame. Malformed or unknown messages are logged
    /// and skipped; they never terminate the session.
    pub fn parse(raw: &str) -> Option<ServerMessage> {
        match serde_json::from_str::<ServerMessage>(raw) {
            Ok(msg) => Some(msg),
            Err(e) => {
                let preview: String = raw.chars().take(100).collect();
                warn!("Ignoring unparseable server message ({}): {}", e, preview);
                None
            }
        }
    }
}
