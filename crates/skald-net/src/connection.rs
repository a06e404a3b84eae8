use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use skald_core::protocol::{CacheStatus, ClientMessage};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::error::{NetError, Result};

/// Server messages can carry whole WAV sentences; cap frames at 4 MiB.
const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsStream, Message>;
pub type WsSource = SplitStream<WsStream>;

/// WebSocket connection to the assistant server. Reconnection policy lives
/// at the session level; this only knows how to dial and frame messages.
pub struct ServerConnection {
    url: String,
}

impl ServerConnection {
    pub fn new(url: String) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Dial the server and return the split connection halves.
    pub async fn connect(&self) -> Result<(WsSink, WsSource)> {
        let url = Url::parse(&self.url).map_err(|e| NetError::Url(format!("{}: {}", self.url, e)))?;

        info!("Connecting to {}...", url);
        let config = WebSocketConfig::default()
            .max_message_size(Some(MAX_MESSAGE_BYTES))
            .max_frame_size(Some(MAX_MESSAGE_BYTES));
        let (ws_stream, _) = connect_async_with_config(url.as_str(), Some(config), false).await?;
        info!("Connected to server");

        Ok(ws_stream.split())
    }
}

async fn send_message(sink: &mut WsSink, msg: &ClientMessage) -> Result<()> {
    let json = serde_json::to_string(msg)?;
    sink.send(Message::Text(json.into())).await?;
    Ok(())
}

/// Transmit one chunk of int16 LE PCM as a base64 `audio_chunk` message.
pub async fn send_audio_chunk(sink: &mut WsSink, samples: &[i16]) -> Result<()> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    let msg = ClientMessage::AudioChunk {
        data: BASE64.encode(&bytes),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    send_message(sink, &msg).await
}

/// Signal end of the current utterance.
pub async fn send_end_speech(sink: &mut WsSink) -> Result<()> {
    let msg = ClientMessage::EndSpeech {
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    send_message(sink, &msg).await
}

/// Report whether a cache key is already present on this client.
pub async fn send_cache_status(sink: &mut WsSink, cache_key: &str, status: CacheStatus) -> Result<()> {
    let msg = ClientMessage::AudioCacheStatus {
        cache_key: cache_key.to_string(),
        status,
    };
    send_message(sink, &msg).await
}

/// Receive the next text frame. `Ok(None)` means the server closed the
/// connection; control frames are skipped.
pub async fn recv_text(source: &mut WsSource) -> Result<Option<String>> {
    while let Some(msg) = source.next().await {
        match msg? {
            Message::Text(text) => return Ok(Some(text.to_string())),
            Message::Close(_) => {
                info!("WebSocket closed by server");
                return Ok(None);
            }
            other => {
                debug!("Skipping non-text frame: {:?}", other);
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_rejected() {
        let conn = ServerConnection::new("not a url".to_string());
        let result = tokio_test::block_on(conn.connect());
        assert!(matches!(result, Err(NetError::Url(_))));
    }

    #[test]
    fn test_audio_chunk_base64_is_little_endian() {
        let samples = [0x0102i16, -2];
        let mut bytes = Vec::new();
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        assert_eq!(bytes, vec![0x02, 0x01, 0xFE, 0xFF]);
        assert_eq!(BASE64.encode(&bytes), "AgH+/w==");
    }
}
