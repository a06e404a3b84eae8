use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid server URL: {0}")]
    Url(String),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
