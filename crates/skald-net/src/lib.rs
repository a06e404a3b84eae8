pub mod connection;
pub mod error;

pub use connection::{
    recv_text, send_audio_chunk, send_cache_status, send_end_speech, ServerConnection, WsSink,
    WsSource, WsStream,
};
pub use error::{NetError, Result};
