pub mod cache;
pub mod config;
pub mod error;
pub mod protocol;

pub use cache::{sanitize_key, AudioCache, CacheEntryMeta};
pub use config::{
    AecConfig, AppConfig, AudioConfig, CacheConfig, ClearMode, ClearPolicy, NetworkConfig,
    ServerConfig, VadConfig,
};
pub use error::{Result, SkaldError};
pub use protocol::{CacheStatus, ClientMessage, ServerMessage, SessionState, StreamKind};
