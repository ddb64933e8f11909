// Error types shared across the hub
//
// Each layer keeps its own error enum; `HubError` is the crate-wide wrapper
// that the hub, the RPC dispatch table and the server loop speak.

use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::schema::SchemaError;

/// Result type for hub operations
pub type HubResult<T> = Result<T, HubError>;

/// Errors that can occur inside the hub process
#[derive(Debug, Error)]
pub enum HubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error ({device}): {message}")]
    Device { device: String, message: String },

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unsupported device command '{command}' for {device}")]
    UnsupportedCommand { device: String, command: String },

    #[error("Malformed request: {0}")]
    Protocol(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Timebase already installed")]
    TimebaseAlreadyInstalled,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Remote call '{method}' failed: {diagnostic}")]
    Rpc { method: String, diagnostic: String },

    #[error("Hub rejected request: {0}")]
    Rejected(String),

    #[error("Hub failed to start: {0}")]
    Startup(String),
}

impl HubError {
    pub fn device(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Device {
            device: device.into(),
            message: message.into(),
        }
    }
}
