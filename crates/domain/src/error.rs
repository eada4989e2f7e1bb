/// Shared error type used across all hearth crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("adapter {adapter}: {message}")]
    Adapter { adapter: String, message: String },

    #[error("adapter {0} is not running")]
    AdapterNotRunning(String),

    #[error("unknown adapter type: {0}")]
    UnknownAdapterType(String),

    #[error("unknown secret reference: {0}")]
    UnknownSecretReference(String),

    #[error("protocol version mismatch: parent speaks {parent}, child reported {child}")]
    ProtocolVersionMismatch { parent: u32, child: u32 },

    #[error("adapter {0} exited before reporting ready")]
    ExitedBeforeReady(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
