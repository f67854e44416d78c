use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File system error: {0}")]
    Rafs(#[from] rafs::RafsError),

    #[error("Host error: {0}")]
    System(#[from] system::SystemError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Completion channel closed while waiting for {0}")]
    ChannelClosed(&'static str),

    #[error("Short write: {written} of {requested} bytes")]
    ShortWrite { written: u32, requested: u32 },
}

pub type Result<T> = std::result::Result<T, ToolError>;
