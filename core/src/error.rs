use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowStatsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("DNS cache error: {0}")]
    DnsCache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Batch error: {0}")]
    Batch(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, FlowStatsError>;
