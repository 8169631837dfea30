use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImporterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid point: {0}")]
    InvalidPoint(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("HTTP server error: {0}")]
    Server(String),
}

pub type Result<T> = std::result::Result<T, ImporterError>;
