//! Custom error types for the partition vault.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Device not ready: {0}")]
    NotReady(String),

    #[error("Backup validation failed: {0}")]
    Validation(String),

    #[error("Size mismatch for {partition}: image is {image_size} bytes, partition holds {capacity} bytes")]
    SizeMismatch {
        partition: String,
        image_size: u64,
        capacity: u64,
    },

    #[error("Device write failed: {0}")]
    DeviceWrite(String),

    #[error("Manifest parse error: {0}")]
    Parse(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Device error: {0}")]
    Device(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

pub type Result<T> = std::result::Result<T, VaultError>;
