use thiserror::Error;

use crate::block::BlockError;
use crate::fs::MountError;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bus initialization failed: {0}")]
    BusInit(String),

    #[error("Medium did not respond after {attempts} attempts")]
    ProbeExhausted { attempts: u32 },

    #[error("Block device error: {0}")]
    Block(#[from] BlockError),

    #[error("Mount error: {0}")]
    Mount(#[from] MountError),

    #[error("USB install failed: {0}")]
    UsbInstall(String),

    #[error("Ownership violation: {0}")]
    OwnershipViolation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
