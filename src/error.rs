//! Error types
//!
//! Crate-wide error enum shared by storage, engine and queue code.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A generation request that cannot run as configured.
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Preset error: {0}")]
    Preset(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The keep-in-VRAM API server is missing, down, or not answering.
    #[error("API server: {0}")]
    Server(String),

    #[error("Could not determine a data directory")]
    NoDataDir,
}
