//! Error types for mobikit operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while inspecting, editing or splitting a book.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Config file error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Could not move output into place: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Invalid MOBI: {0}")]
    InvalidMobi(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Problem locating unpacked file: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error(
        "{} exited with {}",
        .command.join(" "),
        .code.map_or_else(|| "no exit code".to_string(), |c| c.to_string())
    )]
    ToolFailed {
        command: Vec<String>,
        code: Option<i32>,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for the errors that mean "this file is not a container we can read".
    pub fn is_format_error(&self) -> bool {
        matches!(self, Error::InvalidMobi(_) | Error::UnsupportedFormat(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
