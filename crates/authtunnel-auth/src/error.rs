//! Login errors

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to read service account file {path}: {source}")]
    ServiceAccountFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid server url: {0}")]
    InvalidServerUrl(String),

    #[error("failed to start listener: {0}")]
    Listener(std::io::Error),

    #[error("failed to get login url: {0}")]
    LoginUrl(String),

    #[error("failed to open browser url: {0}")]
    Browser(String),

    #[error("login callback failed: {0}")]
    Callback(String),

    #[error("login cancelled")]
    Cancelled,
}
