use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("Failed to create file store directory {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write distributed file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to clear file store {path}: {source}")]
    Clear {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Distributed file path {path} escapes the file store.")]
    InvalidPath { path: String },
    #[error("Distributed file payload was not valid base64: {source}")]
    Decode {
        #[source]
        source: base64::DecodeError,
    },
}
