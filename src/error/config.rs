use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to create agent home {path}: {source}")]
    Home {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read properties file {path}: {source}")]
    PropertiesRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write properties file {path}: {source}")]
    PropertiesWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed property at {path}:{line} (expected key=value)")]
    PropertiesParse { path: PathBuf, line: usize },
    #[error("The script file {path} does not exist or is not readable.")]
    UnreadableScript { path: PathBuf },
    #[error("Start message received before a file store was created.")]
    MissingFileStore,
    #[error("{message}")]
    Message { message: String },
}

impl From<&'static str> for ConfigError {
    fn from(value: &'static str) -> Self {
        ConfigError::Message {
            message: value.to_owned(),
        }
    }
}

impl From<String> for ConfigError {
    fn from(value: String) -> Self {
        ConfigError::Message { message: value }
    }
}
