use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Worker {name} has no control stream.")]
    MissingControlStream { name: String },
    #[error("Failed to wait for worker {name}: {source}")]
    Wait {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to create worker log directory {path}: {source}")]
    LogDirectory {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}
