mod agent;
mod communication;
mod config;
mod file_store;
mod worker;

pub use agent::{AgentError, AgentResult};
pub use communication::CommunicationError;
pub use config::ConfigError;
pub use file_store::FileStoreError;
pub use worker::WorkerError;
