use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::properties::Properties;

pub const USE_SAME_CONSOLE: &str = "agent.useSameConsole";
pub const CONTROLLER_SERVER_HOST: &str = "agent.controllerServerHost";
pub const SERVER_MODE: &str = "agent.servermode";
pub const USE_XMX_LIMIT: &str = "agent.useXmxLimit";

/// The agent's directory layout: worker logs and the per-user file store
/// both live under the home.
#[derive(Debug, Clone)]
pub struct AgentHome {
    directory: PathBuf,
}

impl AgentHome {
    /// Creates the home directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created.
    pub fn new(directory: &Path) -> Result<Self, ConfigError> {
        std::fs::create_dir_all(directory).map_err(|err| ConfigError::Home {
            path: directory.to_path_buf(),
            source: err,
        })?;
        Ok(Self {
            directory: directory.to_path_buf(),
        })
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    #[must_use]
    pub fn log_directory(&self) -> PathBuf {
        self.directory.join("log")
    }

    #[must_use]
    pub fn file_store_directory(&self, user: &str) -> PathBuf {
        self.directory.join("file-store").join(user)
    }
}

/// Agent-side configuration: the home plus the `agent.*` keys that tune the
/// control loop independently of any test definition.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    home: AgentHome,
    properties: Properties,
}

impl AgentConfig {
    #[must_use]
    pub fn new(home: AgentHome, properties: Properties) -> Self {
        Self { home, properties }
    }

    #[must_use]
    pub fn home(&self) -> &AgentHome {
        &self.home
    }

    #[must_use]
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key)
    }

    #[must_use]
    pub fn property_bool(&self, key: &str, default: bool) -> bool {
        self.properties.get_bool(key, default)
    }
}
