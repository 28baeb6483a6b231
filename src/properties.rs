//! Ordered test properties with typed accessors.
//!
//! Property sets travel from the console inside start messages and are merged
//! over the agent's own configuration before each run. Keys are ordinary
//! strings; a property set may carry an associated directory against which
//! relative file values are resolved.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::ConfigError;

pub const CONSOLE_HOST: &str = "grinder.consoleHost";
pub const CONSOLE_PORT: &str = "grinder.consolePort";
pub const LOG_DIRECTORY: &str = "grinder.logDirectory";
pub const SCRIPT: &str = "grinder.script";

/// Script used when neither the start message nor the agent names one.
pub const DEFAULT_SCRIPT: &str = "grinder.py";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    values: BTreeMap<String, String>,
    associated_directory: Option<PathBuf>,
}

impl Properties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_map(values: BTreeMap<String, String>) -> Self {
        Self {
            values,
            associated_directory: None,
        }
    }

    /// Loads a `key=value` properties file. Blank lines and lines starting
    /// with `#` or `!` are skipped. The file's parent directory becomes the
    /// associated directory for relative-path resolution.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or a line has no `=`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|err| ConfigError::PropertiesRead {
            path: path.to_path_buf(),
            source: err,
        })?;

        let mut properties = Properties {
            values: BTreeMap::new(),
            associated_directory: path.parent().map(Path::to_path_buf),
        };
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or(ConfigError::PropertiesParse {
                path: path.to_path_buf(),
                line: index + 1,
            })?;
            properties
                .values
                .insert(key.trim().to_owned(), value.trim().to_owned());
        }
        Ok(properties)
    }

    /// Writes the properties back out in `key=value` line format.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let mut content = String::new();
        for (key, value) in &self.values {
            content.push_str(key);
            content.push('=');
            content.push_str(value);
            content.push('\n');
        }
        std::fs::write(path, content).map_err(|err| ConfigError::PropertiesWrite {
            path: path.to_path_buf(),
            source: err,
        })
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_owned()
    }

    #[must_use]
    pub fn get_int(&self, key: &str, default: i32) -> i32 {
        match self.get(key) {
            Some(value) => value.trim().parse().unwrap_or_else(|_| {
                warn!("Property {} has non-integer value {:?}; using {}", key, value, default);
                default
            }),
            None => default,
        }
    }

    #[must_use]
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => true,
                "false" | "no" | "0" => false,
                other => {
                    warn!("Property {} has non-boolean value {:?}; using {}", key, other, default);
                    default
                }
            },
            None => default,
        }
    }

    #[must_use]
    pub fn get_file(&self, key: &str, default: &str) -> PathBuf {
        PathBuf::from(self.get(key).unwrap_or(default))
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_owned(), value.to_owned());
    }

    pub fn set_file(&mut self, key: &str, path: &Path) {
        self.values
            .insert(key.to_owned(), path.to_string_lossy().into_owned());
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Merges `other` over this set; `other`'s values win on conflict.
    pub fn put_all(&mut self, other: &Properties) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    #[must_use]
    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    #[must_use]
    pub fn associated_directory(&self) -> Option<&Path> {
        self.associated_directory.as_deref()
    }

    pub fn set_associated_directory(&mut self, directory: PathBuf) {
        self.associated_directory = Some(directory);
    }

    /// Rebases a relative path against the associated directory. Absolute
    /// paths and paths with no associated directory pass through unchanged.
    #[must_use]
    pub fn resolve_relative_file(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match &self.associated_directory {
            Some(directory) => directory.join(path),
            None => path.to_path_buf(),
        }
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        write!(formatter, "{{")?;
        for (key, value) in &self.values {
            if !first {
                write!(formatter, ", ")?;
            }
            write!(formatter, "{}={}", key, value)?;
            first = false;
        }
        write!(formatter, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AgentError, AgentResult};

    #[test]
    fn typed_accessors_fall_back_to_defaults() {
        let mut properties = Properties::new();
        properties.set("grinder.processes", "4");
        properties.set("grinder.useConsole", "false");
        properties.set("grinder.bad", "not-a-number");

        assert_eq!(properties.get_int("grinder.processes", 1), 4);
        assert_eq!(properties.get_int("grinder.missing", 7), 7);
        assert_eq!(properties.get_int("grinder.bad", 9), 9);
        assert!(!properties.get_bool("grinder.useConsole", true));
        assert!(properties.get_bool("grinder.missing", true));
    }

    #[test]
    fn resolve_relative_file_rebases_against_associated_directory() {
        let mut properties = Properties::new();
        assert_eq!(
            properties.resolve_relative_file(Path::new("a.py")),
            PathBuf::from("a.py")
        );

        properties.set_associated_directory(PathBuf::from("/store"));
        assert_eq!(
            properties.resolve_relative_file(Path::new("sub/a.py")),
            PathBuf::from("/store/sub/a.py")
        );
        assert_eq!(
            properties.resolve_relative_file(Path::new("/abs/a.py")),
            PathBuf::from("/abs/a.py")
        );
    }

    #[test]
    fn put_all_overrides_existing_keys() {
        let mut base = Properties::new();
        base.set("grinder.processes", "1");
        base.set("grinder.consoleHost", "left-alone");

        let mut overrides = Properties::new();
        overrides.set("grinder.processes", "8");
        overrides.set("grinder.script", "other.py");

        base.put_all(&overrides);
        assert_eq!(base.get("grinder.processes"), Some("8"));
        assert_eq!(base.get("grinder.consoleHost"), Some("left-alone"));
        assert_eq!(base.get("grinder.script"), Some("other.py"));
    }

    #[test]
    fn save_then_load_round_trips_every_key() -> AgentResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run.properties");

        let mut original = Properties::new();
        original.set("grinder.processes", "3");
        original.set("grinder.script", "load.py");
        original.set("grinder.duration", "60000");
        original.save(&path).map_err(AgentError::config)?;

        let loaded = Properties::load(&path).map_err(AgentError::config)?;
        for (key, value) in original.values() {
            assert_eq!(loaded.get(key), Some(value.as_str()), "key {}", key);
        }
        assert_eq!(loaded.associated_directory(), Some(dir.path()));
        Ok(())
    }

    #[test]
    fn load_skips_comments_and_rejects_malformed_lines() -> AgentResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("agent.properties");
        std::fs::write(&path, "# comment\n\ngrinder.processes = 2\nbroken-line\n")?;

        let result = Properties::load(&path);
        assert!(matches!(
            result,
            Err(ConfigError::PropertiesParse { line: 4, .. })
        ));

        std::fs::write(&path, "# comment\ngrinder.processes = 2\n")?;
        let loaded = Properties::load(&path).map_err(AgentError::config)?;
        assert_eq!(loaded.get("grinder.processes"), Some("2"));
        Ok(())
    }
}
