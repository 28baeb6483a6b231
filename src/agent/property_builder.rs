//! Deterministic construction of worker runtime arguments.

use std::path::{Path, PathBuf};

use crate::agent::command_line::{CLASS_PATH_SEPARATOR, join_class_path};
use crate::properties::Properties;

const DEFAULT_HEAP_ARGUMENTS: &str = "-Xms500m -Xmx500m";
const SECURITY_MANAGER_ARGUMENT: &str =
    "-Djava.security.manager=org.ngrinder.sm.NGrinderSecurityManager";

/// Computes the JVM argument string and the rebased custom classpath for one
/// test run.
pub(crate) struct PropertyBuilder {
    properties: Properties,
    script_directory: PathBuf,
    security: bool,
    etc_hosts: Option<String>,
    host_name: String,
    server_mode: bool,
    use_xmx_limit: bool,
}

impl PropertyBuilder {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        properties: Properties,
        script_directory: &Path,
        security: bool,
        etc_hosts: Option<String>,
        host_name: &str,
        server_mode: bool,
        use_xmx_limit: bool,
    ) -> Self {
        Self {
            properties,
            script_directory: script_directory.to_path_buf(),
            security,
            etc_hosts,
            host_name: host_name.to_owned(),
            server_mode,
            use_xmx_limit,
        }
    }

    pub(crate) fn build_jvm_arguments(&self) -> String {
        let configured = self.properties.get_or("grinder.jvm.arguments", "");
        let mut parts: Vec<String> = Vec::new();

        if self.server_mode && !configured.contains("-server") {
            parts.push("-server".to_owned());
        }
        if !configured.is_empty() {
            parts.push(configured.clone());
        }
        if self.use_xmx_limit && !configured.contains("-Xmx") {
            parts.push(DEFAULT_HEAP_ARGUMENTS.to_owned());
        }
        if self.security {
            parts.push(SECURITY_MANAGER_ARGUMENT.to_owned());
        }
        if let Some(hosts) = self.etc_hosts.as_deref().filter(|hosts| !hosts.is_empty()) {
            parts.push(format!(
                "-Dngrinder.etc.hosts={},{}:127.0.0.1,localhost:127.0.0.1",
                hosts, self.host_name
            ));
        }

        parts.join(" ")
    }

    /// Makes every relative classpath entry absolute against the script
    /// directory.
    pub(crate) fn rebase_custom_class_path(&self, custom: &str) -> String {
        join_class_path(custom.split(CLASS_PATH_SEPARATOR).map(|entry| {
            let trimmed = entry.trim();
            if trimmed.is_empty() || Path::new(trimmed).is_absolute() {
                trimmed.to_owned()
            } else {
                self.script_directory
                    .join(trimmed)
                    .to_string_lossy()
                    .into_owned()
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(properties: Properties, security: bool, server_mode: bool, xmx: bool) -> PropertyBuilder {
        PropertyBuilder::new(
            properties,
            Path::new("/store/run"),
            security,
            None,
            "agent-1",
            server_mode,
            xmx,
        )
    }

    #[test]
    fn heap_limit_is_added_only_when_absent() {
        let mut properties = Properties::new();
        assert_eq!(
            builder(properties.clone(), false, false, true).build_jvm_arguments(),
            "-Xms500m -Xmx500m"
        );

        properties.set("grinder.jvm.arguments", "-Xmx2g");
        assert_eq!(
            builder(properties, false, false, true).build_jvm_arguments(),
            "-Xmx2g"
        );
    }

    #[test]
    fn server_mode_and_security_flags_are_included() {
        let arguments = builder(Properties::new(), true, true, false).build_jvm_arguments();
        assert_eq!(
            arguments,
            format!("-server {}", SECURITY_MANAGER_ARGUMENT)
        );
    }

    #[test]
    fn etc_hosts_adds_a_system_property_with_the_local_mapping() {
        let builder = PropertyBuilder::new(
            Properties::new(),
            Path::new("/store"),
            false,
            Some("db.internal:10.0.0.9".to_owned()),
            "agent-1",
            false,
            false,
        );
        assert_eq!(
            builder.build_jvm_arguments(),
            "-Dngrinder.etc.hosts=db.internal:10.0.0.9,agent-1:127.0.0.1,localhost:127.0.0.1"
        );
    }

    #[test]
    fn relative_classpath_entries_are_rebased_against_the_script_directory() {
        let builder = builder(Properties::new(), false, false, false);
        assert_eq!(
            builder.rebase_custom_class_path("lib/a.jar:/abs/b.jar:c.jar"),
            "/store/run/lib/a.jar:/abs/b.jar:/store/run/c.jar"
        );
        assert_eq!(builder.rebase_custom_class_path(""), "");
    }
}
