//! Worker process invocation, computed once per test run.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::properties::Properties;

/// Entry point handed to every worker JVM.
const WORKER_MAIN_CLASS: &str = "net.grinder.engine.process.WorkerProcessEntryPoint";

/// Jars that must lead the worker classpath (instrumentation bootstrap).
const FOREMOST_MARKER: &str = "dcr-agent";

/// Jars that carry hot fixes and go ahead of everything else.
const PATCH_MARKER: &str = "patch";

/// Jars that would re-instrument the worker if inherited from the agent.
const SELF_INSTRUMENTATION_MARKERS: &[&str] = &["javaagent", "jacoco"];

#[cfg(windows)]
pub(crate) const CLASS_PATH_SEPARATOR: char = ';';
#[cfg(not(windows))]
pub(crate) const CLASS_PATH_SEPARATOR: char = ':';

/// Classpath entries that should be moved to the front of the worker
/// classpath: the instrumentation bootstrap segment, then patch jars.
pub(crate) fn filter_foremost_class_path(class_path: &str) -> String {
    let foremost = class_path
        .split(CLASS_PATH_SEPARATOR)
        .filter(|entry| entry_name(entry).contains(FOREMOST_MARKER));
    let patches = class_path
        .split(CLASS_PATH_SEPARATOR)
        .filter(|entry| entry_name(entry).contains(PATCH_MARKER));
    join_class_path(foremost.chain(patches).map(str::to_owned))
}

/// The agent's classpath with self-instrumentation entries dropped, safe to
/// hand to a worker.
pub(crate) fn filter_system_class_path(class_path: &str) -> String {
    join_class_path(
        class_path
            .split(CLASS_PATH_SEPARATOR)
            .filter(|entry| {
                let name = entry_name(entry);
                !SELF_INSTRUMENTATION_MARKERS
                    .iter()
                    .any(|marker| name.contains(marker))
            })
            .map(str::to_owned),
    )
}

pub(crate) fn join_class_path<I>(entries: I) -> String
where
    I: IntoIterator<Item = String>,
{
    let parts: Vec<String> = entries
        .into_iter()
        .filter(|entry| !entry.trim().is_empty())
        .collect();
    parts.join(&CLASS_PATH_SEPARATOR.to_string())
}

fn entry_name(entry: &str) -> &str {
    entry.rsplit(['/', '\\']).next().unwrap_or(entry)
}

/// Argument vector and working directory for one worker process; identical
/// for every worker of a run.
#[derive(Debug, Clone)]
pub(crate) struct WorkerProcessCommandLine {
    command: Vec<String>,
    working_directory: PathBuf,
}

impl WorkerProcessCommandLine {
    pub(crate) fn new(
        properties: &Properties,
        system_class_path: &str,
        jvm_arguments: &str,
        script_directory: &Path,
    ) -> Self {
        let mut command = vec![properties.get_or("grinder.jvm", "java")];
        command.extend(jvm_arguments.split_whitespace().map(str::to_owned));

        let class_path = join_class_path([
            system_class_path.to_owned(),
            properties.get_or("grinder.jvm.classpath", ""),
        ]);
        if !class_path.is_empty() {
            command.push("-classpath".to_owned());
            command.push(class_path);
        }
        command.push(WORKER_MAIN_CLASS.to_owned());

        Self {
            command,
            working_directory: script_directory.to_path_buf(),
        }
    }

    pub(crate) fn command(&self) -> &[String] {
        &self.command
    }

    pub(crate) fn working_directory(&self) -> &Path {
        &self.working_directory
    }
}

impl fmt::Display for WorkerProcessCommandLine {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for argument in &self.command {
            if !first {
                write!(formatter, " ")?;
            }
            if argument.contains(' ') {
                write!(formatter, "\"{}\"", argument)?;
            } else {
                write!(formatter, "{}", argument)?;
            }
            first = false;
        }
        write!(formatter, " (in {})", self.working_directory.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foremost_filter_moves_bootstrap_and_patch_jars_forward() {
        let class_path = "/lib/app.jar:/lib/dcr-agent-1.2.jar:/lib/patch-3.jar";
        assert_eq!(
            filter_foremost_class_path(class_path),
            "/lib/dcr-agent-1.2.jar:/lib/patch-3.jar"
        );
        assert_eq!(filter_foremost_class_path("/lib/app.jar"), "");
    }

    #[test]
    fn system_filter_drops_self_instrumentation_entries() {
        let class_path = "/lib/core.jar:/lib/javaagent-9.jar:/lib/jacoco-cover.jar:/lib/util.jar";
        assert_eq!(
            filter_system_class_path(class_path),
            "/lib/core.jar:/lib/util.jar"
        );
    }

    #[test]
    fn marker_match_uses_the_file_name_not_the_directory() {
        let class_path = "/opt/patches/lib/core.jar";
        assert_eq!(filter_foremost_class_path(class_path), "");
        assert_eq!(filter_system_class_path("/opt/jacoco/core.jar"), "/opt/jacoco/core.jar");
    }

    #[test]
    fn command_line_orders_jvm_arguments_classpath_and_entry_point() {
        let mut properties = Properties::new();
        properties.set("grinder.jvm.classpath", "worker.jar");
        let command_line = WorkerProcessCommandLine::new(
            &properties,
            "/lib/core.jar",
            "-Xmx500m -Dkey=value",
            Path::new("/store"),
        );

        assert_eq!(
            command_line.command(),
            [
                "java",
                "-Xmx500m",
                "-Dkey=value",
                "-classpath",
                "/lib/core.jar:worker.jar",
                "net.grinder.engine.process.WorkerProcessEntryPoint",
            ]
        );
        assert_eq!(command_line.working_directory(), Path::new("/store"));
    }

    #[test]
    fn empty_classpath_segments_are_omitted() {
        let command_line = WorkerProcessCommandLine::new(
            &Properties::new(),
            "",
            "",
            Path::new("/store"),
        );
        assert_eq!(
            command_line.command(),
            ["java", "net.grinder.engine.process.WorkerProcessEntryPoint"]
        );
    }
}
