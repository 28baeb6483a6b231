use std::fmt;
use std::path::{Path, PathBuf};

/// Where a test run's entry script lives.
///
/// The directory roots relative-path resolution on the worker side and is
/// always the file or one of its ancestors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScriptLocation {
    directory: PathBuf,
    file: PathBuf,
}

impl ScriptLocation {
    pub(crate) fn new(directory: &Path, file: &Path) -> Self {
        Self {
            directory: directory.to_path_buf(),
            file: file.to_path_buf(),
        }
    }

    /// Location rooted at the script's own parent directory.
    pub(crate) fn from_file(file: &Path) -> Self {
        let directory = file
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self {
            directory: directory.to_path_buf(),
            file: file.to_path_buf(),
        }
    }

    pub(crate) fn directory(&self) -> &Path {
        &self.directory
    }

    pub(crate) fn file(&self) -> &Path {
        &self.file
    }

    pub(crate) fn is_readable(&self) -> bool {
        std::fs::File::open(&self.file).is_ok()
    }
}

impl fmt::Display for ScriptLocation {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "{} (root {})",
            self.file.display(),
            self.directory.display()
        )
    }
}
