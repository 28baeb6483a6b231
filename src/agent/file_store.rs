//! Per-user disk area populated by the console's distribution mechanism.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, info};

use crate::console::dispatch::MessageDispatcher;
use crate::console::protocol::WireMessage;
use crate::error::FileStoreError;

/// Sink for file-distribution messages.
///
/// One store exists per agent process, created lazily on the first successful
/// console connection. The cache high-water mark is echoed in every process
/// report so the console knows whether a redistribution is needed; it only
/// ever moves forward.
pub(crate) struct FileStore {
    directory: PathBuf,
    high_water_mark: AtomicU64,
}

impl FileStore {
    pub(crate) fn new(directory: &Path) -> Result<Self, FileStoreError> {
        std::fs::create_dir_all(directory).map_err(|err| FileStoreError::Create {
            path: directory.to_path_buf(),
            source: err,
        })?;
        info!("File store at {}", directory.display());
        Ok(Self {
            directory: directory.to_path_buf(),
            high_water_mark: AtomicU64::new(0),
        })
    }

    pub(crate) fn directory(&self) -> &Path {
        &self.directory
    }

    pub(crate) fn cache_high_water_mark(&self) -> u64 {
        self.high_water_mark.load(Ordering::Acquire)
    }

    /// Installs handlers consuming distribution traffic. Anything else falls
    /// through to the dispatcher's fallback.
    pub(crate) fn register_message_handlers(self: &Arc<Self>, dispatcher: &mut MessageDispatcher) {
        let store = Arc::clone(self);
        dispatcher.add_handler(Box::new(move |message| match message {
            WireMessage::DistributeFile(distribute) => {
                let contents = BASE64
                    .decode(&distribute.contents_b64)
                    .map_err(|err| FileStoreError::Decode { source: err })?;
                store.write_file(&distribute.path, &contents)?;
                store.advance_water_mark(distribute.high_water_mark);
                Ok(true)
            }
            WireMessage::ClearCache(clear) => {
                store.clear()?;
                store.advance_water_mark(clear.high_water_mark);
                Ok(true)
            }
            _ => Ok(false),
        }));
    }

    fn write_file(&self, relative: &str, contents: &[u8]) -> Result<(), FileStoreError> {
        let target = self.resolve(relative)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|err| FileStoreError::Write {
                path: target.clone(),
                source: err,
            })?;
        }
        std::fs::write(&target, contents).map_err(|err| FileStoreError::Write {
            path: target.clone(),
            source: err,
        })?;
        debug!("Received {} ({} bytes)", target.display(), contents.len());
        Ok(())
    }

    fn clear(&self) -> Result<(), FileStoreError> {
        let entries = std::fs::read_dir(&self.directory).map_err(|err| FileStoreError::Clear {
            path: self.directory.clone(),
            source: err,
        })?;
        for entry in entries {
            let entry = entry.map_err(|err| FileStoreError::Clear {
                path: self.directory.clone(),
                source: err,
            })?;
            let path = entry.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            result.map_err(|err| FileStoreError::Clear {
                path,
                source: err,
            })?;
        }
        debug!("File store cleared");
        Ok(())
    }

    fn advance_water_mark(&self, mark: u64) {
        self.high_water_mark.fetch_max(mark, Ordering::AcqRel);
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, FileStoreError> {
        let path = Path::new(relative);
        let escapes = path.is_absolute()
            || path
                .components()
                .any(|component| matches!(component, Component::ParentDir));
        if escapes {
            return Err(FileStoreError::InvalidPath {
                path: relative.to_owned(),
            });
        }
        Ok(self.directory.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::dispatch::MessageSink;
    use crate::console::protocol::{ClearCacheMessage, DistributeFileMessage};
    use crate::error::{AgentError, AgentResult};

    fn distribute(path: &str, contents: &[u8], mark: u64) -> WireMessage {
        WireMessage::DistributeFile(Box::new(DistributeFileMessage {
            path: path.to_owned(),
            contents_b64: BASE64.encode(contents),
            high_water_mark: mark,
        }))
    }

    fn store_with_dispatcher() -> AgentResult<(tempfile::TempDir, Arc<FileStore>, MessageDispatcher)>
    {
        let dir = tempfile::tempdir()?;
        let store =
            Arc::new(FileStore::new(&dir.path().join("store")).map_err(AgentError::file_store)?);
        let mut dispatcher = MessageDispatcher::new();
        store.register_message_handlers(&mut dispatcher);
        Ok((dir, store, dispatcher))
    }

    #[test]
    fn distributed_files_land_under_the_store_directory() -> AgentResult<()> {
        let (_dir, store, dispatcher) = store_with_dispatcher()?;

        dispatcher.send(&distribute("scripts/load.py", b"run()", 4))?;
        let written = std::fs::read(store.directory().join("scripts/load.py"))?;
        assert_eq!(written, b"run()");
        assert_eq!(store.cache_high_water_mark(), 4);
        Ok(())
    }

    #[test]
    fn water_mark_is_monotonic() -> AgentResult<()> {
        let (_dir, store, dispatcher) = store_with_dispatcher()?;

        dispatcher.send(&distribute("a.py", b"a", 9))?;
        dispatcher.send(&distribute("b.py", b"b", 3))?;
        assert_eq!(store.cache_high_water_mark(), 9);
        Ok(())
    }

    #[test]
    fn clear_cache_empties_the_store() -> AgentResult<()> {
        let (_dir, store, dispatcher) = store_with_dispatcher()?;

        dispatcher.send(&distribute("keep/a.py", b"a", 1))?;
        dispatcher.send(&WireMessage::ClearCache(ClearCacheMessage {
            high_water_mark: 2,
        }))?;

        assert!(!store.directory().join("keep").exists());
        assert!(store.directory().exists());
        assert_eq!(store.cache_high_water_mark(), 2);
        Ok(())
    }

    #[test]
    fn paths_escaping_the_store_are_rejected() -> AgentResult<()> {
        let (_dir, _store, dispatcher) = store_with_dispatcher()?;

        let result = dispatcher.send(&distribute("../outside.py", b"x", 1));
        assert!(matches!(
            result,
            Err(AgentError::FileStore(FileStoreError::InvalidPath { .. }))
        ));
        Ok(())
    }

    #[test]
    fn non_distribution_messages_fall_through() -> AgentResult<()> {
        let (_dir, _store, dispatcher) = store_with_dispatcher()?;
        // No fallback registered: falling through is simply a no-op.
        dispatcher.send(&WireMessage::Stop)?;
        Ok(())
    }
}
