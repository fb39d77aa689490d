//! Restoring and persisting the engine's working files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cdcflow_state::{CheckpointFile, CheckpointStore, StateScope};

use crate::errors::CaptureError;

/// Store keys written by [`CheckpointContext::persist`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedKeys {
    pub offsets: Option<String>,
    pub history: Option<String>,
}

/// Binds one run's working directory to its checkpoint scope.
#[derive(Clone)]
pub struct CheckpointContext {
    store: Arc<dyn CheckpointStore>,
    scope: StateScope,
    work_dir: PathBuf,
    with_history: bool,
}

impl CheckpointContext {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        scope: StateScope,
        work_dir: impl Into<PathBuf>,
        with_history: bool,
    ) -> Self {
        Self {
            store,
            scope,
            work_dir: work_dir.into(),
            with_history,
        }
    }

    #[must_use]
    pub fn offsets_path(&self) -> PathBuf {
        self.path(CheckpointFile::Offsets)
    }

    /// Schema history path, when the connector keeps one.
    #[must_use]
    pub fn history_path(&self) -> Option<PathBuf> {
        self.with_history
            .then(|| self.path(CheckpointFile::SchemaHistory))
    }

    #[must_use]
    pub fn scope(&self) -> &StateScope {
        &self.scope
    }

    fn path(&self, file: CheckpointFile) -> PathBuf {
        self.work_dir.join(file.file_name())
    }

    fn files(&self) -> impl Iterator<Item = CheckpointFile> {
        let history = self.with_history.then_some(CheckpointFile::SchemaHistory);
        std::iter::once(CheckpointFile::Offsets).chain(history)
    }

    /// Copy stored checkpoints into the working directory.
    ///
    /// A missing or expired entry leaves the file absent and the engine
    /// starts fresh.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::CheckpointRead`] if the store fails, or
    /// [`CaptureError::Io`] if a restored file cannot be written. Either
    /// would otherwise replay the source from the beginning.
    pub fn restore(&self) -> Result<(), CaptureError> {
        for file in self.files() {
            let key = self.scope.key(file);
            let stored = self
                .store
                .get(&key)
                .map_err(|source| CaptureError::CheckpointRead {
                    key: key.clone(),
                    source,
                })?;
            let Some(bytes) = stored else {
                tracing::debug!(key = %key, "No checkpoint stored, starting fresh");
                continue;
            };
            let path = self.path(file);
            std::fs::write(&path, &bytes)?;
            tracing::info!(
                key = %key,
                bytes = bytes.len(),
                path = %path.display(),
                "Restored checkpoint"
            );
        }
        Ok(())
    }

    /// Write the working files to the store.
    ///
    /// Files the engine has not created yet are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::CheckpointWrite`] if the store rejects a
    /// write, or [`CaptureError::Io`] if a working file cannot be read.
    pub fn persist(&self) -> Result<PersistedKeys, CaptureError> {
        let mut keys = PersistedKeys::default();
        for file in self.files() {
            let Some(key) = self.persist_file(file)? else {
                continue;
            };
            match file {
                CheckpointFile::Offsets => keys.offsets = Some(key),
                CheckpointFile::SchemaHistory => keys.history = Some(key),
            }
        }
        Ok(keys)
    }

    fn persist_file(&self, file: CheckpointFile) -> Result<Option<String>, CaptureError> {
        let path = self.path(file);
        let Some(bytes) = read_if_exists(&path)? else {
            tracing::debug!(file = %file, "Working file not present, nothing to persist");
            return Ok(None);
        };
        let key = self.scope.key(file);
        self.store
            .put(&key, &bytes)
            .map_err(|source| CaptureError::CheckpointWrite {
                key: key.clone(),
                source,
            })?;
        tracing::debug!(key = %key, bytes = bytes.len(), "Persisted checkpoint");
        Ok(Some(key))
    }
}

fn read_if_exists(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
