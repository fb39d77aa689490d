//! Checkpoint store errors.

use std::path::PathBuf;

/// Why a checkpoint store operation failed.
///
/// A missing or expired entry is not an error; reads report it as `None`.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The directory holding the database file could not be created.
    #[error("cannot create checkpoint directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A statement against the checkpoint database failed.
    #[error("checkpoint {operation} failed: {source}")]
    Database {
        operation: StoreOp,
        #[source]
        source: rusqlite::Error,
    },

    /// A thread panicked while holding the connection.
    #[error("checkpoint store lock poisoned")]
    LockPoisoned,
}

/// Store operation named in [`StateError::Database`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Open,
    Read,
    Write,
    Purge,
}

impl std::fmt::Display for StoreOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Read => "read",
            Self::Write => "write",
            Self::Purge => "purge",
        })
    }
}

impl StateError {
    pub(crate) fn database(operation: StoreOp) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Database { operation, source }
    }
}

pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_error_names_the_operation() {
        let inner = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(5),
            Some("database is locked".into()),
        );
        let msg = StateError::database(StoreOp::Write)(inner).to_string();
        assert!(msg.starts_with("checkpoint write failed:"), "got: {msg}");
        assert!(msg.contains("database is locked"), "got: {msg}");
    }

    #[test]
    fn create_dir_error_names_the_path() {
        let err = StateError::CreateDir {
            path: PathBuf::from("/ro/state"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(
            err.to_string(),
            "cannot create checkpoint directory /ro/state: denied"
        );
    }
}
