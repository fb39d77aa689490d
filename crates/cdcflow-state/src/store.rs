//! Checkpoint store trait.

use crate::error;

/// Durable key -> bytes storage for checkpoint files.
///
/// Implementations must be `Send + Sync`: the engine thread writes after
/// every committed batch while the controller task may write at shutdown.
/// Writes are last-writer-wins per key.
pub trait CheckpointStore: Send + Sync {
    /// Read the bytes stored under `key`.
    ///
    /// Returns `Ok(None)` when nothing is stored or the entry has expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    fn get(&self, key: &str) -> error::Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    fn put(&self, key: &str, value: &[u8]) -> error::Result<()>;
}
