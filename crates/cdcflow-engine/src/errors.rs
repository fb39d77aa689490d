//! Capture error model.

use cdcflow_state::StateError;
use cdcflow_types::ConversionError;

// ---------------------------------------------------------------------------
// CaptureError: categorised errors for one capture run
// ---------------------------------------------------------------------------

/// Why a capture run failed.
///
/// A missing or expired checkpoint is not an error: the run starts fresh.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// A change record could not be normalized. Fails the batch, which in
    /// turn fails the engine.
    #[error("record conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    /// The engine completed without success.
    #[error("engine failed: {0}")]
    Engine(String),

    /// Reading a stored checkpoint failed. A miss is not an error; this is
    /// raised only when the store itself fails, so the run does not restart
    /// from the beginning.
    #[error("failed to read checkpoint '{key}': {source}")]
    CheckpointRead {
        key: String,
        #[source]
        source: StateError,
    },

    /// Persisting a checkpoint file failed.
    #[error("failed to write checkpoint '{key}': {source}")]
    CheckpointWrite {
        key: String,
        #[source]
        source: StateError,
    },

    /// Working-directory or output file I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A realtime subscriber went away while records were still flowing.
    #[error("subscriber closed")]
    SubscriberClosed,

    /// Anything else (engine construction, output storage, task join).
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl CaptureError {
    /// Returns `true` if re-running the capture could plausibly succeed
    /// without any change to its inputs.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::CheckpointRead { source, .. } | Self::CheckpointWrite { source, .. } => {
                !matches!(source, StateError::LockPoisoned)
            }
            Self::Io(_) => true,
            Self::Conversion(_)
            | Self::Engine(_)
            | Self::SubscriberClosed
            | Self::Infrastructure(_) => false,
        }
    }
}
