//! Checkpoint persistence for cdcflow captures.
//!
//! | Module   | Responsibility |
//! |----------|----------------|
//! | `key`    | Deterministic store keys for checkpoint files |
//! | `store`  | [`CheckpointStore`] trait |
//! | `sqlite` | `SQLite` implementation with optional expiry |
//! | `error`  | [`StateError`] and crate `Result` alias |

#![warn(clippy::pedantic)]

pub mod error;
pub mod key;
pub mod sqlite;
pub mod store;

pub use error::{Result, StateError, StoreOp};
pub use key::{CheckpointFile, StateScope};
pub use sqlite::SqliteCheckpointStore;
pub use store::CheckpointStore;
