//! Embedded CDC engine lifecycle for cdcflow captures.
//!
//! | Module       | Responsibility |
//! |--------------|----------------|
//! | `normalize`  | Engine-native values to normalized values |
//! | `shape`      | Filtering, output layout, stream names |
//! | `router`     | Per-stream output files and realtime emission |
//! | `checkpoint` | Restore and persist engine working files |
//! | `controller` | Run phases, termination polling, drain |
//! | `capture`    | Bounded batch capture |
//! | `realtime`   | Unbounded streaming with cancellation |
//! | `connector`  | Engine and connector seams |
//! | `replay`     | File-backed replay engine |
//! | `config`     | YAML definition, parsing, validation |

#![warn(clippy::pedantic)]

pub mod capture;
pub mod checkpoint;
pub mod config;
pub mod connector;
pub mod controller;
pub mod errors;
pub mod normalize;
pub mod realtime;
pub mod replay;
pub mod resolve;
pub mod result;
pub mod router;
pub mod shape;

// Re-export public API for convenience
pub use capture::run_capture;
pub use errors::CaptureError;
pub use realtime::{start_stream, RealtimeHandle, RealtimeStream};
pub use result::{CaptureOutput, Counter, StreamSummary};
pub use router::{LocalStorage, OutputStorage, StreamOutput};
