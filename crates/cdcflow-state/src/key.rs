//! Checkpoint store key derivation.
//!
//! A key is `[slug(flow_id) "_"] "states_" state_name ["_" discriminator] "_"
//! file_name`. The same inputs always produce the same key, so a later run of
//! the same flow finds what an earlier run wrote.

use std::fmt;

use sha2::{Digest, Sha256};

/// Length of a hashed discriminator, in hex characters.
const HASHED_DISCRIMINATOR_LEN: usize = 16;

/// Working file persisted between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointFile {
    /// Engine source offsets.
    Offsets,
    /// Schema history for connectors that need one.
    SchemaHistory,
}

impl CheckpointFile {
    /// File name inside the run's working directory; also the last key
    /// component.
    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Offsets => "offsets.dat",
            Self::SchemaHistory => "dbhistory.dat",
        }
    }
}

impl fmt::Display for CheckpointFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Identity under which one capture's checkpoints are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateScope {
    pub flow_id: Option<String>,
    pub state_name: String,
    /// Per-task-run storage token, when checkpoints are scoped to one run.
    pub discriminator: Option<String>,
    /// Replace the discriminator with a short digest in the key.
    pub hash_discriminator: bool,
}

impl StateScope {
    #[must_use]
    pub fn new(state_name: impl Into<String>) -> Self {
        Self {
            flow_id: None,
            state_name: state_name.into(),
            discriminator: None,
            hash_discriminator: false,
        }
    }

    #[must_use]
    pub fn with_flow(mut self, flow_id: impl Into<String>) -> Self {
        self.flow_id = Some(flow_id.into());
        self
    }

    #[must_use]
    pub fn with_discriminator(mut self, discriminator: impl Into<String>, hashed: bool) -> Self {
        self.discriminator = Some(discriminator.into());
        self.hash_discriminator = hashed;
        self
    }

    /// Store key for `file` within this scope.
    #[must_use]
    pub fn key(&self, file: CheckpointFile) -> String {
        let mut key = String::new();
        if let Some(flow) = self.flow_id.as_deref() {
            let slug = slugify(flow);
            if !slug.is_empty() {
                key.push_str(&slug);
                key.push('_');
            }
        }
        key.push_str("states_");
        key.push_str(&self.state_name);
        if let Some(discriminator) = self.discriminator.as_deref() {
            key.push('_');
            if self.hash_discriminator {
                key.push_str(&short_digest(discriminator));
            } else {
                key.push_str(discriminator);
            }
        }
        key.push('_');
        key.push_str(file.file_name());
        key
    }
}

/// Lowercase, collapse runs of non-alphanumerics to `-`, trim `-` at the ends.
#[must_use]
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// First 16 hex characters of the SHA-256 of `input`.
fn short_digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(HASHED_DISCRIMINATOR_LEN);
    hex
}
