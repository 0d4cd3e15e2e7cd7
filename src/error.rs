//! Error taxonomy for the check and delivery pipeline.
//!
//! None of these abort a run. Each is caught where it happens, logged, and
//! recorded in the summary of the phase that produced it. `anyhow` is only used
//! by the binary for fatal setup problems (configuration, cache directory).

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::Endpoint;

/// A configured endpoint string could not be parsed.
#[derive(Debug, thiserror::Error)]
#[error("invalid endpoint '{input}': {reason}")]
pub struct EndpointError {
    pub input: String,
    pub reason: &'static str,
}

/// Failures of the chunk queue.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Creating, appending to, or committing a chunk failed. The partial file
    /// has already been removed when this is returned.
    #[error("chunk {name}: write failed: {source}")]
    Write {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Every candidate chunk name was already taken.
    #[error("no free chunk name after {attempts} attempts")]
    Collision { attempts: u32 },

    #[error("chunk {name}: read failed: {source}")]
    Read {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The chunk disappeared, usually because another invocation delivered or
    /// evicted it first.
    #[error("chunk {name} no longer exists")]
    NotFound { name: String },

    #[error("failed to list {}: {source}", dir.display())]
    List {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A delete during maintenance failed.
    #[error("failed to evict {name}: {source}")]
    Eviction {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Per-check failures.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    /// The file is not something we can run.
    #[error("check {}: not usable: {reason}", path.display())]
    Discovery { path: PathBuf, reason: String },

    #[error("check {}: failed to spawn: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("check {}: killed after {after:?}", path.display())]
    Timeout { path: PathBuf, after: Duration },

    /// Waiting on the process failed after it was spawned.
    #[error("check {}: failed to collect output: {source}", path.display())]
    Wait {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Why a delivery candidate was abandoned.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("{endpoint}: connect failed: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    /// The liveness probe got no usable answer.
    #[error("{endpoint}: liveness probe failed: {reason}")]
    Protocol { endpoint: Endpoint, reason: String },

    #[error("{endpoint}: connection lost while streaming: {source}")]
    Io {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("{endpoint}: {source}")]
    Store {
        endpoint: Endpoint,
        #[source]
        source: StoreError,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}
