//! Ordered durable queue of check output.
//!
//! Every check invocation that produced output becomes one chunk. A chunk is
//! written under a temporary identity and becomes visible to the sender only
//! through a single atomic commit. Chunks are ordered by creation time, then by
//! a random disambiguator, and that order is the delivery order.

mod dir;
mod memory;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::error::StoreError;

pub use dir::{DirChunkStore, DirChunkWriter};
pub use memory::{MemoryChunkStore, MemoryChunkWriter};

/// Suffix of chunks that are still being written.
pub const PART_SUFFIX: &str = ".part";

/// How many fresh names `create_writer` tries before giving up.
pub const MAX_NAME_ATTEMPTS: u32 = 16;

/// Identity of a chunk, serialized as `<timestamp>-<disambiguator>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId {
    pub timestamp: i64,
    pub disambiguator: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Writing,
    Committed,
}

impl ChunkId {
    pub fn new(timestamp: i64, disambiguator: u64) -> Self {
        Self {
            timestamp,
            disambiguator,
        }
    }

    pub fn part_name(&self) -> String {
        format!("{self}{PART_SUFFIX}")
    }

    /// Parse a cache directory entry name. Anything that is not a chunk name
    /// yields `None`.
    pub fn parse_entry(name: &str) -> Option<(ChunkId, ChunkState)> {
        match name.strip_suffix(PART_SUFFIX) {
            Some(base) => base.parse().ok().map(|id| (id, ChunkState::Writing)),
            None => name.parse().ok().map(|id| (id, ChunkState::Committed)),
        }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.timestamp, self.disambiguator)
    }
}

impl FromStr for ChunkId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ts, n) = s.split_once('-').ok_or(())?;
        let all_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(ts) || !all_digits(n) {
            return Err(());
        }
        Ok(Self::new(
            ts.parse().map_err(|_| ())?,
            n.parse().map_err(|_| ())?,
        ))
    }
}

/// What a maintenance pass removed and which removals failed.
#[derive(Debug, Default)]
pub struct EvictionReport {
    pub removed: Vec<ChunkId>,
    pub errors: Vec<StoreError>,
}

impl EvictionReport {
    pub fn failed(error: StoreError) -> Self {
        Self {
            removed: vec![],
            errors: vec![error],
        }
    }
}

/// An in-progress chunk, open for appending.
#[async_trait]
pub trait ChunkWriter: Send {
    fn id(&self) -> ChunkId;

    /// Append one line; the terminating newline is added here.
    async fn append_line(&mut self, line: &str) -> Result<(), StoreError>;

    fn bytes_written(&self) -> u64;
}

/// The queue the check runner fills and the sender drains.
///
/// Implementations must tolerate another process working on the same queue:
/// removals of chunks that are already gone succeed, and every identity handed
/// out by `create_writer` is fresh.
#[async_trait]
pub trait ChunkQueue: Send + Sync {
    type Writer: ChunkWriter;

    /// Reserve a fresh identity at the run timestamp and open it for writing.
    async fn create_writer(&self) -> Result<Self::Writer, StoreError>;

    /// Publish the chunk. Nothing is published, and `None` is returned, when
    /// no bytes were written.
    async fn commit(&self, writer: Self::Writer) -> Result<Option<ChunkId>, StoreError>;

    /// Throw away an in-progress chunk.
    async fn abort(&self, writer: Self::Writer);

    /// Committed chunks, oldest first.
    async fn list_committed(&self) -> Result<Vec<ChunkId>, StoreError>;

    /// Non-blank lines of a committed chunk, without terminators. Bytes that
    /// are not valid UTF-8 come back as U+FFFD.
    async fn read_lines(&self, id: ChunkId) -> Result<Vec<String>, StoreError>;

    async fn remove(&self, id: ChunkId) -> Result<(), StoreError>;

    /// Drop the oldest committed chunks while the total number of entries,
    /// in-progress ones included, exceeds `max_chunks`.
    async fn evict_by_count(&self, max_chunks: usize) -> EvictionReport;

    /// Drop committed chunks created before `min_timestamp`.
    async fn evict_by_age(&self, min_timestamp: i64) -> EvictionReport;

    /// Drop in-progress chunks created before `min_timestamp`; these are
    /// leftovers of runs that died mid-write.
    async fn sweep_orphans(&self, min_timestamp: i64) -> EvictionReport;
}

/// Pick the committed chunks to evict so that `entries` fits into `max_chunks`.
/// `entries` must be sorted oldest first.
pub(crate) fn over_capacity(entries: &[(ChunkId, ChunkState)], max_chunks: usize) -> (usize, Vec<ChunkId>) {
    let excess = entries.len().saturating_sub(max_chunks);
    let candidates = entries
        .iter()
        .filter(|(_, state)| *state == ChunkState::Committed)
        .map(|(id, _)| *id)
        .collect();
    (excess, candidates)
}

pub(crate) fn fresh_disambiguator() -> u64 {
    rand::random()
}
