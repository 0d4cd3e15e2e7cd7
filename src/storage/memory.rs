use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{
    fresh_disambiguator, over_capacity, ChunkId, ChunkQueue, ChunkState, ChunkWriter,
    EvictionReport, MAX_NAME_ATTEMPTS,
};
use crate::error::StoreError;

/// Chunk queue that lives only as long as the process. Dry runs collect into
/// this so the on-disk cache is never touched.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    timestamp: i64,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    committed: BTreeMap<ChunkId, Vec<String>>,
    writing: BTreeSet<ChunkId>,
}

#[derive(Debug)]
pub struct MemoryChunkWriter {
    id: ChunkId,
    lines: Vec<String>,
    bytes: u64,
}

impl MemoryChunkStore {
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            state: Mutex::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reserve<F: FnMut() -> u64>(&self, mut next: F) -> Result<MemoryChunkWriter, StoreError> {
        let mut state = self.state();
        for _ in 0..MAX_NAME_ATTEMPTS {
            let id = ChunkId::new(self.timestamp, next());
            if state.committed.contains_key(&id) || !state.writing.insert(id) {
                continue;
            }
            return Ok(MemoryChunkWriter {
                id,
                lines: vec![],
                bytes: 0,
            });
        }
        Err(StoreError::Collision {
            attempts: MAX_NAME_ATTEMPTS,
        })
    }

    fn entries(state: &State) -> Vec<(ChunkId, ChunkState)> {
        let mut entries: Vec<_> = state
            .committed
            .keys()
            .map(|id| (*id, ChunkState::Committed))
            .chain(state.writing.iter().map(|id| (*id, ChunkState::Writing)))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }
}

#[async_trait]
impl ChunkWriter for MemoryChunkWriter {
    fn id(&self) -> ChunkId {
        self.id
    }

    async fn append_line(&mut self, line: &str) -> Result<(), StoreError> {
        self.bytes += line.len() as u64 + 1;
        self.lines.push(line.to_string());
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes
    }
}

#[async_trait]
impl ChunkQueue for MemoryChunkStore {
    type Writer = MemoryChunkWriter;

    async fn create_writer(&self) -> Result<MemoryChunkWriter, StoreError> {
        self.reserve(fresh_disambiguator)
    }

    async fn commit(&self, writer: MemoryChunkWriter) -> Result<Option<ChunkId>, StoreError> {
        let mut state = self.state();
        state.writing.remove(&writer.id);
        if writer.bytes == 0 {
            return Ok(None);
        }
        state.committed.insert(writer.id, writer.lines);
        Ok(Some(writer.id))
    }

    async fn abort(&self, writer: MemoryChunkWriter) {
        self.state().writing.remove(&writer.id);
    }

    async fn list_committed(&self) -> Result<Vec<ChunkId>, StoreError> {
        Ok(self.state().committed.keys().copied().collect())
    }

    async fn read_lines(&self, id: ChunkId) -> Result<Vec<String>, StoreError> {
        self.state()
            .committed
            .get(&id)
            .map(|lines| {
                lines
                    .iter()
                    .filter(|line| !line.trim().is_empty())
                    .cloned()
                    .collect()
            })
            .ok_or_else(|| StoreError::NotFound { name: id.to_string() })
    }

    async fn remove(&self, id: ChunkId) -> Result<(), StoreError> {
        self.state().committed.remove(&id);
        Ok(())
    }

    async fn evict_by_count(&self, max_chunks: usize) -> EvictionReport {
        let mut state = self.state();
        let (excess, candidates) = over_capacity(&Self::entries(&state), max_chunks);
        let removed: Vec<ChunkId> = candidates.into_iter().take(excess).collect();
        for id in &removed {
            state.committed.remove(id);
        }
        EvictionReport {
            removed,
            errors: vec![],
        }
    }

    async fn evict_by_age(&self, min_timestamp: i64) -> EvictionReport {
        let mut state = self.state();
        let removed: Vec<ChunkId> = state
            .committed
            .keys()
            .copied()
            .filter(|id| id.timestamp < min_timestamp)
            .collect();
        for id in &removed {
            state.committed.remove(id);
        }
        EvictionReport {
            removed,
            errors: vec![],
        }
    }

    async fn sweep_orphans(&self, min_timestamp: i64) -> EvictionReport {
        let mut state = self.state();
        let removed: Vec<ChunkId> = state
            .writing
            .iter()
            .copied()
            .filter(|id| id.timestamp < min_timestamp)
            .collect();
        for id in &removed {
            state.writing.remove(id);
        }
        EvictionReport {
            removed,
            errors: vec![],
        }
    }
}
