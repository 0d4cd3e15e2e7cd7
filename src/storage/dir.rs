use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use super::{
    fresh_disambiguator, over_capacity, ChunkId, ChunkQueue, ChunkState, ChunkWriter,
    EvictionReport, MAX_NAME_ATTEMPTS,
};
use crate::error::StoreError;

/// Chunk queue kept as a flat directory of files.
///
/// Committed chunks are named `<timestamp>-<disambiguator>`; chunks being
/// written carry a `.part` suffix until they are renamed into place. Entries
/// with any other name are left alone.
#[derive(Debug, Clone)]
pub struct DirChunkStore {
    dir: PathBuf,
    timestamp: i64,
}

pub struct DirChunkWriter {
    id: ChunkId,
    part: PathBuf,
    target: PathBuf,
    file: BufWriter<File>,
    bytes: u64,
}

impl DirChunkStore {
    /// Open the queue at `dir`, creating the directory if needed. New chunks
    /// are stamped with `timestamp`.
    pub async fn open(dir: impl Into<PathBuf>, timestamp: i64) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::List { dir: dir.clone(), source })?;
        debug!(cache = %dir.display(), "Opened chunk cache");
        Ok(Self { dir, timestamp })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: ChunkId, state: ChunkState) -> PathBuf {
        match state {
            ChunkState::Committed => self.dir.join(id.to_string()),
            ChunkState::Writing => self.dir.join(id.part_name()),
        }
    }

    /// All chunk entries, oldest first.
    async fn scan(&self) -> Result<Vec<(ChunkId, ChunkState)>, StoreError> {
        let list_err = |source| StoreError::List { dir: self.dir.clone(), source };
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await.map_err(list_err)?;
        while let Some(entry) = dir.next_entry().await.map_err(list_err)? {
            let name = entry.file_name();
            match name.to_str().and_then(ChunkId::parse_entry) {
                Some(parsed) => entries.push(parsed),
                None => debug!(entry = ?name, "Ignoring foreign cache entry"),
            }
        }
        entries.sort_by_key(|(id, _)| *id);
        Ok(entries)
    }

    async fn reserve<F>(&self, mut next: F) -> Result<DirChunkWriter, StoreError>
    where
        F: FnMut() -> u64 + Send,
    {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let id = ChunkId::new(self.timestamp, next());
            let target = self.path_for(id, ChunkState::Committed);
            if fs::try_exists(&target).await.unwrap_or(false) {
                debug!(chunk = %id, "Chunk name taken, retrying");
                continue;
            }

            let part = self.path_for(id, ChunkState::Writing);
            match OpenOptions::new().append(true).create_new(true).open(&part).await {
                Ok(file) => {
                    return Ok(DirChunkWriter {
                        id,
                        part,
                        target,
                        file: BufWriter::new(file),
                        bytes: 0,
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(chunk = %id, "Chunk name taken, retrying");
                }
                Err(source) => {
                    return Err(StoreError::Write {
                        name: id.part_name(),
                        source,
                    })
                }
            }
        }
        Err(StoreError::Collision {
            attempts: MAX_NAME_ATTEMPTS,
        })
    }

    async fn remove_entry(&self, id: ChunkId, state: ChunkState) -> Result<(), StoreError> {
        let path = self.path_for(id, state);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Eviction {
                name: file_name(&path),
                source,
            }),
        }
    }

    /// Remove `victims` until `limit` of them are gone. Failures are logged and
    /// the next victim is tried.
    async fn evict(
        &self,
        victims: Vec<ChunkId>,
        state: ChunkState,
        limit: usize,
        reason: &'static str,
    ) -> EvictionReport {
        let mut report = EvictionReport::default();
        for id in victims {
            if report.removed.len() >= limit {
                break;
            }
            match self.remove_entry(id, state).await {
                Ok(()) => report.removed.push(id),
                Err(e) => {
                    warn!(chunk = %id, error = %e, "Eviction failed, continuing");
                    report.errors.push(e);
                }
            }
        }
        if !report.removed.is_empty() {
            info!(removed = report.removed.len(), reason, "Evicted chunks");
        }
        report
    }
}

#[async_trait]
impl ChunkWriter for DirChunkWriter {
    fn id(&self) -> ChunkId {
        self.id
    }

    async fn append_line(&mut self, line: &str) -> Result<(), StoreError> {
        let written = async {
            self.file.write_all(line.as_bytes()).await?;
            self.file.write_all(b"\n").await
        }
        .await;
        written.map_err(|source| StoreError::Write {
            name: self.id.part_name(),
            source,
        })?;
        self.bytes += line.len() as u64 + 1;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes
    }
}

#[async_trait]
impl ChunkQueue for DirChunkStore {
    type Writer = DirChunkWriter;

    async fn create_writer(&self) -> Result<DirChunkWriter, StoreError> {
        self.reserve(fresh_disambiguator).await
    }

    async fn commit(&self, writer: DirChunkWriter) -> Result<Option<ChunkId>, StoreError> {
        let DirChunkWriter {
            id,
            part,
            target,
            file,
            bytes,
        } = writer;

        if bytes == 0 {
            drop(file);
            remove_quietly(&part).await;
            debug!(chunk = %id, "Nothing written, chunk discarded");
            return Ok(None);
        }

        match publish(file, &part, &target).await {
            Ok(()) => {
                debug!(chunk = %id, bytes, "Committed chunk");
                Ok(Some(id))
            }
            Err(source) => {
                remove_quietly(&part).await;
                remove_quietly(&target).await;
                Err(StoreError::Write {
                    name: id.to_string(),
                    source,
                })
            }
        }
    }

    async fn abort(&self, writer: DirChunkWriter) {
        let DirChunkWriter { id, part, file, .. } = writer;
        drop(file);
        remove_quietly(&part).await;
        debug!(chunk = %id, "Aborted chunk");
    }

    async fn list_committed(&self) -> Result<Vec<ChunkId>, StoreError> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .filter(|(_, state)| *state == ChunkState::Committed)
            .map(|(id, _)| id)
            .collect())
    }

    async fn read_lines(&self, id: ChunkId) -> Result<Vec<String>, StoreError> {
        let path = self.path_for(id, ChunkState::Committed);
        let content = fs::read(&path).await.map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound { name: id.to_string() }
            } else {
                StoreError::Read {
                    name: id.to_string(),
                    source,
                }
            }
        })?;
        Ok(String::from_utf8_lossy(&content)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn remove(&self, id: ChunkId) -> Result<(), StoreError> {
        self.remove_entry(id, ChunkState::Committed).await
    }

    async fn evict_by_count(&self, max_chunks: usize) -> EvictionReport {
        let entries = match self.scan().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Cannot scan cache for count eviction");
                return EvictionReport::failed(e);
            }
        };
        let (excess, candidates) = over_capacity(&entries, max_chunks);
        if excess == 0 {
            return EvictionReport::default();
        }

        let report = self
            .evict(candidates, ChunkState::Committed, excess, "over capacity")
            .await;
        if report.removed.len() < excess {
            warn!(
                entries = entries.len(),
                max_chunks,
                "Cache still over capacity, remaining entries are in progress"
            );
        }
        report
    }

    async fn evict_by_age(&self, min_timestamp: i64) -> EvictionReport {
        let entries = match self.scan().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Cannot scan cache for age eviction");
                return EvictionReport::failed(e);
            }
        };
        let stale: Vec<ChunkId> = entries
            .into_iter()
            .filter(|(id, state)| *state == ChunkState::Committed && id.timestamp < min_timestamp)
            .map(|(id, _)| id)
            .collect();
        let count = stale.len();
        self.evict(stale, ChunkState::Committed, count, "expired").await
    }

    async fn sweep_orphans(&self, min_timestamp: i64) -> EvictionReport {
        let entries = match self.scan().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Cannot scan cache for orphaned chunks");
                return EvictionReport::failed(e);
            }
        };
        let orphans: Vec<ChunkId> = entries
            .into_iter()
            .filter(|(id, state)| *state == ChunkState::Writing && id.timestamp < min_timestamp)
            .map(|(id, _)| id)
            .collect();
        let count = orphans.len();
        self.evict(orphans, ChunkState::Writing, count, "orphaned").await
    }
}

/// Flush and sync the temp file, then rename it into place.
async fn publish(mut file: BufWriter<File>, part: &Path, target: &Path) -> io::Result<()> {
    file.flush().await?;
    file.get_ref().sync_all().await?;
    drop(file);
    fs::rename(part, target).await
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove chunk file");
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NOW: i64 = 1_700_000_000;

    async fn setup() -> (TempDir, DirChunkStore) {
        let dir = TempDir::new().unwrap();
        let store = DirChunkStore::open(dir.path(), NOW).await.unwrap();
        (dir, store)
    }

    fn names(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn seed(dir: &TempDir, name: &str, content: &str) {
        std::fs::write(dir.path().join(name), content).unwrap();
    }

    #[tokio::test]
    async fn commit_publishes_lines() {
        let (dir, store) = setup().await;

        let mut writer = store.create_writer().await.unwrap();
        let id = writer.id();
        assert_eq!(names(&dir), vec![id.part_name()]);

        writer.append_line("a.metric 1 42 host=x").await.unwrap();
        writer.append_line("b.metric 1 7 host=x").await.unwrap();
        let committed = store.commit(writer).await.unwrap();

        assert_eq!(committed, Some(id));
        assert_eq!(id.timestamp, NOW);
        assert_eq!(names(&dir), vec![id.to_string()]);
        let raw = std::fs::read_to_string(dir.path().join(id.to_string())).unwrap();
        assert_eq!(raw, "a.metric 1 42 host=x\nb.metric 1 7 host=x\n");
        assert_eq!(
            store.read_lines(id).await.unwrap(),
            vec!["a.metric 1 42 host=x", "b.metric 1 7 host=x"]
        );
    }

    #[tokio::test]
    async fn empty_commit_leaves_nothing() {
        let (dir, store) = setup().await;

        let writer = store.create_writer().await.unwrap();
        assert_eq!(store.commit(writer).await.unwrap(), None);

        assert!(names(&dir).is_empty());
    }

    #[tokio::test]
    async fn failed_rename_reports_write_error_and_cleans_up() {
        let (dir, store) = setup().await;

        let mut writer = store.create_writer().await.unwrap();
        let id = writer.id();
        writer.append_line("x 1 1").await.unwrap();
        std::fs::create_dir(dir.path().join(id.to_string())).unwrap();
        seed(&dir, &format!("{id}/occupied"), "");

        let result = store.commit(writer).await;

        assert!(matches!(result, Err(StoreError::Write { .. })));
        assert!(!dir.path().join(id.part_name()).exists());
        assert_eq!(names(&dir), vec![id.to_string()]);
    }

    #[tokio::test]
    async fn abort_removes_part_file() {
        let (dir, store) = setup().await;

        let mut writer = store.create_writer().await.unwrap();
        writer.append_line("x 1 1").await.unwrap();
        store.abort(writer).await;

        assert!(names(&dir).is_empty());
    }

    #[tokio::test]
    async fn reserve_skips_taken_names() {
        let (dir, store) = setup().await;
        seed(&dir, &format!("{NOW}-1"), "old 1 1\n");
        seed(&dir, &format!("{NOW}-2.part"), "");

        let mut candidates = vec![1u64, 2, 3].into_iter();
        let writer = store
            .reserve(move || candidates.next().unwrap_or(u64::MAX))
            .await
            .unwrap();

        assert_eq!(writer.id(), ChunkId::new(NOW, 3));
    }

    #[tokio::test]
    async fn reserve_gives_up_after_bounded_attempts() {
        let (dir, store) = setup().await;
        seed(&dir, &format!("{NOW}-7"), "taken 1 1\n");

        let err = store.reserve(|| 7).await.err().unwrap();

        assert!(matches!(err, StoreError::Collision { attempts } if attempts == MAX_NAME_ATTEMPTS));
    }

    #[tokio::test]
    async fn lists_committed_in_order_and_hides_parts() {
        let (dir, store) = setup().await;
        seed(&dir, "200-1", "x 1 1\n");
        seed(&dir, "100-5", "x 1 1\n");
        seed(&dir, "100-40", "x 1 1\n");
        seed(&dir, "50-1.part", "x 1");
        seed(&dir, "README", "not a chunk");

        let ids = store.list_committed().await.unwrap();

        assert_eq!(
            ids,
            vec![ChunkId::new(100, 5), ChunkId::new(100, 40), ChunkId::new(200, 1)]
        );
    }

    #[tokio::test]
    async fn count_eviction_keeps_newest() {
        let (dir, store) = setup().await;
        for ts in 1..=5 {
            seed(&dir, &format!("{ts}-0"), "x 1 1\n");
        }

        let report = store.evict_by_count(2).await;

        assert_eq!(report.removed.len(), 3);
        assert!(report.errors.is_empty());
        assert_eq!(names(&dir), vec!["4-0", "5-0"]);
    }

    #[tokio::test]
    async fn count_eviction_counts_parts_without_removing_them() {
        let (dir, store) = setup().await;
        seed(&dir, "1-0.part", "");
        seed(&dir, "2-0.part", "");
        seed(&dir, "3-0", "x 1 1\n");
        seed(&dir, "4-0", "x 1 1\n");

        let report = store.evict_by_count(3).await;
        assert_eq!(report.removed, vec![ChunkId::new(3, 0)]);
        assert_eq!(names(&dir), vec!["1-0.part", "2-0.part", "4-0"]);

        let report = store.evict_by_count(1).await;
        assert_eq!(report.removed, vec![ChunkId::new(4, 0)]);
        assert_eq!(names(&dir), vec!["1-0.part", "2-0.part"]);
    }

    #[tokio::test]
    async fn age_eviction_is_strict() {
        let (dir, store) = setup().await;
        seed(&dir, "99-0", "x 1 1\n");
        seed(&dir, "100-0", "x 1 1\n");
        seed(&dir, "101-0", "x 1 1\n");
        seed(&dir, "10-0.part", "");

        let report = store.evict_by_age(100).await;

        assert_eq!(report.removed, vec![ChunkId::new(99, 0)]);
        assert_eq!(names(&dir), vec!["10-0.part", "100-0", "101-0"]);
    }

    #[tokio::test]
    async fn sweep_removes_only_old_parts() {
        let (dir, store) = setup().await;
        seed(&dir, "10-0.part", "");
        seed(&dir, "10-1", "x 1 1\n");
        seed(&dir, "500-0.part", "");

        let report = store.sweep_orphans(100).await;

        assert_eq!(report.removed, vec![ChunkId::new(10, 0)]);
        assert_eq!(names(&dir), vec!["10-1", "500-0.part"]);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (dir, store) = setup().await;
        seed(&dir, "1-1", "x 1 1\n");

        store.remove(ChunkId::new(1, 1)).await.unwrap();
        store.remove(ChunkId::new(1, 1)).await.unwrap();

        assert!(names(&dir).is_empty());
    }

    #[tokio::test]
    async fn reading_a_vanished_chunk_is_not_found() {
        let (_dir, store) = setup().await;

        let err = store.read_lines(ChunkId::new(1, 1)).await.unwrap_err();

        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn open_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b/cache");

        let store = DirChunkStore::open(&nested, NOW).await.unwrap();

        assert!(store.dir().is_dir());
    }
}
