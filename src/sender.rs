//! Delivery of queued chunks to a TSD over its line protocol.
//!
//! The protocol is plain text over TCP: `version\n` is answered with one line,
//! `put <metric line>\n` is not answered at all. Each chunk is deleted as soon
//! as its last line has been written to the socket, so a chunk is sent at most
//! once from the queue's point of view.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::SenderConfig;
use crate::error::SendError;
use crate::storage::{ChunkId, ChunkQueue, EvictionReport};
use crate::types::Endpoint;

/// Buffered `put` lines are written out once they reach this many bytes.
pub const FLUSH_THRESHOLD: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub endpoints: Vec<Endpoint>,
    /// Bound on connect and on every socket read or write.
    pub timeout: Duration,
    pub max_chunks: usize,
    pub retention: Duration,
    /// Upper bound of the random pause after a failed connect.
    pub backoff: Duration,
}

impl SendOptions {
    pub fn from_config(config: &SenderConfig) -> Self {
        Self {
            endpoints: config.hosts.clone(),
            timeout: config.timeout(),
            max_chunks: config.max_chunks,
            retention: config.retention(),
            backoff: config.backoff(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SendReport {
    pub evicted_by_count: EvictionReport,
    pub evicted_by_age: EvictionReport,
    /// Chunks streamed and removed, in delivery order.
    pub delivered: Vec<ChunkId>,
    /// Chunks that could not be read locally. They stay queued.
    pub unreadable: Vec<ChunkId>,
    /// Chunks still queued when the run ended.
    pub remaining: usize,
    /// The endpoint that completed a full cycle, if any.
    pub endpoint: Option<Endpoint>,
    /// One entry per abandoned candidate.
    pub failures: Vec<SendError>,
}

/// Trim the queue, then push everything committed to the first endpoint that
/// accepts it. Endpoints are tried in random order, each at most once.
pub async fn send<Q: ChunkQueue>(queue: &Q, options: &SendOptions, now: i64) -> SendReport {
    let mut report = SendReport {
        evicted_by_count: queue.evict_by_count(options.max_chunks).await,
        ..SendReport::default()
    };
    let retention = i64::try_from(options.retention.as_secs()).unwrap_or(i64::MAX);
    report.evicted_by_age = queue.evict_by_age(now.saturating_sub(retention)).await;

    let mut pending: VecDeque<ChunkId> = match queue.list_committed().await {
        Ok(ids) => ids.into(),
        Err(e) => {
            warn!(error = %e, "Cannot list queued chunks, nothing sent");
            return report;
        }
    };
    if pending.is_empty() {
        debug!("No chunks queued");
        return report;
    }
    debug!(chunks = pending.len(), endpoints = options.endpoints.len(), "Sending queued chunks");

    let mut candidates = options.endpoints.clone();
    candidates.shuffle(&mut rand::rng());

    for endpoint in candidates {
        match deliver(queue, &endpoint, options.timeout, &mut pending, &mut report).await {
            Ok(()) => {
                info!(endpoint = %endpoint, chunks = report.delivered.len(), "Delivered queued chunks");
                report.endpoint = Some(endpoint);
                break;
            }
            Err(e) => {
                warn!(error = %e, "Delivery attempt failed");
                let refused = matches!(e, SendError::Connect { .. });
                report.failures.push(e);
                if refused {
                    pause(options.backoff).await;
                }
            }
        }
    }

    report.remaining = pending.len() + report.unreadable.len();
    if report.endpoint.is_none() {
        warn!(remaining = report.remaining, "No endpoint accepted the queue, chunks stay cached");
    }
    report
}

/// Write every committed chunk as `put` lines to `out` without consuming the
/// queue. Used by dry runs. Returns the number of lines written.
pub async fn print_pending<Q, W>(queue: &Q, out: &mut W) -> io::Result<usize>
where
    Q: ChunkQueue,
    W: AsyncWrite + Unpin,
{
    let ids = queue.list_committed().await.map_err(io::Error::other)?;
    let mut written = 0;
    for id in ids {
        let lines = match queue.read_lines(id).await {
            Ok(lines) => lines,
            Err(e) => {
                warn!(chunk = %id, error = %e, "Skipping unreadable chunk");
                continue;
            }
        };
        for line in lines {
            out.write_all(format!("put {line}\n").as_bytes()).await?;
            written += 1;
        }
    }
    out.flush().await?;
    Ok(written)
}

/// One full candidate cycle: connect, probe, stream, probe.
///
/// A chunk that cannot be read is a local problem: it is set aside and the
/// connection carries on with the next one.
async fn deliver<Q: ChunkQueue>(
    queue: &Q,
    endpoint: &Endpoint,
    timeout: Duration,
    pending: &mut VecDeque<ChunkId>,
    report: &mut SendReport,
) -> Result<(), SendError> {
    let mut conn = Connection::open(endpoint, timeout).await?;
    conn.probe().await?;

    while let Some(&id) = pending.front() {
        match conn.stream_chunk(queue, id).await {
            Ok(()) => {}
            Err(SendError::Store { source, .. }) if source.is_not_found() => {
                debug!(chunk = %id, "Chunk vanished before sending, skipping");
                pending.pop_front();
                continue;
            }
            Err(SendError::Store { source, .. }) => {
                warn!(chunk = %id, error = %source, "Unreadable chunk left in cache, skipping");
                pending.pop_front();
                report.unreadable.push(id);
                continue;
            }
            Err(e) => return Err(e),
        }
        if let Err(e) = queue.remove(id).await {
            warn!(chunk = %id, error = %e, "Sent chunk could not be removed");
        }
        pending.pop_front();
        report.delivered.push(id);
    }

    conn.probe().await?;
    conn.close().await;
    Ok(())
}

struct Connection<'a> {
    endpoint: &'a Endpoint,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl<'a> Connection<'a> {
    async fn open(endpoint: &'a Endpoint, timeout: Duration) -> Result<Connection<'a>, SendError> {
        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
        let stream = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(SendError::Connect {
                    endpoint: endpoint.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(SendError::Connect {
                    endpoint: endpoint.clone(),
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };
        debug!(endpoint = %endpoint, "Connected");

        let (reader, writer) = stream.into_split();
        Ok(Self {
            endpoint,
            reader: BufReader::new(reader),
            writer,
            timeout,
        })
    }

    /// Ask for the version and wait for one line back.
    async fn probe(&mut self) -> Result<(), SendError> {
        debug!(endpoint = %self.endpoint, "Verifying TSD is alive");
        self.write(b"version\n").await.map_err(|e| self.protocol(e.to_string()))?;

        let mut line = Vec::new();
        match tokio::time::timeout(self.timeout, self.reader.read_until(b'\n', &mut line)).await {
            Err(_) => Err(self.protocol(format!("no answer within {:?}", self.timeout))),
            Ok(Err(e)) => Err(self.protocol(e.to_string())),
            Ok(Ok(0)) => Err(self.protocol("connection closed".to_string())),
            Ok(Ok(_)) if line.last() != Some(&b'\n') => {
                Err(self.protocol("connection closed mid-line".to_string()))
            }
            Ok(Ok(_)) => {
                debug!(
                    endpoint = %self.endpoint,
                    answer = %String::from_utf8_lossy(&line).trim_end(),
                    "TSD is alive"
                );
                Ok(())
            }
        }
    }

    async fn stream_chunk<Q: ChunkQueue>(&mut self, queue: &Q, id: ChunkId) -> Result<(), SendError> {
        let lines = queue.read_lines(id).await.map_err(|source| SendError::Store {
            endpoint: self.endpoint.clone(),
            source,
        })?;

        let mut buf = Vec::with_capacity(FLUSH_THRESHOLD);
        for line in &lines {
            buf.extend_from_slice(b"put ");
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
            if buf.len() >= FLUSH_THRESHOLD {
                self.write(&buf).await?;
                buf.clear();
            }
        }
        if !buf.is_empty() {
            self.write(&buf).await?;
        }

        debug!(endpoint = %self.endpoint, chunk = %id, lines = lines.len(), "Streamed chunk");
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), SendError> {
        let source = match tokio::time::timeout(self.timeout, self.writer.write_all(bytes)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(_) => io::Error::new(io::ErrorKind::TimedOut, "write timed out"),
        };
        Err(SendError::Io {
            endpoint: self.endpoint.clone(),
            source,
        })
    }

    async fn close(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!(endpoint = %self.endpoint, error = %e, "Error closing connection");
        }
    }

    fn protocol(&self, reason: String) -> SendError {
        SendError::Protocol {
            endpoint: self.endpoint.clone(),
            reason,
        }
    }
}

async fn pause(max: Duration) {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return;
    }
    let wait = rand::rng().random_range(0..=max_ms);
    tokio::time::sleep(Duration::from_millis(wait)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ChunkWriter, DirChunkStore, MemoryChunkStore};
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    const NOW: i64 = 1_700_000_000;

    struct FakeTsd {
        endpoint: Endpoint,
        lines: JoinHandle<Vec<String>>,
    }

    /// Accepts one connection and records every line it receives. Answers
    /// `version` with `ok` unless `mute`.
    async fn fake_tsd(mute: bool) -> FakeTsd {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let lines = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (rd, mut wr) = socket.into_split();
            let mut incoming = BufReader::new(rd).lines();
            let mut received = Vec::new();
            while let Ok(Some(line)) = incoming.next_line().await {
                if line == "version" && !mute {
                    let _ = wr.write_all(b"ok\n").await;
                }
                received.push(line);
            }
            received
        });
        FakeTsd {
            endpoint: Endpoint::new("127.0.0.1", port),
            lines,
        }
    }

    async fn refusing_endpoint() -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        Endpoint::new("127.0.0.1", port)
    }

    fn options(endpoints: Vec<Endpoint>) -> SendOptions {
        SendOptions {
            endpoints,
            timeout: Duration::from_millis(500),
            max_chunks: 100,
            retention: Duration::from_secs(3600),
            backoff: Duration::ZERO,
        }
    }

    async fn cache_with(chunks: &[(String, &str)]) -> (TempDir, DirChunkStore) {
        let dir = TempDir::new().unwrap();
        for (name, content) in chunks {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        let store = DirChunkStore::open(dir.path(), NOW).await.unwrap();
        (dir, store)
    }

    fn is_empty(dir: &TempDir) -> bool {
        std::fs::read_dir(dir.path()).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn streams_chunks_in_order_then_empties_cache() {
        let (dir, store) = cache_with(&[
            (format!("{NOW}-9"), "b.metric 1 7 host=x\n"),
            (format!("{NOW}-1"), "a.metric 1 42 host=x\n"),
        ])
        .await;
        let tsd = fake_tsd(false).await;

        let report = send(&store, &options(vec![tsd.endpoint.clone()]), NOW).await;

        assert_eq!(report.endpoint, Some(tsd.endpoint.clone()));
        assert_eq!(report.delivered, vec![ChunkId::new(NOW, 1), ChunkId::new(NOW, 9)]);
        assert_eq!(report.remaining, 0);
        assert_eq!(
            tsd.lines.await.unwrap(),
            vec![
                "version",
                "put a.metric 1 42 host=x",
                "put b.metric 1 7 host=x",
                "version",
            ]
        );
        assert!(is_empty(&dir));
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_hold_up_the_queue() {
        let (dir, store) = cache_with(&[(format!("{NOW}-2"), "good 1 1\n")]).await;
        std::fs::write(dir.path().join(format!("{NOW}-1")), b"bad \xff 1 1\n").unwrap();
        let tsd = fake_tsd(false).await;

        let report = send(&store, &options(vec![tsd.endpoint.clone()]), NOW).await;

        assert_eq!(report.endpoint, Some(tsd.endpoint.clone()));
        assert_eq!(report.delivered, vec![ChunkId::new(NOW, 1), ChunkId::new(NOW, 2)]);
        assert_eq!(
            tsd.lines.await.unwrap(),
            vec!["version", "put bad \u{FFFD} 1 1", "put good 1 1", "version"]
        );
        assert!(is_empty(&dir));
    }

    #[tokio::test]
    async fn unreadable_chunk_is_skipped_without_dropping_endpoint() {
        let (dir, store) = cache_with(&[(format!("{NOW}-2"), "good 1 1\n")]).await;
        std::fs::create_dir(dir.path().join(format!("{NOW}-1"))).unwrap();
        let tsd = fake_tsd(false).await;

        let report = send(&store, &options(vec![tsd.endpoint.clone()]), NOW).await;

        assert_eq!(report.endpoint, Some(tsd.endpoint.clone()));
        assert!(report.failures.is_empty());
        assert_eq!(report.unreadable, vec![ChunkId::new(NOW, 1)]);
        assert_eq!(report.delivered, vec![ChunkId::new(NOW, 2)]);
        assert_eq!(report.remaining, 1);
        assert_eq!(tsd.lines.await.unwrap(), vec!["version", "put good 1 1", "version"]);
        assert!(dir.path().join(format!("{NOW}-1")).is_dir());
    }

    #[tokio::test]
    async fn fails_over_past_refusing_endpoint() {
        let (dir, store) = cache_with(&[(format!("{NOW}-1"), "a 1 1\n")]).await;
        let refusing = refusing_endpoint().await;
        let tsd = fake_tsd(false).await;

        let report = send(&store, &options(vec![refusing.clone(), tsd.endpoint.clone()]), NOW).await;

        assert_eq!(report.endpoint, Some(tsd.endpoint.clone()));
        assert!(report.failures.len() <= 1);
        for failure in &report.failures {
            assert!(matches!(failure, SendError::Connect { endpoint, .. } if *endpoint == refusing));
        }
        assert_eq!(tsd.lines.await.unwrap(), vec!["version", "put a 1 1", "version"]);
        assert!(is_empty(&dir));
    }

    #[tokio::test]
    async fn mute_endpoint_keeps_chunks_queued() {
        let (_dir, store) = cache_with(&[(format!("{NOW}-1"), "a 1 1\n")]).await;
        let tsd = fake_tsd(true).await;

        let report = send(&store, &options(vec![tsd.endpoint.clone()]), NOW).await;

        assert!(report.endpoint.is_none());
        assert_eq!(report.remaining, 1);
        assert!(matches!(report.failures[..], [SendError::Protocol { .. }]));
        assert_eq!(tsd.lines.await.unwrap(), vec!["version"]);
        assert_eq!(store.list_committed().await.unwrap(), vec![ChunkId::new(NOW, 1)]);
    }

    #[tokio::test]
    async fn all_endpoints_down_is_not_fatal() {
        let (_dir, store) = cache_with(&[(format!("{NOW}-1"), "a 1 1\n")]).await;
        let endpoints = vec![refusing_endpoint().await, refusing_endpoint().await];

        let report = send(&store, &options(endpoints), NOW).await;

        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.remaining, 1);
        assert!(report.delivered.is_empty());
    }

    #[tokio::test]
    async fn empty_queue_opens_no_connection() {
        let (_dir, store) = cache_with(&[]).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());

        let report = send(&store, &options(vec![endpoint]), NOW).await;

        assert!(report.failures.is_empty());
        assert!(report.endpoint.is_none());
        let accepted = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err(), "sender connected with nothing to send");
    }

    #[tokio::test]
    async fn evicts_stale_and_excess_before_sending() {
        let retention = 3600;
        let stale = NOW - retention - 1;
        let (dir, store) = cache_with(&[
            (format!("{stale}-1"), "stale 1 1\n"),
            (format!("{}-1", NOW - 30), "oldest.fresh 1 1\n"),
            (format!("{}-1", NOW - 20), "middle 1 1\n"),
            (format!("{}-1", NOW - 10), "newest 1 1\n"),
        ])
        .await;
        let tsd = fake_tsd(false).await;
        let mut opts = options(vec![tsd.endpoint.clone()]);
        opts.max_chunks = 2;

        let report = send(&store, &opts, NOW).await;

        assert_eq!(report.evicted_by_count.removed.len(), 2);
        assert!(report.evicted_by_age.removed.is_empty());
        assert_eq!(
            tsd.lines.await.unwrap(),
            vec!["version", "put middle 1 1", "put newest 1 1", "version"]
        );
        assert!(is_empty(&dir));
    }

    #[tokio::test]
    async fn age_eviction_drops_expired_chunks() {
        let store = MemoryChunkStore::new(NOW - 7200);
        let mut writer = store.create_writer().await.unwrap();
        writer.append_line("old 1 1").await.unwrap();
        store.commit(writer).await.unwrap();

        let report = send(&store, &options(vec![refusing_endpoint().await]), NOW).await;

        assert_eq!(report.evicted_by_age.removed.len(), 1);
        assert!(report.failures.is_empty(), "nothing left, so no connection is attempted");
    }

    #[tokio::test]
    async fn large_chunks_arrive_complete() {
        let body: String = (0..3000).map(|i| format!("load.metric {i} {i} host=x\n")).collect();
        let (dir, store) = cache_with(&[(format!("{NOW}-1"), body.as_str())]).await;
        let tsd = fake_tsd(false).await;

        let report = send(&store, &options(vec![tsd.endpoint.clone()]), NOW).await;

        assert_eq!(report.delivered.len(), 1);
        let lines = tsd.lines.await.unwrap();
        assert_eq!(lines.len(), 3002);
        assert_eq!(lines[1], "put load.metric 0 0 host=x");
        assert_eq!(lines[3000], "put load.metric 2999 2999 host=x");
        assert!(is_empty(&dir));
    }

    #[tokio::test]
    async fn print_pending_leaves_queue_intact() {
        let (_dir, store) = cache_with(&[
            (format!("{NOW}-2"), "b 1 1\n"),
            (format!("{NOW}-1"), "a 1 1\n\n"),
        ])
        .await;
        let mut out = Vec::new();

        let written = print_pending(&store, &mut out).await.unwrap();

        assert_eq!(written, 2);
        assert_eq!(String::from_utf8(out).unwrap(), "put a 1 1\nput b 1 1\n");
        assert_eq!(store.list_committed().await.unwrap().len(), 2);
    }
}
