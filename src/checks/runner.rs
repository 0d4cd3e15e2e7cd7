use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::{discover, CheckOutcome, CheckProgram, CheckReport, CheckRunSummary};
use crate::error::{CheckError, StoreError};
use crate::storage::{ChunkId, ChunkQueue, ChunkWriter};
use crate::tagger::{self, TagSet};

type Running = JoinHandle<Result<Output, CheckError>>;

/// Run every discovered check and turn each one's output into a chunk.
///
/// All checks are started before any is harvested, so they execute in
/// parallel. Each gets its own deadline, armed when it is spawned; a check
/// still running at its deadline is killed and leaves nothing behind.
/// Harvesting walks the checks in spawn order. No single check can fail the
/// run; the summary records what happened to each.
pub async fn run_checks<Q: ChunkQueue>(
    checks_dir: &Path,
    config_dir: &Path,
    timeout: Duration,
    restrict_to: Option<&BTreeSet<String>>,
    tags: &TagSet,
    queue: &Q,
) -> CheckRunSummary {
    let discovery = discover(checks_dir, restrict_to).await;
    let suffix = tagger::render(tags);

    let running: Vec<(CheckProgram, Result<Running, CheckError>)> = discovery
        .programs
        .into_iter()
        .map(|program| {
            let spawned = spawn_check(&program, config_dir, timeout);
            (program, spawned)
        })
        .collect();

    let mut summary = CheckRunSummary {
        skipped: discovery.skipped,
        reports: Vec::with_capacity(running.len()),
    };

    for (program, spawned) in running {
        let outcome = match spawned {
            Ok(handle) => harvest(&program, handle, &suffix, queue).await,
            Err(e) => {
                warn!(check = %program.name, error = %e, "Unable to run check");
                CheckOutcome::FailedToSpawn(e)
            }
        };
        summary.reports.push(CheckReport { program, outcome });
    }

    info!(
        checks = summary.reports.len(),
        committed = summary.committed().len(),
        timed_out = summary.timed_out(),
        failed = summary.failed(),
        "Check run finished"
    );
    summary
}

fn spawn_check(program: &CheckProgram, config_dir: &Path, timeout: Duration) -> Result<Running, CheckError> {
    let child = Command::new(&program.path)
        .arg(config_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CheckError::Spawn {
            path: program.path.clone(),
            source,
        })?;
    debug!(check = %program.name, pid = ?child.id(), "Spawned check");

    let deadline = deadline_after(Instant::now(), timeout);
    let path = program.path.clone();
    Ok(tokio::spawn(async move {
        // On expiry the child is dropped, and kill_on_drop sends SIGKILL.
        match timeout_at(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(CheckError::Wait { path, source }),
            Err(_) => Err(CheckError::Timeout { path, after: timeout }),
        }
    }))
}

/// Checks allowed to run longer than this are treated as never timing out.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start + timeout.min(FAR_FUTURE)
}

async fn harvest<Q: ChunkQueue>(
    program: &CheckProgram,
    handle: Running,
    suffix: &str,
    queue: &Q,
) -> CheckOutcome {
    let output = match handle.await {
        Ok(Ok(output)) => output,
        Ok(Err(CheckError::Timeout { after, .. })) => {
            warn!(check = %program.name, timeout = ?after, "Check killed, deadline exceeded");
            return CheckOutcome::TimedOut { after };
        }
        Ok(Err(e)) => {
            warn!(check = %program.name, error = %e, "Check lost");
            return CheckOutcome::Lost(e);
        }
        Err(e) => {
            warn!(check = %program.name, error = %e, "Check supervisor task failed");
            return CheckOutcome::Lost(CheckError::Wait {
                path: program.path.clone(),
                source: io::Error::other(e),
            });
        }
    };

    let exit_code = output.status.code();
    if !output.status.success() {
        debug!(check = %program.name, status = %output.status, "Check exited unsuccessfully, keeping its output");
    }

    let lines = tagged_lines(&output.stdout, suffix);
    match store_lines(queue, &lines).await {
        Ok(chunk) => {
            debug!(check = %program.name, lines = lines.len(), chunk = ?chunk.map(|c| c.to_string()), "Stored check output");
            CheckOutcome::Completed {
                chunk,
                lines: lines.len(),
                exit_code,
            }
        }
        Err(e) => {
            warn!(check = %program.name, error = %e, "Failed to store check output");
            CheckOutcome::WriteFailed(e)
        }
    }
}

/// Strip trailing whitespace, drop blank lines, append the tag suffix.
pub fn tagged_lines(stdout: &[u8], suffix: &str) -> Vec<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(|line| format!("{line}{suffix}"))
        .collect()
}

async fn store_lines<Q: ChunkQueue>(queue: &Q, lines: &[String]) -> Result<Option<ChunkId>, StoreError> {
    let mut writer = queue.create_writer().await?;
    for line in lines {
        if let Err(e) = writer.append_line(line).await {
            queue.abort(writer).await;
            return Err(e);
        }
    }
    queue.commit(writer).await
}
