pub mod runner;

use std::collections::BTreeSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{CheckError, StoreError};
use crate::storage::ChunkId;

pub use runner::run_checks;

/// An executable found in the checks directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckProgram {
    pub name: String,
    pub path: PathBuf,
}

/// What happened to one check during a run.
#[derive(Debug)]
pub enum CheckOutcome {
    /// The check exited in time. `chunk` is `None` when it printed nothing
    /// worth keeping.
    Completed {
        chunk: Option<ChunkId>,
        lines: usize,
        exit_code: Option<i32>,
    },
    TimedOut { after: Duration },
    FailedToSpawn(CheckError),
    /// Waiting on the process failed.
    Lost(CheckError),
    /// Output could not be stored; the partial chunk was discarded.
    WriteFailed(StoreError),
}

#[derive(Debug)]
pub struct CheckReport {
    pub program: CheckProgram,
    pub outcome: CheckOutcome,
}

/// Per-check results of one run, in spawn order.
#[derive(Debug, Default)]
pub struct CheckRunSummary {
    /// Files in the checks directory that could not be made runnable.
    pub skipped: Vec<CheckError>,
    pub reports: Vec<CheckReport>,
}

impl CheckRunSummary {
    pub fn committed(&self) -> Vec<ChunkId> {
        self.reports
            .iter()
            .filter_map(|r| match r.outcome {
                CheckOutcome::Completed { chunk, .. } => chunk,
                _ => None,
            })
            .collect()
    }

    pub fn timed_out(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, CheckOutcome::TimedOut { .. }))
            .count()
    }

    /// Checks that neither completed nor timed out.
    pub fn failed(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| {
                !matches!(
                    r.outcome,
                    CheckOutcome::Completed { .. } | CheckOutcome::TimedOut { .. }
                )
            })
            .count()
    }
}

#[derive(Debug, Default)]
pub struct Discovery {
    pub programs: Vec<CheckProgram>,
    pub skipped: Vec<CheckError>,
}

/// Find runnable checks: regular files in `checks_dir`, optionally limited to
/// `restrict_to`, ordered by name. Files missing the owner execute bit get it
/// added; files where that fails are skipped.
pub async fn discover(checks_dir: &Path, restrict_to: Option<&BTreeSet<String>>) -> Discovery {
    let mut discovery = Discovery::default();

    let mut entries = match tokio::fs::read_dir(checks_dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %checks_dir.display(), error = %e, "Cannot read checks directory");
            return discovery;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(dir = %checks_dir.display(), error = %e, "Error while listing checks");
                break;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if restrict_to.is_some_and(|wanted| !wanted.contains(&name)) {
            continue;
        }

        let path = entry.path();
        match ensure_runnable(&path).await {
            Ok(true) => discovery.programs.push(CheckProgram { name, path }),
            Ok(false) => debug!(entry = %path.display(), "Not a regular file, skipping"),
            Err(e) => {
                warn!(error = %e, "Skipping check");
                discovery.skipped.push(e);
            }
        }
    }

    discovery.programs.sort_by(|a, b| a.name.cmp(&b.name));

    if let Some(wanted) = restrict_to {
        for name in wanted {
            if !discovery.programs.iter().any(|p| &p.name == name) {
                warn!(check = %name, "Requested check not found");
            }
        }
    }
    info!(
        dir = %checks_dir.display(),
        count = discovery.programs.len(),
        "Discovered checks"
    );
    discovery
}

/// `Ok(false)` for anything that is not a regular file.
async fn ensure_runnable(path: &Path) -> Result<bool, CheckError> {
    let discovery_err = |reason: String| CheckError::Discovery {
        path: path.to_path_buf(),
        reason,
    };

    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| discovery_err(e.to_string()))?;
    if !meta.is_file() {
        return Ok(false);
    }

    let mut perms = meta.permissions();
    if perms.mode() & 0o100 == 0 {
        perms.set_mode(perms.mode() | 0o100);
        tokio::fs::set_permissions(path, perms)
            .await
            .map_err(|e| discovery_err(format!("cannot make executable: {e}")))?;
        info!(check = %path.display(), "Added missing execute permission");
    }
    Ok(true)
}
