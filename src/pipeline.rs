use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tracing::{debug, info};

use crate::checks::{run_checks, CheckRunSummary};
use crate::config::Config;
use crate::sender::{print_pending, send, SendOptions, SendReport};
use crate::storage::{ChunkQueue, DirChunkStore, EvictionReport, MemoryChunkStore};
use crate::tagger::TagSet;
use crate::types::RunContext;

/// Which phases an invocation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Full,
    CheckOnly,
    SendOnly,
}

impl RunMode {
    pub fn runs_checks(self) -> bool {
        self != RunMode::SendOnly
    }

    pub fn sends(self) -> bool {
        self != RunMode::CheckOnly
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub mode: RunMode,
    /// Leave the cache and the network alone and print `put` lines instead.
    pub dry_run: bool,
    /// Run only checks with these file names.
    pub restrict_to: Option<BTreeSet<String>>,
}

#[derive(Debug, Default)]
pub struct PipelineSummary {
    pub swept: Option<EvictionReport>,
    pub checks: Option<CheckRunSummary>,
    pub delivery: Option<SendReport>,
    /// Lines printed by a dry run.
    pub printed: Option<usize>,
}

impl PipelineSummary {
    pub fn log(&self) {
        let (committed, timed_out, failed) = self
            .checks
            .as_ref()
            .map(|c| (c.committed().len(), c.timed_out(), c.failed()))
            .unwrap_or_default();
        let (delivered, remaining, endpoint) = self
            .delivery
            .as_ref()
            .map(|d| {
                let endpoint = d.endpoint.as_ref().map(ToString::to_string);
                (d.delivered.len(), d.remaining, endpoint)
            })
            .unwrap_or_default();

        info!(
            committed,
            timed_out,
            failed,
            delivered,
            remaining,
            endpoint = endpoint.as_deref().unwrap_or("-"),
            printed = self.printed.unwrap_or_default(),
            "Run complete"
        );
    }
}

/// One invocation: sweep leftovers, run the checks, ship the queue.
///
/// Only a cache directory that cannot be opened is an error. Everything that
/// goes wrong per check or per endpoint ends up in the summary instead.
pub async fn run(config: &Config, ctx: &RunContext, options: &RunOptions) -> Result<PipelineSummary> {
    let tags = TagSet::resolve(config, ctx);
    if options.dry_run {
        return dry_run(config, ctx, options, &tags).await;
    }

    let cache_dir = &config.agent.cache_dir;
    let store = DirChunkStore::open(cache_dir, ctx.timestamp())
        .await
        .with_context(|| format!("Cannot open cache directory {}", cache_dir.display()))?;

    let mut summary = PipelineSummary::default();
    if config.agent.sweep_orphans {
        let cutoff = ctx.timestamp().saturating_sub(retention_secs(config));
        summary.swept = Some(store.sweep_orphans(cutoff).await);
    }

    if options.mode.runs_checks() {
        summary.checks = Some(collect(config, options, &tags, &store).await);
    }

    if options.mode.sends() {
        jitter(config.sender.send_jitter_secs).await;
        let send_options = SendOptions::from_config(&config.sender);
        summary.delivery = Some(send(&store, &send_options, ctx.timestamp()).await);
    } else {
        debug!("Send prohibited");
    }

    Ok(summary)
}

async fn dry_run(
    config: &Config,
    ctx: &RunContext,
    options: &RunOptions,
    tags: &TagSet,
) -> Result<PipelineSummary> {
    let mut summary = PipelineSummary::default();
    let mut out = tokio::io::stdout();

    if options.mode.runs_checks() {
        let store = MemoryChunkStore::new(ctx.timestamp());
        summary.checks = Some(collect(config, options, tags, &store).await);
        summary.printed = Some(print_pending(&store, &mut out).await?);
    } else if config.agent.cache_dir.is_dir() {
        let store = DirChunkStore::open(&config.agent.cache_dir, ctx.timestamp()).await?;
        summary.printed = Some(print_pending(&store, &mut out).await?);
    } else {
        debug!(cache = %config.agent.cache_dir.display(), "No cache directory, nothing to print");
        summary.printed = Some(0);
    }

    Ok(summary)
}

async fn collect<Q: ChunkQueue>(
    config: &Config,
    options: &RunOptions,
    tags: &TagSet,
    queue: &Q,
) -> CheckRunSummary {
    run_checks(
        &config.checks.dir,
        &config.checks.config_dir,
        config.checks.timeout(),
        options.restrict_to.as_ref(),
        tags,
        queue,
    )
    .await
}

fn retention_secs(config: &Config) -> i64 {
    i64::try_from(config.sender.retention_secs).unwrap_or(i64::MAX)
}

/// Spread sends from many hosts running on the same schedule.
async fn jitter(max_secs: u64) {
    if max_secs == 0 {
        return;
    }
    let wait = rand::rng().random_range(0..=jitter_bound_ms(max_secs));
    debug!(wait_ms = wait, "Delaying send");
    tokio::time::sleep(Duration::from_millis(wait)).await;
}

fn jitter_bound_ms(max_secs: u64) -> u64 {
    max_secs.saturating_mul(1000)
}
