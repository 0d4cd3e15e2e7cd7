use std::collections::BTreeSet;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use tsd_check_agent::config::Config;
use tsd_check_agent::logging;
use tsd_check_agent::pipeline::{self, RunMode, RunOptions};
use tsd_check_agent::types::RunContext;

#[derive(Parser, Debug)]
#[command(
    name = "tsd-check-agent",
    about = "Run metric checks and ship their output to TSD",
    disable_version_flag = true
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/tsd-check-agent/agent.toml")]
    config: String,

    /// Only run these checks (comma separated file names)
    #[arg(short = 'l', long = "run-checks", value_delimiter = ',')]
    run_checks: Vec<String>,

    /// Print collected datapoints instead of caching and sending them
    #[arg(short, long)]
    dry_run: bool,

    /// Run checks but do not send
    #[arg(short = 'o', long, conflicts_with = "send_only")]
    check_only: bool,

    /// Send cached chunks without running checks
    #[arg(short = 't', long)]
    send_only: bool,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    /// Log to the local syslog socket instead of stderr
    #[arg(short, long)]
    syslog: bool,

    /// Validate config and exit
    #[arg(long)]
    check: bool,

    /// Print version and exit
    #[arg(short = 'V', long)]
    version: bool,
}

impl Cli {
    fn run_options(&self) -> RunOptions {
        let mode = if self.check_only {
            RunMode::CheckOnly
        } else if self.send_only {
            RunMode::SendOnly
        } else {
            RunMode::Full
        };
        let restrict_to = (!self.run_checks.is_empty())
            .then(|| self.run_checks.iter().cloned().collect::<BTreeSet<_>>());
        RunOptions {
            mode,
            dry_run: self.dry_run,
            restrict_to,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("tsd-check-agent {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load(&cli.config)?;

    if cli.check {
        println!("Configuration is valid.");
        return Ok(());
    }

    logging::init(&config.agent.log_level, cli.verbose, cli.syslog);

    let ctx = RunContext::capture(config.agent.hostname.clone());
    let options = cli.run_options();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        hostname = %ctx.hostname,
        mode = ?options.mode,
        dry_run = options.dry_run,
        "Starting tsd-check-agent"
    );

    match pipeline::run(&config, &ctx, &options).await {
        Ok(summary) => {
            summary.log();
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Agent terminated with error");
            Err(e)
        }
    }
}
