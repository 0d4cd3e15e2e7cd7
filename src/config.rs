use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use crate::types::Endpoint;

/// Names every configuration file can interpolate without declaring them.
pub const BUILTIN_DEFAULTS: [&str; 2] = ["hostname", "basedir"];

/// Top-level configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub checks: ChecksConfig,
    #[serde(default)]
    pub sender: SenderConfig,
    /// Interpolation-only values; never emitted as tags.
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Directory of the running executable, the value of `${basedir}`.
    #[serde(skip)]
    pub basedir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_true")]
    pub sweep_orphans: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            log_level: default_log_level(),
            cache_dir: default_cache_dir(),
            sweep_orphans: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChecksConfig {
    #[serde(default = "default_checks_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_checks_config_dir")]
    pub config_dir: PathBuf,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            dir: default_checks_dir(),
            config_dir: default_checks_config_dir(),
            timeout_secs: default_timeout(),
        }
    }
}

impl ChecksConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SenderConfig {
    #[serde(default)]
    pub hosts: Vec<Endpoint>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    #[serde(default = "default_jitter")]
    pub send_jitter_secs: u64,
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            hosts: vec![],
            timeout_secs: default_timeout(),
            retention_secs: default_retention(),
            max_chunks: default_max_chunks(),
            send_jitter_secs: default_jitter(),
            backoff_ms: default_backoff(),
        }
    }
}

impl SenderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::parse(&content, &default_basedir())
    }

    /// Parse a configuration document and expand `${name}` references in the
    /// path settings. `basedir` backs the builtin `${basedir}` variable.
    pub fn parse(content: &str, basedir: &Path) -> Result<Self> {
        let mut config: Config = toml::from_str(content)
            .with_context(|| "Failed to parse configuration")?;

        config.basedir = basedir.to_path_buf();
        let lookup = |name: &str| config.lookup(name, &config.agent.hostname);
        let cache_dir = expand_path(&config.agent.cache_dir, lookup);
        let checks_dir = expand_path(&config.checks.dir, lookup);
        let checks_config_dir = expand_path(&config.checks.config_dir, lookup);

        config.agent.cache_dir = cache_dir;
        config.checks.dir = checks_dir;
        config.checks.config_dir = checks_config_dir;

        if config.sender.max_chunks == 0 {
            anyhow::bail!("sender.max_chunks must be at least 1");
        }

        Ok(config)
    }

    /// Resolve an interpolation variable: builtins first, then `[defaults]`,
    /// then the process environment.
    pub fn lookup(&self, name: &str, hostname: &str) -> Option<String> {
        match name {
            "hostname" => Some(hostname.to_string()),
            "basedir" => Some(self.basedir.to_string_lossy().into_owned()),
            _ => self
                .defaults
                .get(name)
                .cloned()
                .or_else(|| std::env::var(name).ok()),
        }
    }

    /// Keys that may be interpolated but must never become tags.
    pub fn is_default_key(&self, key: &str) -> bool {
        BUILTIN_DEFAULTS.contains(&key) || self.defaults.contains_key(key)
    }
}

static VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("variable pattern is valid"));

/// Expand `${name}` references. Unknown names expand to the empty string.
pub fn expand_vars<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    VAR_RE
        .replace_all(input, |caps: &regex::Captures| {
            lookup(&caps[1]).unwrap_or_default()
        })
        .to_string()
}

fn expand_path<F>(path: &Path, lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    PathBuf::from(expand_vars(&path.to_string_lossy(), lookup))
}

// Default value functions
fn default_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
fn default_basedir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.canonicalize().ok())
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}
fn default_log_level() -> String { "info".to_string() }
fn default_cache_dir() -> PathBuf { PathBuf::from("/var/cache/tsd-check-agent") }
fn default_checks_dir() -> PathBuf { PathBuf::from("${basedir}/checks") }
fn default_checks_config_dir() -> PathBuf { PathBuf::from("${basedir}/checks.d") }
fn default_true() -> bool { true }
fn default_timeout() -> u64 { 30 }
fn default_retention() -> u64 { 86_400 }
fn default_max_chunks() -> usize { 10_000 }
fn default_jitter() -> u64 { 5 }
fn default_backoff() -> u64 { 500 }
