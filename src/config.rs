use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(name = "oj-runner", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Sandbox runner to use, overriding the configuration file
    #[arg(long = "runner", value_enum)]
    pub runner: Option<RunnerKind>,

    /// Do not pull container images at startup
    #[arg(long = "skip-pull", default_value_t = false)]
    pub skip_pull: bool,
}

impl CliArgs {
    /// Load the configuration from the specified file, or fall back to defaults
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(runner) = self.runner {
            config.execution.runner = runner;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub execution: ExecutionConfig,
    pub limits: LimitsConfig,
    pub max_limits: MaxLimitsConfig,
    pub docker: DockerConfig,
    pub languages: Vec<LanguageConfig>,
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open configuration file {path}"))?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse configuration file {path}"))
    }

    /// Rejects settings that would make every execution fail
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.execution.max_concurrent_executions == 0 {
            bail!("max_concurrent_executions must not be 0");
        }
        if self.limits.time_limit.0 == 0 {
            bail!("default time_limit must not be 0");
        }
        if self.limits.time_limit > self.max_limits.time_limit {
            bail!("default time_limit exceeds max_limits.time_limit");
        }
        if self.limits.memory_limit > self.max_limits.memory_limit {
            bail!("default memory_limit exceeds max_limits.memory_limit");
        }
        if !(self.limits.cpus > 0.0) {
            bail!("cpus must be positive");
        }
        let prefix = &self.docker.container_prefix;
        if !prefix.starts_with(|c: char| c.is_ascii_alphanumeric())
            || !prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            bail!("docker.container_prefix {prefix:?} is not a valid container name");
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ExecutionConfig {
    pub runner: RunnerKind,
    pub workspace_root: Option<PathBuf>,
    pub max_concurrent_executions: usize,
    pub admission_timeout: MicroSecond,
    pub max_source_size: ByteSize,
    pub max_input_size: ByteSize,
    pub max_output_size: ByteSize,
    pub max_diagnostics_size: ByteSize,
    pub stale_workspace_age: MicroSecond,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            runner: RunnerKind::Auto,
            workspace_root: None,
            max_concurrent_executions: 4,
            admission_timeout: MicroSecond::from_secs(30),
            max_source_size: ByteSize::kib(64),
            max_input_size: ByteSize::mib(1),
            max_output_size: ByteSize::mib(1),
            max_diagnostics_size: ByteSize::kib(64),
            stale_workspace_age: MicroSecond::from_secs(3600),
        }
    }
}

/// Ceilings applied to every execution unless the request overrides them
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    pub time_limit: MicroSecond,
    pub memory_limit: ByteSize,
    pub cpus: f64,
    pub pids_limit: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            time_limit: MicroSecond::from_secs(10),
            memory_limit: ByteSize::mib(256),
            cpus: 1.0,
            pids_limit: 64,
        }
    }
}

/// Upper bounds for per-request overrides
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MaxLimitsConfig {
    pub time_limit: MicroSecond,
    pub memory_limit: ByteSize,
}

impl Default for MaxLimitsConfig {
    fn default() -> Self {
        Self {
            time_limit: MicroSecond::from_secs(30),
            memory_limit: ByteSize::gib(1),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DockerConfig {
    pub binary: String,
    /// `uid:gid` for the sandboxed process; defaults to the server's own
    /// identity, or `nobody` when the server runs as root
    pub run_as_user: Option<String>,
    /// Extra time the docker client gets on top of the time limit before it
    /// is killed; the limit itself is judged from the container's own clock
    pub launch_overhead: MicroSecond,
    pub tmpfs_size: ByteSize,
    /// Container names are `<prefix>-<random>`
    pub container_prefix: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            run_as_user: None,
            launch_overhead: MicroSecond::from_secs(2),
            tmpfs_size: ByteSize::mib(64),
            container_prefix: "oj-run".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct LanguageConfig {
    pub name: String,
    pub extension: String,
    pub image: String,
    pub command: String,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    Docker,
    Simple,
    #[default]
    Auto,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MicroSecond(pub u64);

impl MicroSecond {
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1_000_000)
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_micros(self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const fn kib(n: u64) -> Self {
        Self(n * 1024)
    }

    pub const fn mib(n: u64) -> Self {
        Self(n * 1024 * 1024)
    }

    pub const fn gib(n: u64) -> Self {
        Self(n * 1024 * 1024 * 1024)
    }

    /// Saturating conversion for in-memory buffer sizes
    pub fn as_usize(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}
