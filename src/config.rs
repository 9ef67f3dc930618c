//! Configuration for the host and the workers it launches.
//!
//! Sources, highest priority first: `UIA_BRIDGE_*` environment overrides,
//! then a JSON file given with `--config` (or inline JSON in
//! `UIA_BRIDGE_CONFIG`), then built-in defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::transport::WorkerCommand;

/// Inline JSON configuration, used when no file is given.
pub const CONFIG_ENV: &str = "UIA_BRIDGE_CONFIG";
pub const TIMEOUT_ENV: &str = "UIA_BRIDGE_TIMEOUT";
pub const POOL_SIZE_ENV: &str = "UIA_BRIDGE_POOL_SIZE";
pub const FIXTURE_ENV: &str = "UIA_BRIDGE_FIXTURE";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub supervisor: SupervisorConfig,
    pub worker: WorkerConfig,
    pub defaults: RequestDefaults,
}

/// Worker pool and lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Number of worker slots. One slot serializes every request.
    pub pool_size: usize,

    /// Deadline for requests that pass a timeout of 0.
    pub default_timeout_seconds: u64,

    /// How long a fresh worker gets to answer its first `Ping`.
    pub ready_timeout_seconds: u64,

    /// Idle workers are stopped after this long; 0 keeps them forever.
    pub idle_timeout_seconds: u64,

    /// Grace period for a clean worker exit before the tree is killed.
    pub shutdown_grace_ms: u64,

    pub restart: RestartPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            default_timeout_seconds: default_timeout(),
            ready_timeout_seconds: 10,
            idle_timeout_seconds: 300,
            shutdown_grace_ms: 2000,
            restart: RestartPolicy::default(),
        }
    }
}

impl SupervisorConfig {
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }

    pub const fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_seconds)
    }

    pub const fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_seconds))
        }
    }

    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// When a killed or crashed worker is replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// On the next request that needs the slot.
    #[default]
    OnDemand,
    /// In the background, right after the old worker is gone.
    Immediate,
}

/// How worker processes are started.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable. Defaults to this binary in `--worker` mode.
    pub program: Option<PathBuf>,

    /// Arguments for a custom `program`.
    pub args: Vec<String>,

    /// Desktop fixture for the in-memory backend.
    pub fixture: Option<PathBuf>,

    /// Log filter passed to self-launched workers.
    pub log_level: Option<String>,

    /// Extra environment for the worker process.
    pub env: BTreeMap<String, String>,
}

/// Values filled into typed requests when the caller leaves them out.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RequestDefaults {
    pub max_results: usize,
    pub wait_timeout_seconds: u64,
    pub scroll_amount: f64,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            max_results: 100,
            wait_timeout_seconds: 10,
            scroll_amount: 1.0,
        }
    }
}

const fn default_timeout() -> u64 {
    30
}

impl Config {
    /// Load from `path`, or `UIA_BRIDGE_CONFIG`, or defaults, then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match std::env::var(CONFIG_ENV) {
                Ok(json) if !json.trim().is_empty() => {
                    Self::from_json(&json).with_context(|| format!("Failed to parse {CONFIG_ENV}"))?
                }
                _ => {
                    debug!("No configuration given, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_json(&json)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Apply `UIA_BRIDGE_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(TIMEOUT_ENV) {
            self.supervisor.default_timeout_seconds = raw
                .trim()
                .parse()
                .with_context(|| {
                    format!("{TIMEOUT_ENV} must be a whole number of seconds, got '{raw}'")
                })?;
        }
        if let Some(raw) = lookup(POOL_SIZE_ENV) {
            self.supervisor.pool_size = raw
                .trim()
                .parse()
                .with_context(|| {
                    format!("{POOL_SIZE_ENV} must be a positive integer, got '{raw}'")
                })?;
        }
        if let Some(path) = lookup(FIXTURE_ENV).filter(|p| !p.is_empty()) {
            self.worker.fixture = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.supervisor.pool_size == 0 {
            bail!("supervisor.pool_size must be at least 1");
        }
        if self.supervisor.default_timeout_seconds == 0 {
            bail!("supervisor.default_timeout_seconds must be at least 1");
        }
        if self.supervisor.ready_timeout_seconds == 0 {
            bail!("supervisor.ready_timeout_seconds must be at least 1");
        }
        Ok(())
    }

    /// Command that starts one worker.
    ///
    /// Without a configured program this binary is relaunched in `--worker`
    /// mode, inheriting the fixture and log level.
    pub fn worker_command(&self, log_level: &str) -> Result<WorkerCommand> {
        let mut command = match &self.worker.program {
            Some(program) => self
                .worker
                .args
                .iter()
                .fold(WorkerCommand::new(program), |cmd, arg| cmd.arg(arg)),
            None => {
                let exe = std::env::current_exe().context("Failed to locate current executable")?;
                let level = self.worker.log_level.as_deref().unwrap_or(log_level);
                let mut cmd = WorkerCommand::new(exe).arg("--worker").arg("--log-level").arg(level);
                if let Some(fixture) = &self.worker.fixture {
                    cmd = cmd.arg("--fixture").arg(fixture);
                }
                cmd
            }
        };
        for (key, value) in &self.worker.env {
            command = command.env(key, value);
        }
        Ok(command.shutdown_grace(self.supervisor.shutdown_grace()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.supervisor.pool_size, 1);
        assert_eq!(config.supervisor.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.supervisor.restart, RestartPolicy::OnDemand);
        assert_eq!(config.defaults.max_results, 100);
        assert!(config.worker.program.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = Config::from_json(
            r#"{
                "supervisor": {"pool_size": 3, "restart": "immediate", "idle_timeout_seconds": 0},
                "defaults": {"scroll_amount": 2.5}
            }"#,
        )
        .unwrap();
        assert_eq!(config.supervisor.pool_size, 3);
        assert_eq!(config.supervisor.restart, RestartPolicy::Immediate);
        assert_eq!(config.supervisor.idle_timeout(), None);
        assert_eq!(config.supervisor.ready_timeout_seconds, 10);
        assert_eq!(config.defaults.scroll_amount, 2.5);
        assert_eq!(config.defaults.wait_timeout_seconds, 10);
    }

    #[test]
    fn unknown_restart_policy_rejected() {
        assert!(Config::from_json(r#"{"supervisor": {"restart": "sometimes"}}"#).is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        std::fs::write(&path, r#"{"worker": {"fixture": "/tmp/desktop.json"}}"#).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.worker.fixture, Some(PathBuf::from("/tmp/desktop.json")));
    }

    #[test]
    fn missing_file_has_context() {
        let err = Config::from_file(Path::new("/nonexistent/bridge.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn env_overrides_win() {
        let mut config =
            Config::from_json(r#"{"supervisor": {"default_timeout_seconds": 5}}"#).unwrap();
        config
            .apply_overrides(lookup(&[
                (TIMEOUT_ENV, "12"),
                (POOL_SIZE_ENV, " 4 "),
                (FIXTURE_ENV, "/fixtures/app.json"),
            ]))
            .unwrap();
        assert_eq!(config.supervisor.default_timeout_seconds, 12);
        assert_eq!(config.supervisor.pool_size, 4);
        assert_eq!(config.worker.fixture, Some(PathBuf::from("/fixtures/app.json")));
    }

    #[test]
    fn bad_override_is_an_error() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(lookup(&[(TIMEOUT_ENV, "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains(TIMEOUT_ENV));
    }

    #[test]
    fn zero_pool_is_invalid() {
        let mut config = Config::default();
        config.supervisor.pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn self_launch_command() {
        let mut config = Config::default();
        config.worker.fixture = Some(PathBuf::from("desk.json"));
        config.worker.env.insert("RUST_BACKTRACE".into(), "1".into());
        let command = config.worker_command("debug").unwrap();
        let args: Vec<_> = command.args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, ["--worker", "--log-level", "debug", "--fixture", "desk.json"]);
        assert_eq!(command.env, [("RUST_BACKTRACE".to_string(), "1".to_string())]);
        assert_eq!(command.shutdown_grace, Duration::from_secs(2));
    }

    #[test]
    fn custom_program_uses_its_own_args() {
        let config = Config::from_json(
            r#"{"worker": {"program": "/opt/uia/worker", "args": ["--serve"]}}"#,
        )
        .unwrap();
        let command = config.worker_command("info").unwrap();
        assert_eq!(command.program, PathBuf::from("/opt/uia/worker"));
        assert_eq!(command.args, vec![std::ffi::OsString::from("--serve")]);
    }
}
