//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command line** — `--private-key`, `--debug`, `--console`,
//!    `--strict-host-key-checking` and the legacy positional words
//! 2. **Environment variables** — `REACH_CONTROL_URL`, `REACH_PORTS_ID`,
//!    `REACH_HOST_UUID`, `REACH_USER_ID`, `REACH_DB_SERVER_KEY`,
//!    `REACH_TUNNEL_USERNAME`, `REACH_PRIVATE_KEY`
//! 3. **Config file** — path via `--config <path>`, or `reach-agent.toml` in CWD
//! 4. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [control]
//! url = "https://p.sshreach.me/<token>"
//! ports_id = "9720"
//! host_uuid = "0b8a38f2-e579-45d9-a681-e65ff193afb6"
//! user_id = "15652"
//! db_server_key = "secret"
//! request_timeout_secs = 4
//!
//! [tunnel]
//! username = "oteV9TlktNk72NvRFj1gGqWujyXwGK"
//! forward_port = 3232                      # local port the tunnel lands on
//! address = "localhost"                    # host the forward points at
//! private_key = "~/.ssh/reach_rsa"
//! strict_host_key_checking = false
//!
//! [agent]
//! poll_interval_secs = 5
//! inspector = "auto"                       # auto | signal | scan
//!
//! [logging]
//! level = "warn"
//! file = "reach-agent.log"                 # daily rotation, 5 files kept
//! console = false
//! ```

use serde::Deserialize;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tunnel::liveness::InspectorKind;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Control endpoint location and this host's identifiers on it.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Base URL, without the endpoint script name.
    #[serde(default)]
    pub url: String,
    /// Poll endpoint, relative to `url` (default `get_port3.php`).
    #[serde(default = "default_poll_path")]
    pub poll_path: String,
    /// Error report endpoint, relative to `url` (default `set_error.php`).
    #[serde(default = "default_error_path")]
    pub error_path: String,
    #[serde(default)]
    pub ports_id: String,
    /// Sent as `key`.
    #[serde(default)]
    pub host_uuid: String,
    /// Sent as `uid`.
    #[serde(default)]
    pub user_id: String,
    /// Sent as `dbid`.
    #[serde(default)]
    pub db_server_key: String,
    /// Sent as `ver`; the endpoint may tailor replies to it (default `350`).
    #[serde(default = "default_client_version")]
    pub client_version: String,
    /// Per-request timeout in seconds (default 4).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Which tunnel client is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    /// OpenSSH `ssh`.
    OpenSsh,
    /// PuTTY `plink`, which has no host-key options.
    Plink,
}

impl Default for ClientKind {
    fn default() -> Self {
        if cfg!(windows) {
            Self::Plink
        } else {
            Self::OpenSsh
        }
    }
}

/// Fixed half of the tunnel identity; the endpoint supplies the other half.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub client: ClientKind,
    /// Client executable (default `ssh`, `plink.exe` on Windows).
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Remote account on the forwarding server.
    #[serde(default)]
    pub username: String,
    /// Local port the reverse forward lands on (default 3232).
    #[serde(default = "default_forward_port")]
    pub forward_port: u16,
    /// Host the forward points at; change only when the service is on
    /// another machine (default `localhost`).
    #[serde(default = "default_address")]
    pub address: String,
    /// Private key file (default `id_rsa` in CWD).
    #[serde(default = "default_private_key")]
    pub private_key: PathBuf,
    /// Verify the forwarding server's host key. With this on, the first
    /// connection needs a manually accepted key (default false).
    #[serde(default)]
    pub strict_host_key_checking: bool,
    /// Seconds to let a new client connect before checking on it (default 3).
    #[serde(default = "default_launch_grace")]
    pub launch_grace_secs: u64,
}

/// Reconciliation loop timing and recovery policy.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Seconds between polls (default 5).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Extra seconds on top of the poll interval before a gap between
    /// iterations counts as a suspend (default 40).
    #[serde(default = "default_wake_margin")]
    pub wake_margin_secs: u64,
    /// Failed launches before the endpoint is told (default 5).
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// Consecutive unreachable polls before a self-restart (default 3).
    #[serde(default = "default_unreachable_restart_threshold")]
    pub unreachable_restart_threshold: u32,
    /// Seconds without a good poll before a self-restart (default 3 hours).
    #[serde(default = "default_max_silence")]
    pub max_silence_secs: u64,
    #[serde(default)]
    pub inspector: InspectorKind,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `warn`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file; relative paths sit next to the executable. Empty disables it.
    #[serde(default = "default_log_file")]
    pub file: String,
    /// Daily log files kept (default 5).
    #[serde(default = "default_log_files_kept")]
    pub files_kept: usize,
    /// Echo logs to stderr (default false).
    #[serde(default)]
    pub console: bool,
}

/// Supervisor settings for `reach-agent supervise`.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Maximum seconds between restart attempts (default 60).
    #[serde(default = "default_supervisor_max_backoff")]
    pub max_backoff: u64,
    /// Seconds of uptime before resetting backoff (default 60).
    #[serde(default = "default_supervisor_stable_threshold")]
    pub stable_threshold: u64,
}

fn default_poll_path() -> String {
    "get_port3.php".to_string()
}
fn default_error_path() -> String {
    "set_error.php".to_string()
}
fn default_client_version() -> String {
    "350".to_string()
}
fn default_request_timeout() -> u64 {
    4
}
fn default_executable() -> String {
    if cfg!(windows) {
        "plink.exe".to_string()
    } else {
        "ssh".to_string()
    }
}
fn default_forward_port() -> u16 {
    3232
}
fn default_address() -> String {
    "localhost".to_string()
}
fn default_private_key() -> PathBuf {
    PathBuf::from("id_rsa")
}
fn default_launch_grace() -> u64 {
    3
}
fn default_poll_interval() -> u64 {
    5
}
fn default_wake_margin() -> u64 {
    40
}
fn default_retry_budget() -> u32 {
    5
}
fn default_unreachable_restart_threshold() -> u32 {
    3
}
fn default_max_silence() -> u64 {
    3 * 60 * 60
}
fn default_log_level() -> String {
    "warn".to_string()
}
fn default_log_file() -> String {
    "reach-agent.log".to_string()
}
fn default_log_files_kept() -> usize {
    5
}
fn default_supervisor_max_backoff() -> u64 {
    60
}
fn default_supervisor_stable_threshold() -> u64 {
    60
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            poll_path: default_poll_path(),
            error_path: default_error_path(),
            ports_id: String::new(),
            host_uuid: String::new(),
            user_id: String::new(),
            db_server_key: String::new(),
            client_version: default_client_version(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            client: ClientKind::default(),
            executable: default_executable(),
            username: String::new(),
            forward_port: default_forward_port(),
            address: default_address(),
            private_key: default_private_key(),
            strict_host_key_checking: false,
            launch_grace_secs: default_launch_grace(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            wake_margin_secs: default_wake_margin(),
            retry_budget: default_retry_budget(),
            unreachable_restart_threshold: default_unreachable_restart_threshold(),
            max_silence_secs: default_max_silence(),
            inspector: InspectorKind::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
            files_kept: default_log_files_kept(),
            console: false,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_backoff: default_supervisor_max_backoff(),
            stable_threshold: default_supervisor_stable_threshold(),
        }
    }
}

impl AgentConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Gap between iterations beyond which the host is assumed to have slept.
    pub fn wake_threshold(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs + self.wake_margin_secs)
    }

    pub fn max_silence(&self) -> Duration {
        Duration::from_secs(self.max_silence_secs)
    }
}

/// Settings taken from the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub private_key: Option<PathBuf>,
    pub debug: bool,
    pub console: bool,
    pub strict_host_key_checking: bool,
}

impl Overrides {
    /// Fold in the positional words older deployments pass
    /// (`reach-agent /root/.ssh/key debug console stricthostkeychecking`).
    /// Any word that is not a switch is the private key path.
    pub fn with_legacy_words<S: AsRef<str>>(mut self, words: &[S]) -> Self {
        for word in words {
            match word.as_ref() {
                "debug" => self.debug = true,
                "console" => self.console = true,
                "stricthostkeychecking" => self.strict_host_key_checking = true,
                path => self.private_key = Some(PathBuf::from(path)),
            }
        }
        self
    }
}

/// Why the configuration could not be loaded.
#[derive(Debug)]
pub enum ConfigError {
    Read { path: String, source: std::io::Error },
    Parse { path: String, source: toml::de::Error },
    Missing(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config file {path}: {source}")
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config file {path}: {source}")
            }
            ConfigError::Missing(field) => write!(f, "missing required setting `{field}`"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `reach-agent.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("reach-agent.toml").exists() => Self::from_file("reach-agent.toml")?,
            None => Config::default(),
        };

        if let Ok(v) = std::env::var("REACH_CONTROL_URL") {
            config.control.url = v;
        }
        if let Ok(v) = std::env::var("REACH_PORTS_ID") {
            config.control.ports_id = v;
        }
        if let Ok(v) = std::env::var("REACH_HOST_UUID") {
            config.control.host_uuid = v;
        }
        if let Ok(v) = std::env::var("REACH_USER_ID") {
            config.control.user_id = v;
        }
        if let Ok(v) = std::env::var("REACH_DB_SERVER_KEY") {
            config.control.db_server_key = v;
        }
        if let Ok(v) = std::env::var("REACH_TUNNEL_USERNAME") {
            config.tunnel.username = v;
        }
        if let Ok(v) = std::env::var("REACH_PRIVATE_KEY") {
            config.tunnel.private_key = PathBuf::from(v);
        }

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply command-line settings, expand `~` in the key path, and check that
    /// the deployment identifiers are present.
    pub fn finish(mut self, overrides: &Overrides) -> Result<Self, ConfigError> {
        if let Some(key) = &overrides.private_key {
            self.tunnel.private_key.clone_from(key);
        }
        if overrides.debug {
            self.logging.level = "debug".to_string();
        }
        if overrides.console {
            self.logging.console = true;
        }
        if overrides.strict_host_key_checking {
            self.tunnel.strict_host_key_checking = true;
        }
        let expanded = expand_tilde(&self.tunnel.private_key.to_string_lossy()).into_owned();
        self.tunnel.private_key = PathBuf::from(expanded);

        if self.control.url.is_empty() {
            return Err(ConfigError::Missing("control.url"));
        }
        if self.control.ports_id.is_empty() {
            return Err(ConfigError::Missing("control.ports_id"));
        }
        if self.tunnel.username.is_empty() {
            return Err(ConfigError::Missing("tunnel.username"));
        }
        Ok(self)
    }
}

/// Expand a leading `~` to `$HOME`.
fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Cow::Owned(format!("{home}{}", &path[1..]));
        }
    }
    Cow::Borrowed(path)
}
