//! Configuration management for tor-manager-rs.
//!
//! This module holds the manager's configuration store: the [`Config`] struct
//! with its documented defaults, TOML loading, command-line overrides, and the
//! [`ConfigUpdate`] type used by the caller-facing `configure()` operation.
//!
//! # Configuration Flow
//!
//! ```text
//!     ┌─────────────────┐
//!     │ Config::default │ ◄── 127.0.0.1:9050 / 127.0.0.1:9051, no bridges
//!     └────────┬────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌────────────────────┐
//!     │ Config file     │ ◄───│ tor-manager.toml   │  (TOML, unknown keys rejected)
//!     │ exists?         │     │ or --config        │
//!     └────────┬────────┘     └────────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌────────────────────┐
//!     │ Apply CLI/env   │ ◄───│ --socks-port, ...  │
//!     └────────┬────────┘     └────────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐
//!     │ validate()      │ ◄── ports, countries, bridges, plugins, timeouts
//!     └─────────────────┘
//! ```
//!
//! # Example Configuration File
//!
//! ```toml
//! socks_host = "127.0.0.1"
//! socks_port = 9050
//! control_host = "127.0.0.1"
//! control_port = 9051
//!
//! # Either a pre-hashed password (tor --hash-password) or nothing for cookie auth.
//! # hashed_control_password = "16:..."
//! generate_password = false
//!
//! # tor_path = "/usr/bin/tor"
//! # bundle_dir = "/opt/tor-bundle"
//! data_dir = "tor-data"
//!
//! isolation_mode = "per_domain"
//! exit_countries = ["de", "nl"]
//! strict_nodes = false
//!
//! bridges = []
//! loglevel = "notice"
//!
//! [transport_plugins]
//! obfs4 = "/opt/tor-bundle/pluggable_transports/lyrebird"
//! ```
//!
//! # Security
//!
//! The plaintext control password is never written back out: it is skipped
//! by serialization and redacted from `Debug` output. Only the hashed form
//! (`16:...`) is persisted.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::bridges::{BridgeRegistry, Transport};
use crate::error::{Error, Result};
use crate::isolation::IsolationMode;

/// Log level for tor-manager-rs output.
///
/// From most to least verbose: [`Debug`](LogLevel::Debug) >
/// [`Info`](LogLevel::Info) > [`Notice`](LogLevel::Notice) >
/// [`Warn`](LogLevel::Warn) > [`Error`](LogLevel::Error).
///
/// # Example
///
/// ```rust
/// use tor_manager::LogLevel;
///
/// let level: LogLevel = "warning".parse().unwrap();
/// assert_eq!(level, LogLevel::Warn);
/// assert!(LogLevel::Notice < level);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Low-level debugging information, including Tor's own output.
    Debug,
    /// Informational messages about normal operation.
    Info,
    /// Notable events that may be of interest.
    #[default]
    Notice,
    /// Warning conditions that don't prevent operation.
    Warn,
    /// Error conditions that may impair functionality.
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Notice => write!(f, "NOTICE"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "NOTICE" => Ok(LogLevel::Notice),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" | "ERR" => Ok(LogLevel::Error),
            _ => Err(Error::Config(format!("invalid log level: {}", s))),
        }
    }
}

/// A TCP endpoint: host plus port.
///
/// # Example
///
/// ```rust
/// use tor_manager::Endpoint;
///
/// let ep = Endpoint::new("127.0.0.1", 9050);
/// assert_eq!(ep.to_string(), "127.0.0.1:9050");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Main configuration for tor-manager-rs.
///
/// # Fields
///
/// | Field | Default | Description |
/// |-------|---------|-------------|
/// | `socks_host` / `socks_port` | `127.0.0.1` / `9050` | Base SOCKS listener |
/// | `control_host` / `control_port` | `127.0.0.1` / `9051` | Control port |
/// | `control_password` | none | Plaintext, never serialized |
/// | `hashed_control_password` | none | `16:` hash; cookie auth if absent |
/// | `generate_password` | `false` | Create a random password per start |
/// | `tor_path` | none | Explicit executable |
/// | `bundle_dir` | none | Provisioned Tor distribution |
/// | `geoip_dir` | none | Directory holding `geoip`/`geoip6` |
/// | `data_dir` | `tor-data` | Tor `DataDirectory` and torrc location |
/// | `isolation_mode` | `none` | Stream isolation policy |
/// | `max_isolation_contexts` | 64 | Live isolated listeners cap |
/// | `isolation_grace_secs` | 30 | Delay before a released port is reused |
/// | `exit_countries` | `[]` | `ExitNodes` allow-list |
/// | `exclude_exit_countries` | `[]` | `ExcludeExitNodes` list |
/// | `strict_nodes` | `false` | `StrictNodes` |
/// | `bridges` | `[]` | Bridge lines |
/// | `transport_plugins` | `{}` | transport name → plugin executable |
/// | `start_timeout_secs` | 10 | Wait for the control port |
/// | `stop_timeout_secs` | 5 | Graceful shutdown window |
/// | `command_timeout_secs` | 10 | Per-command reply wait |
/// | `max_restarts` | 3 | Automatic restarts after a crash |
/// | `restart_backoff_ms` | 500 | Base of the exponential backoff |
/// | `max_reconnects` | 3 | Control reconnect attempts |
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Host the base SOCKS listener binds to.
    #[serde(default = "default_host")]
    pub socks_host: String,
    /// Port of the base SOCKS listener.
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    /// Host the control port binds to.
    #[serde(default = "default_host")]
    pub control_host: String,
    /// Control port number.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Plaintext control password, held in memory only.
    #[serde(default, skip_serializing)]
    pub control_password: Option<String>,
    /// Pre-hashed control password as produced by `tor --hash-password`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashed_control_password: Option<String>,
    /// Generate a random control password when none is configured.
    #[serde(default)]
    pub generate_password: bool,
    /// Explicit path to the Tor executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tor_path: Option<PathBuf>,
    /// Directory of a provisioned Tor distribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_dir: Option<PathBuf>,
    /// Directory containing `geoip` and `geoip6`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geoip_dir: Option<PathBuf>,
    /// Tor data directory; the rendered torrc is written here.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Stream isolation policy.
    #[serde(default)]
    pub isolation_mode: IsolationMode,
    /// Maximum number of live isolation contexts.
    #[serde(default = "default_max_isolation_contexts")]
    pub max_isolation_contexts: usize,
    /// Seconds before a released isolation port may be handed out again.
    #[serde(default = "default_isolation_grace_secs")]
    pub isolation_grace_secs: u64,
    /// Country codes exits must be in.
    #[serde(default)]
    pub exit_countries: Vec<String>,
    /// Country codes exits must not be in.
    #[serde(default)]
    pub exclude_exit_countries: Vec<String>,
    /// Whether Tor must honour the exit lists even if no circuit can be built.
    #[serde(default)]
    pub strict_nodes: bool,
    /// Bridge lines; bridges are used whenever this is non-empty.
    #[serde(default)]
    pub bridges: Vec<String>,
    /// Seconds to wait for the control port after spawning Tor.
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
    /// Seconds to wait for a graceful exit before killing Tor.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Seconds to wait for a control-port reply.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Automatic restarts after an unexpected exit.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Base restart backoff in milliseconds, doubled per attempt.
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
    /// Reconnect attempts after the control connection drops.
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,
    /// Log verbosity.
    #[serde(default)]
    pub loglevel: LogLevel,
    /// Log destination: a file path or `:syslog:`. Stdout when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logfile: Option<String>,
    /// Pluggable transport executables keyed by transport name.
    #[serde(default)]
    pub transport_plugins: BTreeMap<String, PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_socks_port() -> u16 {
    9050
}
fn default_control_port() -> u16 {
    9051
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("tor-data")
}
fn default_max_isolation_contexts() -> usize {
    64
}
fn default_isolation_grace_secs() -> u64 {
    30
}
fn default_start_timeout_secs() -> u64 {
    10
}
fn default_stop_timeout_secs() -> u64 {
    5
}
fn default_command_timeout_secs() -> u64 {
    10
}
fn default_max_restarts() -> u32 {
    3
}
fn default_restart_backoff_ms() -> u64 {
    500
}
fn default_max_reconnects() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socks_host: default_host(),
            socks_port: default_socks_port(),
            control_host: default_host(),
            control_port: default_control_port(),
            control_password: None,
            hashed_control_password: None,
            generate_password: false,
            tor_path: None,
            bundle_dir: None,
            geoip_dir: None,
            data_dir: default_data_dir(),
            isolation_mode: IsolationMode::default(),
            max_isolation_contexts: default_max_isolation_contexts(),
            isolation_grace_secs: default_isolation_grace_secs(),
            exit_countries: Vec::new(),
            exclude_exit_countries: Vec::new(),
            strict_nodes: false,
            bridges: Vec::new(),
            start_timeout_secs: default_start_timeout_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            max_restarts: default_max_restarts(),
            restart_backoff_ms: default_restart_backoff_ms(),
            max_reconnects: default_max_reconnects(),
            loglevel: LogLevel::default(),
            logfile: None,
            transport_plugins: BTreeMap::new(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("socks", &self.socks_endpoint())
            .field("control", &self.control_endpoint())
            .field(
                "control_password",
                &self.control_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("hashed_control_password", &self.hashed_control_password)
            .field("tor_path", &self.tor_path)
            .field("bundle_dir", &self.bundle_dir)
            .field("data_dir", &self.data_dir)
            .field("isolation_mode", &self.isolation_mode)
            .field("exit_countries", &self.exit_countries)
            .field("exclude_exit_countries", &self.exclude_exit_countries)
            .field("bridges", &self.bridges.len())
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read.
    /// Returns [`Error::Config`] if the TOML is invalid or has unknown keys.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Serialize configuration to a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// The base SOCKS endpoint.
    pub fn socks_endpoint(&self) -> Endpoint {
        Endpoint::new(self.socks_host.clone(), self.socks_port)
    }

    /// The control endpoint.
    pub fn control_endpoint(&self) -> Endpoint {
        Endpoint::new(self.control_host.clone(), self.control_port)
    }

    /// Start timeout as a [`Duration`].
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    /// Stop timeout as a [`Duration`].
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Command timeout as a [`Duration`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Isolation port grace period as a [`Duration`].
    pub fn isolation_grace(&self) -> Duration {
        Duration::from_secs(self.isolation_grace_secs)
    }

    /// Backoff before the given restart attempt (1-based).
    pub fn restart_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.restart_backoff_ms.saturating_mul(factor))
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        for (name, host) in [("socks_host", &self.socks_host), ("control_host", &self.control_host)]
        {
            if host.parse::<IpAddr>().is_err() {
                return Err(Error::Config(format!(
                    "{} must be an IP address, got {:?}",
                    name, host
                )));
            }
        }
        if self.socks_port == 0 || self.control_port == 0 {
            return Err(Error::Config("ports must be non-zero".to_string()));
        }
        if self.socks_port == self.control_port {
            return Err(Error::Config(
                "socks_port and control_port must differ".to_string(),
            ));
        }
        if self.socks_port == u16::MAX {
            return Err(Error::Config(
                "socks_port leaves no room for isolation listeners".to_string(),
            ));
        }
        if let Some(ref hash) = self.hashed_control_password {
            if !is_hashed_password(hash) {
                return Err(Error::Config(
                    "hashed_control_password must look like 16:<58 hex chars>".to_string(),
                ));
            }
        }
        for code in self
            .exit_countries
            .iter()
            .chain(self.exclude_exit_countries.iter())
        {
            if !is_valid_country_code(code) {
                return Err(Error::Config(format!("invalid country code: {}", code)));
            }
        }
        if self.max_isolation_contexts == 0 {
            return Err(Error::Config(
                "max_isolation_contexts must be positive".to_string(),
            ));
        }
        if self.start_timeout_secs == 0
            || self.stop_timeout_secs == 0
            || self.command_timeout_secs == 0
        {
            return Err(Error::Config("timeouts must be positive".to_string()));
        }
        for name in self.transport_plugins.keys() {
            let transport: Transport = name
                .parse()
                .map_err(|e: Error| Error::Config(e.to_string()))?;
            if transport == Transport::None {
                return Err(Error::Config(
                    "transport_plugins cannot configure the vanilla transport".to_string(),
                ));
            }
        }
        BridgeRegistry::from_lines(&self.bridges).map_err(|e| Error::Config(e.to_string()))?;
        Ok(())
    }

    /// Returns the plugin executable configured for `transport`.
    pub fn plugin_for(&self, transport: Transport) -> Option<&PathBuf> {
        self.transport_plugins
            .iter()
            .find(|(name, _)| {
                name.parse::<Transport>()
                    .map(|t| t == transport)
                    .unwrap_or(false)
            })
            .map(|(_, path)| path)
    }
}

/// Returns true if `s` is a two-letter alphabetic country code.
pub fn is_valid_country_code(s: &str) -> bool {
    s.len() == 2 && s.chars().all(|c| c.is_ascii_alphabetic())
}

/// Returns true if `s` has the `16:<salt+digest>` shape Tor's hasher emits.
pub fn is_hashed_password(s: &str) -> bool {
    s.strip_prefix("16:")
        .is_some_and(|rest| rest.len() == 58 && rest.chars().all(|c| c.is_ascii_hexdigit()))
}

/// A partial configuration change for [`TorManager::configure`].
///
/// Unset fields keep their current value. Unknown keys are rejected when
/// deserializing, and the manager validates the merged result before swapping
/// it in, so an invalid update never partially applies.
///
/// Endpoints are fixed at construction and cannot be changed here.
///
/// [`TorManager::configure`]: crate::manager::TorManager::configure
///
/// # Example
///
/// ```rust
/// use tor_manager::ConfigUpdate;
///
/// let update = ConfigUpdate::from_json(r#"{"exit_countries": ["de"], "strict_nodes": true}"#).unwrap();
/// assert!(update.touches_exit_policy());
/// assert!(ConfigUpdate::from_json(r#"{"socks_port": 1}"#).is_err());
/// ```
#[derive(Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigUpdate {
    /// New plaintext control password.
    pub control_password: Option<String>,
    /// New hashed control password.
    pub hashed_control_password: Option<String>,
    /// Toggle random password generation.
    pub generate_password: Option<bool>,
    /// New explicit executable.
    pub tor_path: Option<PathBuf>,
    /// New bundle directory.
    pub bundle_dir: Option<PathBuf>,
    /// New GeoIP directory.
    pub geoip_dir: Option<PathBuf>,
    /// New data directory.
    pub data_dir: Option<PathBuf>,
    /// New isolation mode.
    pub isolation_mode: Option<IsolationMode>,
    /// Replacement exit allow-list.
    pub exit_countries: Option<Vec<String>>,
    /// Replacement exit deny-list.
    pub exclude_exit_countries: Option<Vec<String>>,
    /// New `StrictNodes` value.
    pub strict_nodes: Option<bool>,
    /// Replacement bridge list.
    pub bridges: Option<Vec<String>>,
    /// Replacement transport plugin table.
    pub transport_plugins: Option<BTreeMap<String, PathBuf>>,
    /// New start timeout.
    pub start_timeout_secs: Option<u64>,
    /// New stop timeout.
    pub stop_timeout_secs: Option<u64>,
    /// New command timeout.
    pub command_timeout_secs: Option<u64>,
    /// New restart budget.
    pub max_restarts: Option<u32>,
    /// New reconnect budget.
    pub max_reconnects: Option<u32>,
}

impl fmt::Debug for ConfigUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigUpdate")
            .field(
                "control_password",
                &self.control_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("isolation_mode", &self.isolation_mode)
            .field("exit_countries", &self.exit_countries)
            .field("exclude_exit_countries", &self.exclude_exit_countries)
            .field("strict_nodes", &self.strict_nodes)
            .field("bridges", &self.bridges.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

impl ConfigUpdate {
    /// Parses an update from a JSON object, rejecting unknown keys.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on malformed JSON or unknown keys.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Returns a copy of `config` with this update applied.
    pub fn merged_into(&self, config: &Config) -> Config {
        let mut next = config.clone();
        if let Some(ref v) = self.control_password {
            next.control_password = Some(v.clone());
            // a new plaintext invalidates any hash computed for the old one
            if self.hashed_control_password.is_none() {
                next.hashed_control_password = None;
            }
        }
        if let Some(ref v) = self.hashed_control_password {
            next.hashed_control_password = Some(v.clone());
        }
        if let Some(v) = self.generate_password {
            next.generate_password = v;
        }
        if let Some(ref v) = self.tor_path {
            next.tor_path = Some(v.clone());
        }
        if let Some(ref v) = self.bundle_dir {
            next.bundle_dir = Some(v.clone());
        }
        if let Some(ref v) = self.geoip_dir {
            next.geoip_dir = Some(v.clone());
        }
        if let Some(ref v) = self.data_dir {
            next.data_dir = v.clone();
        }
        if let Some(v) = self.isolation_mode {
            next.isolation_mode = v;
        }
        if let Some(ref v) = self.exit_countries {
            next.exit_countries = v.iter().map(|c| c.to_ascii_lowercase()).collect();
        }
        if let Some(ref v) = self.exclude_exit_countries {
            next.exclude_exit_countries = v.iter().map(|c| c.to_ascii_lowercase()).collect();
        }
        if let Some(v) = self.strict_nodes {
            next.strict_nodes = v;
        }
        if let Some(ref v) = self.bridges {
            next.bridges = v.clone();
        }
        if let Some(ref v) = self.transport_plugins {
            next.transport_plugins = v.clone();
        }
        if let Some(v) = self.start_timeout_secs {
            next.start_timeout_secs = v;
        }
        if let Some(v) = self.stop_timeout_secs {
            next.stop_timeout_secs = v;
        }
        if let Some(v) = self.command_timeout_secs {
            next.command_timeout_secs = v;
        }
        if let Some(v) = self.max_restarts {
            next.max_restarts = v;
        }
        if let Some(v) = self.max_reconnects {
            next.max_reconnects = v;
        }
        next
    }

    /// Returns true if the update changes the exit-node policy.
    pub fn touches_exit_policy(&self) -> bool {
        self.exit_countries.is_some()
            || self.exclude_exit_countries.is_some()
            || self.strict_nodes.is_some()
    }
}

/// Command-line arguments for the `tor-manager` binary.
///
/// Arguments override configuration file values.
///
/// # Environment Variables
///
/// - `TOR_MANAGER_CONFIG`: configuration file (equivalent to `--config`)
/// - `TOR_MANAGER_TOR_PATH`: Tor executable (equivalent to `--tor-path`)
/// - `TOR_MANAGER_CONTROL_PASSWORD`: control password
#[derive(Parser, Debug)]
#[command(name = "tor-manager")]
#[command(about = "Run and supervise an embedded Tor client")]
#[command(version)]
pub struct CliArgs {
    /// Path to configuration file.
    #[arg(
        long = "config",
        env = "TOR_MANAGER_CONFIG",
        default_value = "tor-manager.toml"
    )]
    pub config_file: PathBuf,

    /// Write default config to file and exit.
    #[arg(long = "generate-config")]
    pub generate_config: Option<PathBuf>,

    /// Hash the given password with the Tor executable, print it and exit.
    #[arg(long = "hash-password")]
    pub hash_password: Option<String>,

    /// Log verbosity (DEBUG, INFO, NOTICE, WARN, ERROR).
    #[arg(long)]
    pub loglevel: Option<String>,

    /// Log to file instead of stdout (use ":syslog:" for syslog).
    #[arg(long)]
    pub logfile: Option<String>,

    /// Path to the Tor executable.
    #[arg(long, env = "TOR_MANAGER_TOR_PATH")]
    pub tor_path: Option<PathBuf>,

    /// Directory of a provisioned Tor distribution.
    #[arg(long)]
    pub bundle_dir: Option<PathBuf>,

    /// Tor data directory.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Base SOCKS port.
    #[arg(long)]
    pub socks_port: Option<u16>,

    /// Control port.
    #[arg(long)]
    pub control_port: Option<u16>,

    /// Control port password (hashed before it reaches the torrc).
    #[arg(long, env = "TOR_MANAGER_CONTROL_PASSWORD", hide_env_values = true)]
    pub control_password: Option<String>,

    /// Isolation mode (none, per_tab, per_domain, custom).
    #[arg(long)]
    pub isolation_mode: Option<String>,

    /// Restrict exits to a country (repeatable).
    #[arg(long = "exit-country")]
    pub exit_countries: Vec<String>,

    /// Add a bridge line (repeatable).
    #[arg(long = "bridge")]
    pub bridges: Vec<String>,

    /// Seconds between status log lines.
    #[arg(long, default_value_t = 30)]
    pub status_interval: u64,

    /// Print one JSON status snapshot after start and exit.
    #[arg(long)]
    pub status_json: bool,
}

impl CliArgs {
    /// Apply CLI arguments to a configuration, overriding values.
    ///
    /// # Errors
    ///
    /// Returns an error if `--loglevel` or `--isolation-mode` is not recognised.
    pub fn apply_to(&self, config: &mut Config) -> Result<()> {
        if let Some(ref loglevel) = self.loglevel {
            config.loglevel = loglevel.parse()?;
        }
        if let Some(ref logfile) = self.logfile {
            config.logfile = Some(logfile.clone());
        }
        if let Some(ref path) = self.tor_path {
            config.tor_path = Some(path.clone());
        }
        if let Some(ref dir) = self.bundle_dir {
            config.bundle_dir = Some(dir.clone());
        }
        if let Some(ref dir) = self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(port) = self.socks_port {
            config.socks_port = port;
        }
        if let Some(port) = self.control_port {
            config.control_port = port;
        }
        if let Some(ref password) = self.control_password {
            config.control_password = Some(password.clone());
        }
        if let Some(ref mode) = self.isolation_mode {
            config.isolation_mode = mode.parse()?;
        }
        if !self.exit_countries.is_empty() {
            config.exit_countries = self
                .exit_countries
                .iter()
                .map(|c| c.to_ascii_lowercase())
                .collect();
        }
        config.bridges.extend(self.bridges.iter().cloned());
        Ok(())
    }
}

/// Load configuration from file and CLI arguments.
///
/// 1. Start with defaults
/// 2. Apply config file if it exists
/// 3. Apply CLI arguments (override)
///
/// # Errors
///
/// Returns [`Error::Config`] if configuration is invalid.
pub fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = Config::default();

    if args.config_file.exists() {
        config = Config::from_file(&args.config_file)?;
    }

    args.apply_to(&mut config)?;
    config.validate()?;

    Ok(config)
}
