//! Lifecycle state and status snapshots.
//!
//! [`StatusReporter`] borrows the manager's components and composes a
//! [`StatusSnapshot`]. It performs no I/O and caches nothing, so it is safe
//! in every [`ManagerState`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bridges::BridgeRegistry;
use crate::circuits::{CircuitInfo, CircuitTracker};
use crate::config::{Config, Endpoint};
use crate::controller::ExitNodeInfo;
use crate::isolation::{IsolationContext, IsolationManager, IsolationMode};

/// Lifecycle state of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerState {
    /// No Tor process.
    #[default]
    Stopped,
    /// Launching and authenticating.
    Starting,
    /// Process alive and control connection authenticated.
    Running,
    /// Shutting down.
    Stopping,
    /// Failed; see `last_error`.
    Error,
}

impl ManagerState {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerState::Stopped => "stopped",
            ManagerState::Starting => "starting",
            ManagerState::Running => "running",
            ManagerState::Stopping => "stopping",
            ManagerState::Error => "error",
        }
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proxy settings for an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyConfig {
    /// SOCKS host.
    pub host: String,
    /// SOCKS port.
    pub port: u16,
    /// Always `socks5`.
    #[serde(rename = "type")]
    pub proxy_type: &'static str,
}

impl ProxyConfig {
    /// Proxy settings for `endpoint`.
    pub fn socks5(endpoint: &Endpoint) -> Self {
        Self {
            host: endpoint.host.clone(),
            port: endpoint.port,
            proxy_type: "socks5",
        }
    }

    /// `socks5://host:port`.
    pub fn uri(&self) -> String {
        format!(
            "{}://{}",
            self.proxy_type,
            Endpoint::new(self.host.clone(), self.port)
        )
    }
}

/// Exit-node policy in effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitPolicy {
    /// Allowed exit countries; empty means any.
    pub exit_countries: Vec<String>,
    /// Excluded exit countries.
    pub exclude_exit_countries: Vec<String>,
    /// Whether Tor must honor the lists strictly.
    pub strict_nodes: bool,
}

/// Lifecycle facts owned by the manager.
#[derive(Debug, Clone, Default)]
pub struct LifecycleView {
    /// Stored state.
    pub state: ManagerState,
    /// Set when the error state will not recover automatically.
    pub fatal: bool,
    /// Whether the child process is alive.
    pub process_alive: bool,
    /// Whether the control connection is authenticated.
    pub control_authenticated: bool,
    /// Child pid.
    pub pid: Option<u32>,
    /// When the current child was spawned.
    pub started_at: Option<DateTime<Utc>>,
    /// Automatic restarts since the last `start`.
    pub restart_count: u32,
    /// Tor version reported over the control port.
    pub tor_version: Option<String>,
    /// Most recent error message.
    pub last_error: Option<String>,
    /// Bootstrap percentage.
    pub bootstrap_progress: u8,
    /// Details of the current exit relay, once looked up.
    pub exit_node: Option<ExitNodeInfo>,
}

/// A point-in-time view of the manager.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// Effective state.
    pub state: ManagerState,
    /// True if the error state is pinned.
    pub fatal: bool,
    /// Whether the Tor process is alive.
    pub process_running: bool,
    /// Whether the control connection is authenticated.
    pub control_connected: bool,
    /// Child pid.
    pub pid: Option<u32>,
    /// Base SOCKS endpoint.
    pub socks: Endpoint,
    /// Control endpoint.
    pub control: Endpoint,
    /// Proxy settings for the base endpoint.
    pub proxy: ProxyConfig,
    /// `socks5://host:port` for the base endpoint.
    pub proxy_uri: String,
    /// Exit policy.
    pub exit_policy: ExitPolicy,
    /// Number of configured bridges.
    pub bridge_count: usize,
    /// Isolation mode.
    pub isolation_mode: IsolationMode,
    /// Live isolation contexts.
    pub isolation_contexts: Vec<IsolationContext>,
    /// Known circuits.
    pub circuits: Vec<CircuitInfo>,
    /// Number of built circuits.
    pub built_circuits: usize,
    /// Exit fingerprint of the newest general circuit.
    pub current_exit: Option<String>,
    /// Details of the current exit, when known.
    pub exit_node: Option<ExitNodeInfo>,
    /// Bootstrap percentage.
    pub bootstrap_progress: u8,
    /// Bytes read by Tor.
    pub bytes_read: u64,
    /// Bytes written by Tor.
    pub bytes_written: u64,
    /// Seconds since the current child was spawned.
    pub uptime_secs: Option<u64>,
    /// Automatic restarts since the last start.
    pub restart_count: u32,
    /// Tor version.
    pub tor_version: Option<String>,
    /// Most recent error message.
    pub last_error: Option<String>,
}

/// The state reported to callers.
///
/// A stored `running` state is only reported while the process is alive and
/// the control connection authenticated; otherwise it reads as `error`.
pub fn effective_state(view: &LifecycleView) -> ManagerState {
    if view.state == ManagerState::Running && !(view.process_alive && view.control_authenticated)
    {
        ManagerState::Error
    } else {
        view.state
    }
}

/// Composes snapshots from borrowed components.
#[derive(Debug, Clone, Copy)]
pub struct StatusReporter<'a> {
    /// Manager lifecycle facts.
    pub lifecycle: &'a LifecycleView,
    /// Active configuration.
    pub config: &'a Config,
    /// Bridge registry.
    pub bridges: &'a BridgeRegistry,
    /// Isolation bookkeeping.
    pub isolation: &'a IsolationManager,
    /// Circuit table.
    pub circuits: &'a CircuitTracker,
}

impl StatusReporter<'_> {
    /// Builds a snapshot as of `now`.
    pub fn snapshot(&self, now: DateTime<Utc>) -> StatusSnapshot {
        let view = self.lifecycle;
        let socks = self.config.socks_endpoint();
        let proxy = ProxyConfig::socks5(&socks);
        let traffic = self.circuits.traffic();
        let current_exit = self.circuits.current_exit().map(str::to_string);
        let running = view.process_alive && view.state != ManagerState::Stopped;

        StatusSnapshot {
            state: effective_state(view),
            fatal: view.fatal,
            process_running: view.process_alive,
            control_connected: view.control_authenticated,
            pid: view.pid.filter(|_| running),
            proxy_uri: proxy.uri(),
            proxy,
            socks,
            control: self.config.control_endpoint(),
            exit_policy: ExitPolicy {
                exit_countries: self.config.exit_countries.clone(),
                exclude_exit_countries: self.config.exclude_exit_countries.clone(),
                strict_nodes: self.config.strict_nodes,
            },
            bridge_count: self.bridges.len(),
            isolation_mode: self.isolation.mode(),
            isolation_contexts: self.isolation.contexts(),
            circuits: self.circuits.circuits(),
            built_circuits: self.circuits.built_count(),
            exit_node: view
                .exit_node
                .clone()
                .filter(|n| current_exit.as_deref() == Some(n.fingerprint.as_str())),
            current_exit,
            bootstrap_progress: view.bootstrap_progress,
            bytes_read: traffic.bytes_read,
            bytes_written: traffic.bytes_written,
            uptime_secs: view
                .started_at
                .filter(|_| running)
                .map(|t| (now - t).num_seconds().max(0) as u64),
            restart_count: view.restart_count,
            tor_version: view.tor_version.clone(),
            last_error: view.last_error.clone(),
        }
    }
}
