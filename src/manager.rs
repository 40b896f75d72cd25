//! The caller-facing Tor manager.
//!
//! [`TorManager`] ties the components together: it renders the torrc,
//! launches Tor through the [`ProcessSupervisor`], authenticates a
//! [`ControlClient`], keeps the circuit table current and recovers from
//! crashes and dropped control connections.
//!
//! # Architecture
//!
//! ```text
//!   caller ──▶ TorManager (Clone, Arc<Inner>)
//!                │
//!                ├── lifecycle: tokio Mutex ── start / stop / restart / isolation changes
//!                │     └── ProcessSupervisor (owns the child via its monitor task)
//!                │
//!                ├── shared: RwLock ── config, bridges, isolation, lifecycle view, control
//!                └── circuits: RwLock ── CircuitTracker
//!
//!   per start:   supervise task ── exit watch + ConnectionClosed ──▶ restart / reconnect
//!   per control: event pump ── broadcast<ControlEvent> ──▶ circuits, bootstrap, exit lookup
//! ```
//!
//! The std locks are never held across `.await`. The pump is the only writer
//! of the circuit table; status queries only take read locks.
//!
//! # Failure Handling
//!
//! | Condition | Reaction |
//! |-----------|----------|
//! | Tor exits | state `error`; restart with exponential backoff, up to `max_restarts` |
//! | Control connection drops | reconnect and re-authenticate, up to `max_reconnects`; then restart Tor |
//! | Restarts exhausted, binary missing, auth rejected | state pinned to `error` (`fatal`) |
//!
//! # Results Instead of Errors
//!
//! Operations return serializable result values ([`OperationResult`],
//! [`EndpointResult`], [`OnionUrlResult`]) carrying a success flag and a
//! message, so an embedding UI can render failures without unwinding.
//!
//! # Example
//!
//! ```rust,no_run
//! use tor_manager::{Config, TorManager};
//!
//! # async fn example() -> tor_manager::Result<()> {
//! let manager = TorManager::new(Config::default())?;
//! let result = manager.start().await;
//! if result.success {
//!     println!("proxy: {}", manager.get_proxy_config().uri());
//!     let tab = manager.get_isolated_endpoint("tab-7").await;
//!     println!("tab 7 uses {:?}", tab.endpoint);
//! }
//! manager.stop().await;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bridges::BridgeRegistry;
use crate::catalog::{self, CountryCode, TransportType};
use crate::circuits::CircuitTracker;
use crate::config::{Config, ConfigUpdate, Endpoint, LogLevel};
use crate::controller::{ControlClient, SecurePassword, Signal};
use crate::error::{Error, Result};
use crate::events::{ControlEvent, EventKind};
use crate::isolation::{IsolationContext, IsolationManager, IsolationMode};
use crate::logger::plog;
use crate::onion;
use crate::process::{self, ExitRecord, ExitWatch, ProcessSupervisor};
use crate::status::{LifecycleView, ManagerState, ProxyConfig, StatusReporter, StatusSnapshot};
use crate::torrc;

/// Events the manager subscribes to.
pub const SUBSCRIBED_EVENTS: [EventKind; 3] =
    [EventKind::Circ, EventKind::Bw, EventKind::StatusClient];

/// Length of generated control passwords.
pub const GENERATED_PASSWORD_LEN: usize = 32;

/// Outcome of a manager operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResult {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Human-readable outcome.
    pub message: String,
    /// Manager state after the operation.
    pub state: ManagerState,
}

impl OperationResult {
    fn ok(message: impl Into<String>, state: ManagerState) -> Self {
        Self {
            success: true,
            message: message.into(),
            state,
        }
    }

    fn fail(message: impl Into<String>, state: ManagerState) -> Self {
        Self {
            success: false,
            message: message.into(),
            state,
        }
    }
}

/// Outcome of [`TorManager::get_isolated_endpoint`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointResult {
    /// Whether an endpoint is available.
    pub success: bool,
    /// Human-readable outcome.
    pub message: String,
    /// The requested key.
    pub key: String,
    /// SOCKS endpoint serving the key.
    pub endpoint: Option<Endpoint>,
    /// `socks5://` URI of the endpoint.
    pub proxy_uri: Option<String>,
    /// Tor session group, 0 for the shared listener.
    pub session_group: Option<u32>,
}

impl EndpointResult {
    fn ok(context: IsolationContext, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            proxy_uri: Some(ProxyConfig::socks5(&context.endpoint).uri()),
            session_group: Some(context.session_group),
            endpoint: Some(context.endpoint),
            key: context.key,
        }
    }

    fn fail(key: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            key: key.to_string(),
            endpoint: None,
            proxy_uri: None,
            session_group: None,
        }
    }
}

/// Outcome of [`TorManager::is_onion_url`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnionUrlResult {
    /// False if the URL could not be parsed.
    pub success: bool,
    /// Error description for unparseable URLs.
    pub message: Option<String>,
    /// Host ends in `.onion`.
    pub is_onion: bool,
    /// Host is a v3 onion address.
    pub is_v3: bool,
}

struct Shared {
    config: Config,
    bridges: BridgeRegistry,
    isolation: IsolationManager,
    view: LifecycleView,
    control: Option<Arc<ControlClient>>,
    exit_watch: Option<ExitWatch>,
    password: Option<SecurePassword>,
    /// Credential the running Tor was configured with.
    launched_password: Option<SecurePassword>,
}

#[derive(Default)]
struct Lifecycle {
    process: ProcessSupervisor,
    generation: u64,
    supervisor: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

struct Inner {
    lifecycle: Mutex<Lifecycle>,
    shared: RwLock<Shared>,
    circuits: RwLock<CircuitTracker>,
}

enum Reconnect {
    Reconnected(broadcast::Receiver<ControlEvent>),
    ProcessGone,
    Abandoned,
}

/// Embedded Tor process and control-port manager.
///
/// Cloning is cheap and every clone controls the same Tor instance. Dropping
/// the last clone kills the Tor process.
#[derive(Clone)]
pub struct TorManager {
    inner: Arc<Inner>,
}

impl Default for TorManager {
    fn default() -> Self {
        Self::from_parts(Config::default(), BridgeRegistry::new())
    }
}

impl std::fmt::Debug for TorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorManager")
            .field("state", &self.inner.read_shared().view.state)
            .finish_non_exhaustive()
    }
}

impl TorManager {
    /// Creates a stopped manager.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` does not validate.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let bridges = BridgeRegistry::from_lines(&config.bridges)?;
        Ok(Self::from_parts(config, bridges))
    }

    fn from_parts(config: Config, bridges: BridgeRegistry) -> Self {
        let isolation = IsolationManager::new(&config);
        Self {
            inner: Arc::new(Inner {
                lifecycle: Mutex::new(Lifecycle::default()),
                shared: RwLock::new(Shared {
                    config,
                    bridges,
                    isolation,
                    view: LifecycleView::default(),
                    control: None,
                    exit_watch: None,
                    password: None,
                    launched_password: None,
                }),
                circuits: RwLock::new(CircuitTracker::new()),
            }),
        }
    }

    /// A copy of the active configuration.
    pub fn config(&self) -> Config {
        self.inner.read_shared().config.clone()
    }

    /// Stored lifecycle state.
    pub fn state(&self) -> ManagerState {
        self.inner.read_shared().view.state
    }

    /// Applies a partial configuration change.
    ///
    /// The merged configuration is validated before anything changes. While
    /// Tor runs, exit-policy changes are pushed with `SETCONF` and followed
    /// by a new identity; other changes apply on the next start.
    pub async fn configure(&self, update: ConfigUpdate) -> OperationResult {
        let _lc = self.inner.lifecycle.lock().await;
        let (merged, control, state) = {
            let shared = self.inner.read_shared();
            (
                update.merged_into(&shared.config),
                shared.control.clone(),
                shared.view.state,
            )
        };

        if let Err(e) = merged.validate() {
            return OperationResult::fail(e.to_string(), state);
        }
        let bridges = match BridgeRegistry::from_lines(&merged.bridges) {
            Ok(b) => b,
            Err(e) => return OperationResult::fail(e.to_string(), state),
        };

        let running = state == ManagerState::Running;
        let mut policy_pushed = None;
        if running && update.touches_exit_policy() {
            if let Some(control) = control {
                if let Err(e) = apply_exit_policy(&control, &merged).await {
                    return OperationResult::fail(
                        format!("cannot apply exit policy: {}", e),
                        state,
                    );
                }
                policy_pushed = Some(control);
            }
        }

        let released = {
            let mut shared = self.inner.write_shared();
            let had_contexts = !shared.isolation.is_empty();
            let mode_changed = shared.isolation.mode() != merged.isolation_mode;
            shared.isolation.apply_mode(merged.isolation_mode);
            shared.bridges = bridges;
            shared.config = merged;
            if policy_pushed.is_some() {
                shared.view.exit_node = None;
            }
            mode_changed && had_contexts
        };

        // Tor already runs the new policy; stale circuits only delay it
        if let Some(control) = policy_pushed {
            if let Err(e) = control.new_identity().await {
                tracing::warn!(error = %e, "exit policy applied but NEWNYM failed");
            }
        }
        if released && running {
            if let Err(e) = self.inner.sync_listeners().await {
                tracing::warn!(error = %e, "cannot close released isolation listeners");
            }
        }

        tracing::debug!(?update, "configuration updated");
        OperationResult::ok("configuration updated", state)
    }

    /// Starts Tor and waits until it is controllable.
    ///
    /// Starting a running manager succeeds without side effects.
    pub async fn start(&self) -> OperationResult {
        let mut lc = self.inner.lifecycle.lock().await;
        let state = self.inner.read_shared().view.state;
        if matches!(state, ManagerState::Running | ManagerState::Starting) && lc.process.is_alive()
        {
            return OperationResult::ok("Tor is already running", state);
        }

        // leftovers of a crashed or pinned run
        if let Err(e) = self.inner.teardown(&mut lc, false).await {
            tracing::debug!(error = %e, "cleanup before start failed");
        }

        {
            let mut shared = self.inner.write_shared();
            shared.view.state = ManagerState::Starting;
            shared.view.fatal = false;
            shared.view.restart_count = 0;
            shared.view.last_error = None;
            shared.password = None;
        }
        plog(LogLevel::Notice, "Starting Tor");

        match self.inner.launch(&mut lc).await {
            Ok((exit, events)) => {
                lc.supervisor = Some(tokio::spawn(supervise(
                    Arc::downgrade(&self.inner),
                    lc.generation,
                    exit,
                    events,
                )));
                let uri = self.get_proxy_config().uri();
                crate::plog_fmt!(LogLevel::Notice, "Tor is running, SOCKS proxy at {}", uri);
                OperationResult::ok(format!("Tor started, SOCKS proxy at {}", uri), ManagerState::Running)
            }
            Err(e) => {
                crate::plog_fmt!(LogLevel::Error, "Cannot start Tor: {}", e);
                let mut shared = self.inner.write_shared();
                shared.view.state = ManagerState::Error;
                shared.view.fatal = e.is_fatal();
                shared.view.last_error = Some(e.to_string());
                OperationResult::fail(e.to_string(), ManagerState::Error)
            }
        }
    }

    /// Stops Tor: `SIGNAL HALT`, a bounded wait, then a kill.
    ///
    /// Isolation contexts are destroyed. Stopping a stopped manager succeeds.
    pub async fn stop(&self) -> OperationResult {
        let mut lc = self.inner.lifecycle.lock().await;
        let state = self.inner.read_shared().view.state;
        if state == ManagerState::Stopped && !lc.process.is_alive() {
            return OperationResult::ok("Tor is not running", state);
        }

        self.inner.write_shared().view.state = ManagerState::Stopping;
        plog(LogLevel::Notice, "Stopping Tor");

        let result = self.inner.teardown(&mut lc, true).await;
        let mut shared = self.inner.write_shared();
        match result {
            Ok(()) => {
                shared.view.state = ManagerState::Stopped;
                shared.view.fatal = false;
                shared.view.last_error = None;
                plog(LogLevel::Notice, "Tor stopped");
                OperationResult::ok("Tor stopped", ManagerState::Stopped)
            }
            Err(e) => {
                shared.view.state = ManagerState::Error;
                shared.view.last_error = Some(e.to_string());
                OperationResult::fail(e.to_string(), ManagerState::Error)
            }
        }
    }

    /// A fresh status snapshot.
    pub fn get_status(&self) -> StatusSnapshot {
        let shared = self.inner.read_shared();
        let circuits = self.inner.read_circuits();

        let mut view = shared.view.clone();
        view.process_alive = shared
            .exit_watch
            .as_ref()
            .is_some_and(|w| w.borrow().is_none());
        view.control_authenticated = shared
            .control
            .as_ref()
            .is_some_and(|c| c.is_authenticated());

        StatusReporter {
            lifecycle: &view,
            config: &shared.config,
            bridges: &shared.bridges,
            isolation: &shared.isolation,
            circuits: &circuits,
        }
        .snapshot(Utc::now())
    }

    /// Proxy settings for the shared SOCKS endpoint.
    pub fn get_proxy_config(&self) -> ProxyConfig {
        ProxyConfig::socks5(&self.inner.read_shared().config.socks_endpoint())
    }

    /// The SOCKS endpoint for an isolation key.
    ///
    /// In mode `none` every key maps to the shared endpoint. Otherwise Tor
    /// must be running; a new key opens a listener with its own session group
    /// and is rolled back if Tor refuses it.
    pub async fn get_isolated_endpoint(&self, key: &str) -> EndpointResult {
        let _lc = self.inner.lifecycle.lock().await;

        let (allocation, control) = {
            let mut shared = self.inner.write_shared();
            if shared.isolation.mode() != IsolationMode::None
                && shared.view.state != ManagerState::Running
            {
                return EndpointResult::fail(key, "Tor is not running");
            }
            match shared.isolation.get_isolated_endpoint(key) {
                Ok(a) => (a, shared.control.clone()),
                Err(e) => return EndpointResult::fail(key, e.to_string()),
            }
        };

        if !allocation.created {
            return EndpointResult::ok(allocation.context, "existing endpoint");
        }

        let listeners = self.inner.read_shared().isolation.listeners();
        let pushed = match control {
            Some(control) => control.set_socks_listeners(&listeners).await,
            None => Err(Error::Disconnected),
        };
        if let Err(e) = pushed {
            self.inner
                .write_shared()
                .isolation
                .rollback(&allocation.context.key);
            return EndpointResult::fail(key, format!("cannot open isolated listener: {}", e));
        }

        tracing::info!(
            key = %allocation.context.key,
            endpoint = %allocation.context.endpoint,
            group = allocation.context.session_group,
            "isolation context created"
        );
        EndpointResult::ok(allocation.context, "endpoint created")
    }

    /// Releases the context for `key`.
    ///
    /// Its port is not reused until the grace period has passed.
    pub async fn release_isolation(&self, key: &str) -> OperationResult {
        let _lc = self.inner.lifecycle.lock().await;
        let (released, state) = {
            let mut shared = self.inner.write_shared();
            (shared.isolation.release(key), shared.view.state)
        };
        if !released {
            return OperationResult::fail(format!("no isolation context for {:?}", key), state);
        }
        if state == ManagerState::Running {
            if let Err(e) = self.inner.sync_listeners().await {
                return OperationResult::fail(
                    format!("context released but listener still open: {}", e),
                    state,
                );
            }
        }
        OperationResult::ok("isolation context released", state)
    }

    /// Switches the isolation mode by name.
    ///
    /// Unknown names fail and leave the mode unchanged. A real change
    /// releases every context.
    pub async fn set_isolation_mode(&self, mode: &str) -> OperationResult {
        let _lc = self.inner.lifecycle.lock().await;
        let (released, state, new_mode) = {
            let mut shared = self.inner.write_shared();
            let state = shared.view.state;
            let had_contexts = !shared.isolation.is_empty();
            let old = shared.isolation.mode();
            match shared.isolation.set_mode(mode) {
                Ok(new) => {
                    shared.config.isolation_mode = new;
                    (old != new && had_contexts, state, new)
                }
                Err(e) => return OperationResult::fail(e.to_string(), state),
            }
        };

        if released && state == ManagerState::Running {
            if let Err(e) = self.inner.sync_listeners().await {
                tracing::warn!(error = %e, "cannot close released isolation listeners");
            }
        }
        OperationResult::ok(format!("isolation mode set to {}", new_mode), state)
    }

    /// Adds a bridge line. `None` and malformed lines are rejected.
    ///
    /// Bridges apply on the next start.
    pub fn add_bridge(&self, line: Option<&str>) -> OperationResult {
        let mut shared = self.inner.write_shared();
        let state = shared.view.state;
        let Some(line) = line else {
            return OperationResult::fail("a bridge line is required", state);
        };
        match shared.bridges.add(line) {
            Ok(count) => {
                if let Some(raw) = shared.bridges.iter().last().map(|b| b.raw.clone()) {
                    shared.config.bridges.push(raw);
                }
                OperationResult::ok(format!("bridge added ({} configured)", count), state)
            }
            Err(e) => OperationResult::fail(e.to_string(), state),
        }
    }

    /// Removes every bridge.
    pub fn clear_bridges(&self) -> OperationResult {
        let mut shared = self.inner.write_shared();
        shared.bridges.clear();
        shared.config.bridges.clear();
        OperationResult::ok("bridges cleared", shared.view.state)
    }

    /// Asks Tor for clean circuits (`SIGNAL NEWNYM`).
    pub async fn request_new_identity(&self) -> OperationResult {
        let (control, state) = {
            let shared = self.inner.read_shared();
            (shared.control.clone(), shared.view.state)
        };
        let Some(control) = control.filter(|_| state == ManagerState::Running) else {
            return OperationResult::fail("Tor is not running", state);
        };
        match control.new_identity().await {
            Ok(()) => {
                self.inner.write_shared().view.exit_node = None;
                plog(LogLevel::Info, "New identity requested");
                OperationResult::ok("new identity requested", state)
            }
            Err(e) => OperationResult::fail(e.to_string(), state),
        }
    }

    /// Classifies a URL as onion or not.
    pub fn is_onion_url(&self, url: &str) -> OnionUrlResult {
        match onion::classify(url) {
            Ok(info) => OnionUrlResult {
                success: true,
                message: None,
                is_onion: info.is_onion,
                is_v3: info.is_v3,
            },
            Err(e) => OnionUrlResult {
                success: false,
                message: Some(e.to_string()),
                is_onion: false,
                is_v3: false,
            },
        }
    }

    /// Countries usable in exit policies.
    pub fn list_country_codes(&self) -> &'static [CountryCode] {
        catalog::country_codes()
    }

    /// Supported pluggable transports.
    pub fn list_transport_types(&self) -> &'static [TransportType] {
        catalog::transport_types()
    }
}

impl Inner {
    fn read_shared(&self) -> RwLockReadGuard<'_, Shared> {
        self.shared.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_shared(&self) -> RwLockWriteGuard<'_, Shared> {
        self.shared.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_circuits(&self) -> RwLockReadGuard<'_, CircuitTracker> {
        self.circuits.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_circuits(&self) -> RwLockWriteGuard<'_, CircuitTracker> {
        self.circuits.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launches Tor, authenticates and marks the manager running.
    ///
    /// Returns the receivers the supervising task watches.
    async fn launch(
        self: &Arc<Self>,
        lc: &mut Lifecycle,
    ) -> Result<(ExitWatch, broadcast::Receiver<ControlEvent>)> {
        let (config, bridges, listeners, stored_password) = {
            let shared = self.read_shared();
            (
                shared.config.clone(),
                shared.bridges.clone(),
                shared.isolation.listeners(),
                shared.password.clone(),
            )
        };

        for transport in bridges.transports() {
            if config.plugin_for(transport).is_none() {
                return Err(Error::Config(format!(
                    "no transport plugin configured for {}",
                    transport
                )));
            }
        }

        if config.control_password.is_none() && config.hashed_control_password.is_some() {
            return Err(Error::Config(
                "hashed_control_password needs control_password to authenticate".to_string(),
            ));
        }

        let mut launch = process::launch_config(&config)?;

        let password = match (config.control_password.as_ref(), stored_password) {
            (Some(pw), _) => Some(SecurePassword::new(pw.clone())),
            (None, Some(generated)) => Some(generated),
            (None, None) if config.generate_password => {
                let generated = generate_password();
                self.write_shared().password = Some(generated.clone());
                Some(generated)
            }
            (None, None) => None,
        };

        if let Some(ref pw) = password {
            if launch.hashed_control_password.is_none() {
                let binary = process::resolve_binary(&launch)?;
                launch.hashed_control_password =
                    Some(process::hash_password(&binary, pw.as_str()).await?);
            }
        }

        let payload = torrc::render(&launch, &bridges, &listeners);
        lc.process.start(&payload, &launch).await?;
        self.write_shared().launched_password = password.clone();

        let (control, events) = match connect_control(&launch, password.as_ref()).await {
            Ok(connected) => connected,
            Err(e) => {
                lc.process.kill().await;
                return Err(e);
            }
        };
        let supervisor_events = control.events();
        self.attach_control(lc, control, events).await;

        let Some(exit) = lc.process.exit_watch() else {
            return Err(Error::Process("tor exit watch missing".to_string()));
        };

        let mut shared = self.write_shared();
        shared.view.state = ManagerState::Running;
        shared.view.fatal = false;
        shared.view.last_error = None;
        shared.view.pid = lc.process.pid();
        shared.view.started_at = lc.process.started_at();
        shared.exit_watch = Some(exit.clone());
        Ok((exit, supervisor_events))
    }

    /// Installs a freshly authenticated control connection.
    async fn attach_control(
        self: &Arc<Self>,
        lc: &mut Lifecycle,
        control: Arc<ControlClient>,
        events: broadcast::Receiver<ControlEvent>,
    ) {
        let circuits = control.circuit_status().await;
        let version = control.version().await;
        let progress = control.bootstrap_progress().await;

        {
            let mut tracker = self.write_circuits();
            tracker.clear_circuits();
            match circuits {
                Ok(list) => tracker.seed(list),
                Err(e) => tracing::warn!(error = %e, "cannot read circuit status"),
            }
        }

        {
            let mut shared = self.write_shared();
            match version {
                Ok(v) => shared.view.tor_version = Some(v),
                Err(e) => tracing::debug!(error = %e, "cannot read tor version"),
            }
            shared.view.bootstrap_progress = progress.unwrap_or(0);
            shared.view.exit_node = None;
            if let Some(old) = shared.control.replace(Arc::clone(&control)) {
                old.close();
            }
        }

        let pump = tokio::spawn(event_pump(Arc::downgrade(self), events));
        if let Some(old) = lc.pump.replace(pump) {
            old.abort();
        }
    }

    /// Re-declares every SOCKS listener through the control port.
    async fn sync_listeners(&self) -> Result<()> {
        let (control, listeners) = {
            let shared = self.read_shared();
            (shared.control.clone(), shared.isolation.listeners())
        };
        let control = control.ok_or(Error::Disconnected)?;
        control.set_socks_listeners(&listeners).await
    }

    /// Stops background tasks and the process, clearing runtime state.
    async fn teardown(&self, lc: &mut Lifecycle, graceful: bool) -> Result<()> {
        lc.generation += 1;
        if let Some(handle) = lc.supervisor.take() {
            handle.abort();
        }

        let (control, grace) = {
            let mut shared = self.write_shared();
            (shared.control.take(), shared.config.stop_timeout())
        };
        if let Some(control) = control {
            if graceful && control.is_authenticated() {
                if let Err(e) = control.signal(Signal::Halt).await {
                    tracing::debug!(error = %e, "SIGNAL HALT failed");
                }
            }
            control.close();
        }
        if let Some(handle) = lc.pump.take() {
            handle.abort();
        }

        let grace = if graceful { grace } else { Duration::ZERO };
        let result = lc.process.stop(grace).await;

        self.write_circuits().clear_circuits();
        let mut shared = self.write_shared();
        shared.isolation.clear();
        shared.exit_watch = None;
        shared.password = None;
        shared.launched_password = None;
        shared.view.pid = None;
        shared.view.started_at = None;
        shared.view.exit_node = None;
        shared.view.bootstrap_progress = 0;
        result
    }

    /// Handles an unexpected exit. Returns new receivers once Tor runs again,
    /// or `None` when supervision ends.
    async fn recover_from_crash(
        self: &Arc<Self>,
        generation: u64,
        record: Option<ExitRecord>,
    ) -> Option<(ExitWatch, broadcast::Receiver<ControlEvent>)> {
        let code = record.and_then(|r| r.code);
        {
            let mut lc = self.lifecycle.lock().await;
            if lc.generation != generation {
                return None;
            }
            if let Some(handle) = lc.pump.take() {
                handle.abort();
            }
            let control = {
                let mut shared = self.write_shared();
                shared.view.state = ManagerState::Error;
                shared.view.last_error = Some(format!("tor exited unexpectedly (code {:?})", code));
                shared.view.exit_node = None;
                shared.view.bootstrap_progress = 0;
                shared.control.take()
            };
            if let Some(control) = control {
                control.close();
            }
            self.write_circuits().clear_circuits();
            lc.process.kill().await;
        }
        crate::plog_fmt!(LogLevel::Warn, "Tor exited unexpectedly (code {:?})", code);

        loop {
            let (attempt, config) = {
                let shared = self.read_shared();
                (shared.view.restart_count + 1, shared.config.clone())
            };
            if attempt > config.max_restarts {
                let error = Error::ProcessCrashed {
                    code,
                    restarts: config.max_restarts,
                };
                crate::plog_fmt!(LogLevel::Error, "Giving up on Tor: {}", error);
                self.pin_error(&error);
                return None;
            }

            tokio::time::sleep(config.restart_backoff(attempt)).await;

            let mut lc = self.lifecycle.lock().await;
            if lc.generation != generation {
                return None;
            }
            {
                let mut shared = self.write_shared();
                shared.view.restart_count = attempt;
                shared.view.state = ManagerState::Starting;
            }
            crate::plog_fmt!(
                LogLevel::Notice,
                "Restarting Tor (attempt {} of {})",
                attempt,
                config.max_restarts
            );

            match self.launch(&mut lc).await {
                Ok(receivers) => {
                    plog(LogLevel::Notice, "Tor restarted");
                    return Some(receivers);
                }
                Err(e) if e.is_fatal() => {
                    crate::plog_fmt!(LogLevel::Error, "Cannot restart Tor: {}", e);
                    self.pin_error(&e);
                    return None;
                }
                Err(e) => {
                    crate::plog_fmt!(LogLevel::Warn, "Restart attempt {} failed: {}", attempt, e);
                    let mut shared = self.write_shared();
                    shared.view.state = ManagerState::Error;
                    shared.view.last_error = Some(e.to_string());
                }
            }
        }
    }

    /// Handles a dropped control connection while Tor may still be alive.
    async fn recover_control(self: &Arc<Self>, generation: u64, exit: &ExitWatch) -> Reconnect {
        plog(LogLevel::Warn, "Control connection lost");
        let (config, password) = {
            let mut shared = self.write_shared();
            shared.view.state = ManagerState::Error;
            shared.view.last_error = Some(Error::Disconnected.to_string());
            (shared.config.clone(), shared.launched_password.clone())
        };

        for attempt in 1..=config.max_reconnects {
            tokio::time::sleep(config.restart_backoff(attempt)).await;
            if exit.borrow().is_some() {
                return Reconnect::ProcessGone;
            }

            let mut lc = self.lifecycle.lock().await;
            if lc.generation != generation {
                return Reconnect::Abandoned;
            }
            match connect_control(&config, password.as_ref()).await {
                Ok((control, events)) => {
                    let supervisor_events = control.events();
                    self.attach_control(&mut lc, control, events).await;
                    {
                        let mut shared = self.write_shared();
                        shared.view.state = ManagerState::Running;
                        shared.view.last_error = None;
                    }
                    plog(LogLevel::Notice, "Control connection restored");
                    return Reconnect::Reconnected(supervisor_events);
                }
                Err(e) if e.is_fatal() => {
                    crate::plog_fmt!(LogLevel::Error, "Cannot re-authenticate: {}", e);
                    self.pin_error(&e);
                    lc.process.kill().await;
                    return Reconnect::Abandoned;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect failed");
                }
            }
        }

        // the process is unreachable; let the crash path restart it
        let mut lc = self.lifecycle.lock().await;
        if lc.generation != generation {
            return Reconnect::Abandoned;
        }
        plog(LogLevel::Warn, "Control port unreachable, killing Tor");
        lc.process.kill().await;
        Reconnect::ProcessGone
    }

    fn pin_error(&self, error: &Error) {
        let mut shared = self.write_shared();
        shared.view.state = ManagerState::Error;
        shared.view.fatal = true;
        shared.view.last_error = Some(error.to_string());
    }

    fn lookup_exit(self: &Arc<Self>, fingerprint: String) {
        let Some(control) = self.read_shared().control.clone() else {
            return;
        };
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            match control.exit_node_info(&fingerprint).await {
                Ok(info) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.write_shared().view.exit_node = Some(info);
                    }
                }
                Err(e) => tracing::debug!(%fingerprint, error = %e, "exit lookup failed"),
            }
        });
    }
}

async fn connect_control(
    config: &Config,
    password: Option<&SecurePassword>,
) -> Result<(Arc<ControlClient>, broadcast::Receiver<ControlEvent>)> {
    let control = ControlClient::connect(&config.control_endpoint(), config.command_timeout()).await?;
    control.authenticate_auto(password).await?;
    let events = control.subscribe_events(&SUBSCRIBED_EVENTS).await?;
    Ok((Arc::new(control), events))
}

async fn apply_exit_policy(control: &ControlClient, config: &Config) -> Result<()> {
    let options = vec![
        (
            "ExitNodes".to_string(),
            torrc::country_set(&config.exit_countries),
        ),
        (
            "ExcludeExitNodes".to_string(),
            torrc::country_set(&config.exclude_exit_countries),
        ),
        (
            "StrictNodes".to_string(),
            Some(if config.strict_nodes { "1" } else { "0" }.to_string()),
        ),
    ];
    control.set_conf(&options).await
}

fn generate_password() -> SecurePassword {
    let password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect();
    SecurePassword::new(password)
}

async fn wait_exit(exit: &mut ExitWatch) -> Option<ExitRecord> {
    exit.wait_for(|r| r.is_some()).await.ok().and_then(|r| *r)
}

/// Watches one run of Tor: exits trigger restarts, dropped control
/// connections trigger reconnects.
async fn supervise(
    inner: Weak<Inner>,
    generation: u64,
    mut exit: ExitWatch,
    mut events: broadcast::Receiver<ControlEvent>,
) {
    let mut control_live = true;
    loop {
        tokio::select! {
            record = wait_exit(&mut exit) => {
                let Some(inner) = inner.upgrade() else { return };
                match inner.recover_from_crash(generation, record).await {
                    Some((new_exit, new_events)) => {
                        exit = new_exit;
                        events = new_events;
                        control_live = true;
                    }
                    None => return,
                }
            }
            event = events.recv(), if control_live => {
                match event {
                    Ok(ControlEvent::ConnectionClosed) | Err(RecvError::Closed) => {
                        let Some(inner) = inner.upgrade() else { return };
                        match inner.recover_control(generation, &exit).await {
                            Reconnect::Reconnected(new_events) => events = new_events,
                            Reconnect::ProcessGone => control_live = false,
                            Reconnect::Abandoned => return,
                        }
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
        }
    }
}

/// Applies control events to the circuit table and lifecycle view.
async fn event_pump(inner: Weak<Inner>, mut events: broadcast::Receiver<ControlEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event pump lagging, events dropped");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else { break };

        match event {
            ControlEvent::ConnectionClosed => break,
            ControlEvent::Bootstrap {
                progress,
                ref summary,
                ..
            } => {
                let previous = {
                    let mut shared = inner.write_shared();
                    std::mem::replace(&mut shared.view.bootstrap_progress, progress)
                };
                if progress != previous {
                    tracing::info!(progress, %summary, "bootstrap");
                    if progress == 100 {
                        plog(LogLevel::Notice, "Tor has bootstrapped");
                    }
                }
            }
            ControlEvent::Status {
                ref kind,
                ref severity,
                ref action,
            } => {
                tracing::debug!(%kind, %severity, %action, "tor status event");
            }
            ref other => {
                let (before, after) = {
                    let mut tracker = inner.write_circuits();
                    let before = tracker.current_exit().map(str::to_string);
                    tracker.apply(other);
                    (before, tracker.current_exit().map(str::to_string))
                };
                if before != after {
                    if let Some(fingerprint) = after {
                        tracing::debug!(%fingerprint, "exit changed");
                        inner.lookup_exit(fingerprint);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP: &str = "0123456789ABCDEF0123456789ABCDEF01234567";

    #[test]
    fn test_defaults() {
        let manager = TorManager::default();
        let status = manager.get_status();
        assert_eq!(status.state, ManagerState::Stopped);
        assert!(!status.process_running);
        assert_eq!(status.socks, Endpoint::new("127.0.0.1", 9050));
        assert_eq!(status.control, Endpoint::new("127.0.0.1", 9051));

        let proxy = manager.get_proxy_config();
        assert_eq!(proxy.host, "127.0.0.1");
        assert_eq!(proxy.port, 9050);
        assert_eq!(proxy.proxy_type, "socks5");
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = Config {
            control_port: 9050,
            ..Config::default()
        };
        assert!(TorManager::new(config).is_err());
    }

    #[test]
    fn test_add_bridge_rejects_missing_and_empty() {
        let manager = TorManager::default();
        let none = manager.add_bridge(None);
        assert!(!none.success);
        let empty = manager.add_bridge(Some(""));
        assert!(!empty.success);
        assert_eq!(manager.get_status().bridge_count, 0);

        let ok = manager.add_bridge(Some(&format!(
            "obfs4 192.0.2.3:443 {} cert=xyz iat-mode=0",
            FP
        )));
        assert!(ok.success, "{}", ok.message);
        assert_eq!(manager.get_status().bridge_count, 1);
        assert_eq!(manager.config().bridges.len(), 1);

        assert!(manager.clear_bridges().success);
        assert_eq!(manager.get_status().bridge_count, 0);
        assert!(manager.config().bridges.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_isolation_mode_keeps_mode() {
        let manager = TorManager::default();
        assert!(manager.set_isolation_mode("per_domain").await.success);

        let result = manager.set_isolation_mode("invalid_mode").await;
        assert!(!result.success);
        assert!(result.message.contains("invalid_mode"));
        assert_eq!(manager.get_status().isolation_mode, IsolationMode::PerDomain);
        assert_eq!(manager.config().isolation_mode, IsolationMode::PerDomain);
    }

    #[tokio::test]
    async fn test_isolation_needs_running_tor_unless_mode_none() {
        let manager = TorManager::default();
        let shared = manager.get_isolated_endpoint("tab-1").await;
        assert!(shared.success);
        assert_eq!(shared.endpoint, Some(Endpoint::new("127.0.0.1", 9050)));
        assert_eq!(shared.session_group, Some(0));

        manager.set_isolation_mode("per_tab").await;
        let result = manager.get_isolated_endpoint("tab-1").await;
        assert!(!result.success);
        assert!(manager.get_status().isolation_contexts.is_empty());
    }

    #[tokio::test]
    async fn test_configure_validates_before_applying() {
        let manager = TorManager::default();
        let bad = ConfigUpdate {
            exit_countries: Some(vec!["germany".to_string()]),
            ..ConfigUpdate::default()
        };
        assert!(!manager.configure(bad).await.success);
        assert!(manager.config().exit_countries.is_empty());

        let good = ConfigUpdate::from_json(
            r#"{"exit_countries": ["DE", "nl"], "strict_nodes": true, "isolation_mode": "custom"}"#,
        )
        .unwrap();
        let result = manager.configure(good).await;
        assert!(result.success, "{}", result.message);
        let status = manager.get_status();
        assert_eq!(status.exit_policy.exit_countries, ["de", "nl"]);
        assert!(status.exit_policy.strict_nodes);
        assert_eq!(status.isolation_mode, IsolationMode::Custom);
    }

    #[tokio::test]
    async fn test_operations_when_stopped() {
        let manager = TorManager::default();
        assert!(!manager.request_new_identity().await.success);
        let stop = manager.stop().await;
        assert!(stop.success);
        assert_eq!(stop.state, ManagerState::Stopped);
        assert!(!manager.release_isolation("nothing").await.success);
    }

    #[tokio::test]
    async fn test_start_without_binary_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            tor_path: Some(dir.path().join("missing-tor")),
            data_dir: dir.path().join("data"),
            ..Config::default()
        };
        let manager = TorManager::new(config).unwrap();
        let result = manager.start().await;
        assert!(!result.success);
        assert_eq!(result.state, ManagerState::Error);
        let status = manager.get_status();
        assert_eq!(status.state, ManagerState::Error);
        assert!(status.fatal);
        assert!(status.last_error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_start_requires_plugin_for_bridge_transport() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            data_dir: dir.path().join("data"),
            bridges: vec![format!("obfs4 192.0.2.3:443 {} cert=xyz iat-mode=0", FP)],
            ..Config::default()
        };
        let manager = TorManager::new(config).unwrap();
        let result = manager.start().await;
        assert!(!result.success);
        assert!(result.message.contains("obfs4"));
    }

    #[test]
    fn test_onion_and_catalogs() {
        let manager = TorManager::default();
        let v3 = manager.is_onion_url(&format!("http://{}.onion", "a".repeat(56)));
        assert!(v3.success && v3.is_onion && v3.is_v3);

        let clear = manager.is_onion_url("https://example.org");
        assert!(clear.success && !clear.is_onion);

        let malformed = manager.is_onion_url("not a url");
        assert!(!malformed.success);
        assert!(!malformed.is_onion);
        assert!(malformed.message.is_some());

        assert!(manager
            .list_country_codes()
            .iter()
            .any(|c| c.code == "de"));
        assert!(manager
            .list_transport_types()
            .iter()
            .any(|t| t.transport == crate::bridges::Transport::Snowflake));
    }

    #[test]
    fn test_generated_password_shape() {
        let pw = generate_password();
        assert_eq!(pw.as_str().len(), GENERATED_PASSWORD_LEN);
        assert!(pw.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(pw.as_str(), generate_password().as_str());
    }
}
