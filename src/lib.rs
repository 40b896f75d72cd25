//! # tor-manager-rs
//!
//! Embeds and supervises a Tor process for a client application such as a
//! browser, and talks to it over the Tor control protocol.
//!
//! # Overview
//!
//! tor-manager-rs launches a private Tor instance from a generated torrc,
//! authenticates to its control port and keeps it healthy:
//!
//! - **Process supervision** ([`process`]): spawn, readiness wait, graceful stop, crash detection
//! - **Control client** ([`controller`]): framing, authentication, commands, async events
//! - **Circuit tracking** ([`circuits`]): live circuit table, current exit, traffic totals
//! - **Stream isolation** ([`isolation`]): per-key SOCKS listeners with their own session groups
//! - **Bridges** ([`bridges`]): bridge-line validation and pluggable transports
//! - **Status** ([`status`]): serializable snapshots for a UI
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`manager`] | High-level [`TorManager`] facade |
//! | [`config`] | Configuration management (TOML, CLI, environment, JSON updates) |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`torrc`] | Rendering the Tor configuration file |
//! | [`process`] | Tor binary discovery and child supervision |
//! | [`protocol`] | Control-protocol reply framing |
//! | [`events`] | Parsing asynchronous control events |
//! | [`controller`] | Control-port client |
//! | [`circuits`] | Circuit table |
//! | [`isolation`] | Isolation contexts and SOCKS listeners |
//! | [`bridges`] | Bridge registry |
//! | [`onion`] | Onion URL classification |
//! | [`catalog`] | Country codes and transport descriptions |
//! | [`status`] | Status snapshots |
//! | [`logger`] | Logging infrastructure using tracing |
//!
//! # What This Library Does NOT Do
//!
//! - **Proxying traffic**: callers point their SOCKS client at the endpoints it returns
//! - **Onion services**: no `ADD_ONION`; onion URLs are only classified
//! - **Relay operation**: Tor always runs with `ClientOnly 1`
//! - **Fetching bridges**: bridge lines are supplied by the caller
//!
//! # Quick Start
//!
//! ## As a Library
//!
//! ```rust,no_run
//! use tor_manager::{Config, TorManager};
//!
//! #[tokio::main]
//! async fn main() -> tor_manager::Result<()> {
//!     let manager = TorManager::new(Config::default())?;
//!
//!     let started = manager.start().await;
//!     if !started.success {
//!         eprintln!("{}", started.message);
//!         return Ok(());
//!     }
//!
//!     let status = manager.get_status();
//!     println!("{} via {}", status.state, status.proxy_uri);
//!
//!     manager.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## As a CLI Application
//!
//! ```bash
//! # Run with default settings (SOCKS on 127.0.0.1:9050)
//! tor-manager
//!
//! # Use the Tor binary shipped in a bundle directory
//! tor-manager --bundle-dir ./tor-bundle --data-dir ./tor-data
//!
//! # Generate default configuration file
//! tor-manager --generate-config tor-manager.toml
//! ```
//!
//! # Configuration
//!
//! Configuration can be loaded from multiple sources in order of precedence:
//!
//! ```text
//! ┌─────────────────┐
//! │   CLI Arguments │ ◄── Highest priority (overrides all)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   Environment   │ ◄── TOR_MANAGER_CONFIG, TOR_MANAGER_TOR_PATH, ...
//! │    Variables    │
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   Config File   │ ◄── TOML file (default: tor-manager.toml)
//! │     (TOML)      │
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │    Defaults     │
//! └─────────────────┘
//! ```
//!
//! At runtime, [`TorManager::configure`] accepts partial updates as
//! [`ConfigUpdate`] values (deserializable from JSON).
//!
//! # Security Considerations
//!
//! - **Memory Safety**: control passwords are zeroized on drop ([`SecurePassword`])
//! - **File Permissions**: the data directory is `0700` and the torrc `0600`
//! - **Local Binding**: SOCKS and control listeners are validated as IP addresses
//! - **Process Ownership**: Tor is started with `__OwningControllerProcess` and
//!   is killed when the manager is dropped
//!
//! # See Also
//!
//! - [Tor Control Protocol Specification](https://spec.torproject.org/control-spec) - Protocol reference
//! - [Tor Manual](https://2019.www.torproject.org/docs/tor-manual.html.en) - torrc options

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod bridges;
pub mod catalog;
pub mod circuits;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod isolation;
pub mod logger;
pub mod manager;
pub mod onion;
pub mod process;
pub mod protocol;
pub mod status;
pub mod torrc;

/// Crate version, reported at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use bridges::{BridgeLine, BridgeRegistry, Transport};
pub use catalog::{CountryCode, TransportType};
pub use circuits::{CircuitInfo, CircuitTracker, TrafficStats};
pub use config::{load_config, CliArgs, Config, ConfigUpdate, Endpoint, LogLevel};
pub use controller::{AuthMethod, ControlClient, ExitNodeInfo, SecurePassword, Signal};
pub use error::{Error, Result};
pub use events::{CircuitEvent, CircuitStatus, ControlEvent, EventKind};
pub use isolation::{IsolationContext, IsolationManager, IsolationMode};
pub use manager::{EndpointResult, OnionUrlResult, OperationResult, TorManager};
pub use onion::OnionInfo;
pub use process::ProcessSupervisor;
pub use status::{ManagerState, ProxyConfig, StatusSnapshot};
