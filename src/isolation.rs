//! Per-context stream isolation through dedicated SOCKS listeners.
//!
//! Every isolation key (a tab id, a domain, or a caller-chosen string) gets
//! its own SOCKS listener with a unique `SessionGroup`, so Tor never lets two
//! contexts share a circuit.
//!
//! # Port Allocation
//!
//! ```text
//!   socks_port      socks_port+1   socks_port+2   ...
//!   ┌──────────┐   ┌───────────┐  ┌───────────┐
//!   │  shared  │   │  key "a"  │  │  key "b"  │      (control_port is skipped)
//!   └──────────┘   └───────────┘  └───────────┘
//!
//!   release("a") ──▶ port parked for `grace` ──▶ reusable
//! ```
//!
//! Ports come from a monotonic counter above the base SOCKS port. A released
//! port is parked for the grace period before it can be handed out again, so
//! a connection still in flight to the old listener can never land in a new
//! context. The number of live contexts is capped.
//!
//! This type only does the bookkeeping. Binding the listeners is done by the
//! manager with `SETCONF SocksPort=...` built from [`IsolationManager::listeners`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{Config, Endpoint};
use crate::error::{Error, Result};

/// How traffic is split into isolation contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Everything uses the shared SOCKS endpoint.
    #[default]
    None,
    /// One context per browser tab id.
    PerTab,
    /// One context per first-party domain.
    PerDomain,
    /// One context per caller-supplied key.
    Custom,
}

impl IsolationMode {
    /// Wire/config name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationMode::None => "none",
            IsolationMode::PerTab => "per_tab",
            IsolationMode::PerDomain => "per_domain",
            IsolationMode::Custom => "custom",
        }
    }
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(IsolationMode::None),
            "per_tab" => Ok(IsolationMode::PerTab),
            "per_domain" => Ok(IsolationMode::PerDomain),
            "custom" => Ok(IsolationMode::Custom),
            other => Err(Error::InvalidIsolationMode(other.to_string())),
        }
    }
}

/// A live isolation context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IsolationContext {
    /// Normalized isolation key.
    pub key: String,
    /// Dedicated SOCKS endpoint.
    pub endpoint: Endpoint,
    /// When the context was created.
    pub created_at: DateTime<Utc>,
    /// Tor `SessionGroup` of the listener, 0 for the shared endpoint.
    pub session_group: u32,
}

/// Result of [`IsolationManager::get_isolated_endpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// The context serving the key.
    pub context: IsolationContext,
    /// True if the context was created by this call and its listener still
    /// has to be bound.
    pub created: bool,
}

/// A SOCKS listener declaration, rendered into `SocksPort` values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    /// Address the listener binds to.
    pub endpoint: Endpoint,
    /// Session group for isolated listeners; `None` for the shared one.
    pub session_group: Option<u32>,
}

impl Listener {
    /// Value of a `SocksPort` line for this listener.
    pub fn socks_port_value(&self) -> String {
        match self.session_group {
            Some(group) => format!("{} SessionGroup={}", self.endpoint, group),
            None => self.endpoint.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ParkedPort {
    port: u16,
    available_at: Instant,
}

/// Maps isolation keys to dedicated SOCKS endpoints.
#[derive(Debug)]
pub struct IsolationManager {
    mode: IsolationMode,
    base: Endpoint,
    control_port: u16,
    max_contexts: usize,
    grace: Duration,
    contexts: HashMap<String, IsolationContext>,
    parked: VecDeque<ParkedPort>,
    next_port: u32,
    next_group: u32,
}

impl IsolationManager {
    /// Creates a manager for the configured base endpoint and mode.
    pub fn new(config: &Config) -> Self {
        Self {
            mode: config.isolation_mode,
            base: config.socks_endpoint(),
            control_port: config.control_port,
            max_contexts: config.max_isolation_contexts,
            grace: config.isolation_grace(),
            contexts: HashMap::new(),
            parked: VecDeque::new(),
            next_port: u32::from(config.socks_port) + 1,
            next_group: 1,
        }
    }

    /// Current isolation mode.
    pub fn mode(&self) -> IsolationMode {
        self.mode
    }

    /// The shared SOCKS endpoint.
    pub fn base_endpoint(&self) -> &Endpoint {
        &self.base
    }

    /// Switches mode by name.
    ///
    /// Unknown names fail with [`Error::InvalidIsolationMode`] and leave the
    /// manager untouched. Switching to a different mode releases every
    /// existing context.
    pub fn set_mode(&mut self, name: &str) -> Result<IsolationMode> {
        let mode: IsolationMode = name.parse()?;
        self.apply_mode(mode);
        Ok(mode)
    }

    /// Switches to an already-parsed mode.
    pub fn apply_mode(&mut self, mode: IsolationMode) {
        if mode == self.mode {
            return;
        }
        let keys: Vec<String> = self.contexts.keys().cloned().collect();
        for key in keys {
            self.release_normalized(&key, Instant::now());
        }
        self.mode = mode;
    }

    /// Returns the endpoint serving `key`, allocating one on first use.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if the key is empty after normalization
    /// - [`Error::Config`] if the context cap is reached or ports ran out
    pub fn get_isolated_endpoint(&mut self, key: &str) -> Result<Allocation> {
        self.allocate_at(key, Instant::now())
    }

    fn allocate_at(&mut self, key: &str, now: Instant) -> Result<Allocation> {
        let key = self.normalize_key(key)?;

        if self.mode == IsolationMode::None {
            return Ok(Allocation {
                context: IsolationContext {
                    key,
                    endpoint: self.base.clone(),
                    created_at: Utc::now(),
                    session_group: 0,
                },
                created: false,
            });
        }

        if let Some(existing) = self.contexts.get(&key) {
            return Ok(Allocation {
                context: existing.clone(),
                created: false,
            });
        }

        if self.contexts.len() >= self.max_contexts {
            return Err(Error::Config(format!(
                "isolation context limit of {} reached",
                self.max_contexts
            )));
        }

        let port = self.take_port(now)?;
        let session_group = self.next_group;
        self.next_group += 1;

        let context = IsolationContext {
            key: key.clone(),
            endpoint: Endpoint::new(self.base.host.clone(), port),
            created_at: Utc::now(),
            session_group,
        };
        self.contexts.insert(key, context.clone());

        Ok(Allocation {
            context,
            created: true,
        })
    }

    /// Releases the context for `key`; its port is parked for the grace period.
    ///
    /// Returns true if a context existed.
    pub fn release(&mut self, key: &str) -> bool {
        match self.normalize_key(key) {
            Ok(key) => self.release_normalized(&key, Instant::now()),
            Err(_) => false,
        }
    }

    /// Drops a context whose listener could not be bound.
    ///
    /// The port is likely held by another program, so it is parked for the
    /// grace period instead of being handed to the next key.
    pub fn rollback(&mut self, key: &str) {
        self.rollback_at(key, Instant::now());
    }

    fn rollback_at(&mut self, key: &str, now: Instant) {
        if let Some(ctx) = self.contexts.remove(key) {
            self.parked.push_back(ParkedPort {
                port: ctx.endpoint.port,
                available_at: now + self.grace,
            });
        }
    }

    fn release_normalized(&mut self, key: &str, now: Instant) -> bool {
        match self.contexts.remove(key) {
            Some(ctx) => {
                self.parked.push_back(ParkedPort {
                    port: ctx.endpoint.port,
                    available_at: now + self.grace,
                });
                true
            }
            None => false,
        }
    }

    /// Destroys every context and resets the allocator.
    ///
    /// Used when Tor stops: all listeners are gone with the process.
    pub fn clear(&mut self) {
        self.contexts.clear();
        self.parked.clear();
        self.next_port = u32::from(self.base.port) + 1;
        self.next_group = 1;
    }

    /// Listener declarations: the shared listener, then contexts by port.
    pub fn listeners(&self) -> Vec<Listener> {
        let mut isolated: Vec<&IsolationContext> = self.contexts.values().collect();
        isolated.sort_by_key(|c| c.endpoint.port);

        std::iter::once(Listener {
            endpoint: self.base.clone(),
            session_group: None,
        })
        .chain(isolated.into_iter().map(|c| Listener {
            endpoint: c.endpoint.clone(),
            session_group: Some(c.session_group),
        }))
        .collect()
    }

    /// Live contexts sorted by key.
    pub fn contexts(&self) -> Vec<IsolationContext> {
        let mut contexts: Vec<IsolationContext> = self.contexts.values().cloned().collect();
        contexts.sort_by(|a, b| a.key.cmp(&b.key));
        contexts
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Returns true if there are no live contexts.
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    fn normalize_key(&self, key: &str) -> Result<String> {
        let trimmed = key.trim();
        let normalized = match self.mode {
            IsolationMode::PerDomain => domain_key(trimmed),
            _ => trimmed.to_string(),
        };
        if normalized.is_empty() {
            return Err(Error::Validation("isolation key is empty".to_string()));
        }
        Ok(normalized)
    }

    fn port_in_use(&self, port: u16) -> bool {
        port == self.base.port
            || port == self.control_port
            || self.contexts.values().any(|c| c.endpoint.port == port)
    }

    fn take_port(&mut self, now: Instant) -> Result<u16> {
        if let Some(idx) = self
            .parked
            .iter()
            .position(|p| p.available_at <= now && !self.port_in_use(p.port))
        {
            if let Some(parked) = self.parked.remove(idx) {
                return Ok(parked.port);
            }
        }

        while self.next_port <= u32::from(u16::MAX) {
            let candidate = self.next_port as u16;
            self.next_port += 1;
            let parked = self.parked.iter().any(|p| p.port == candidate);
            if !parked && !self.port_in_use(candidate) {
                return Ok(candidate);
            }
        }

        Err(Error::Config(
            "no free ports left for isolation listeners".to_string(),
        ))
    }
}

/// Reduces a URL or host to the lowercase host used as a per-domain key.
fn domain_key(input: &str) -> String {
    let host = if input.contains("://") {
        url::Url::parse(input)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    } else {
        input.to_string()
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}
