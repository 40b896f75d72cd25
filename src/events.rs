//! Typed control-port events.
//!
//! The controller's reader task turns every `650` frame into a
//! [`ControlEvent`] and publishes it on a broadcast channel. Consumers (the
//! circuit tracker, the manager's supervisor) subscribe to that channel
//! instead of registering callbacks.
//!
//! Only the events the manager acts on are parsed into dedicated variants;
//! everything else arrives as [`ControlEvent::Unknown`].

use std::fmt;

use serde::Serialize;

use crate::bridges::is_fingerprint;
use crate::error::{Error, Result};
use crate::protocol::{split_arguments, Reply};

/// Event types that can be passed to `SETEVENTS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Circuit status changes.
    Circ,
    /// Per-second bandwidth totals.
    Bw,
    /// Client status (bootstrap progress, dangerous ports, ...).
    StatusClient,
    /// General status (clock skew, bad libraries, ...).
    StatusGeneral,
    /// Stream status changes.
    Stream,
}

impl EventKind {
    /// Name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Circ => "CIRC",
            EventKind::Bw => "BW",
            EventKind::StatusClient => "STATUS_CLIENT",
            EventKind::StatusGeneral => "STATUS_GENERAL",
            EventKind::Stream => "STREAM",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a circuit.
///
/// `Failed` and `Closed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitStatus {
    /// Being built (`LAUNCHED`, `EXTENDED`, `GUARD_WAIT`).
    Launched,
    /// Ready for streams.
    Built,
    /// Construction failed.
    Failed,
    /// Torn down.
    Closed,
}

impl CircuitStatus {
    /// Returns true for statuses a circuit never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CircuitStatus::Failed | CircuitStatus::Closed)
    }

    fn parse(word: &str) -> Result<Self> {
        match word {
            "LAUNCHED" | "EXTENDED" | "GUARD_WAIT" => Ok(CircuitStatus::Launched),
            "BUILT" => Ok(CircuitStatus::Built),
            "FAILED" => Ok(CircuitStatus::Failed),
            "CLOSED" => Ok(CircuitStatus::Closed),
            other => Err(Error::Protocol(format!("unknown circuit status: {}", other))),
        }
    }
}

/// A circuit status line, from a `CIRC` event or `GETINFO circuit-status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitEvent {
    /// Circuit id.
    pub id: String,
    /// New status.
    pub status: CircuitStatus,
    /// Relay fingerprints from guard to exit.
    pub path: Vec<String>,
    /// `PURPOSE=` value, if present.
    pub purpose: Option<String>,
    /// `REASON=` value, if present.
    pub reason: Option<String>,
}

impl CircuitEvent {
    /// Parses `<id> <status> [path] [KEY=VALUE ...]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the id or status is missing.
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let id = words
            .next()
            .ok_or_else(|| Error::Protocol("circuit line without id".to_string()))?
            .to_string();
        let status = CircuitStatus::parse(
            words
                .next()
                .ok_or_else(|| Error::Protocol(format!("circuit {} without status", id)))?,
        )?;

        let rest: Vec<&str> = words.collect();
        let mut path = Vec::new();
        let mut keyword_start = 0;
        if let Some(first) = rest.first() {
            if !first.contains('=') || first.starts_with('$') {
                path = first.split(',').filter_map(hop_fingerprint).collect();
                keyword_start = 1;
            }
        }

        let mut purpose = None;
        let mut reason = None;
        for (key, value) in split_arguments(&rest[keyword_start..].join(" ")) {
            match key.as_str() {
                "PURPOSE" => purpose = Some(value),
                "REASON" => reason = Some(value),
                _ => {}
            }
        }

        Ok(Self {
            id,
            status,
            path,
            purpose,
            reason,
        })
    }

    /// Exit fingerprint (last hop), if the path is known.
    pub fn exit(&self) -> Option<&str> {
        self.path.last().map(String::as_str)
    }
}

/// Extracts the fingerprint from a `$FP~nick`, `$FP=nick` or `$FP` hop.
fn hop_fingerprint(hop: &str) -> Option<String> {
    let hop = hop.strip_prefix('$')?;
    let fp = hop.split(['~', '=']).next()?;
    is_fingerprint(fp).then(|| fp.to_ascii_uppercase())
}

/// Events published by the control client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// `CIRC` status change.
    Circuit(CircuitEvent),
    /// `BW` totals for the last second.
    Bandwidth {
        /// Bytes read.
        read: u64,
        /// Bytes written.
        written: u64,
    },
    /// `STATUS_CLIENT ... BOOTSTRAP` progress.
    Bootstrap {
        /// Percentage, 0–100.
        progress: u8,
        /// Short phase tag.
        tag: String,
        /// Human-readable phase summary.
        summary: String,
    },
    /// Any other `STATUS_*` event.
    Status {
        /// `STATUS_CLIENT`, `STATUS_GENERAL`, ...
        kind: String,
        /// `NOTICE`, `WARN` or `ERR`.
        severity: String,
        /// Action keyword.
        action: String,
    },
    /// An event type the manager does not interpret.
    Unknown {
        /// First word of the event.
        event_type: String,
        /// Remaining text.
        content: String,
    },
    /// The control connection closed; no further events follow.
    ConnectionClosed,
}

impl ControlEvent {
    /// Converts a `650` frame into a typed event.
    ///
    /// Malformed known events degrade to [`ControlEvent::Unknown`].
    pub fn from_reply(reply: &Reply) -> Self {
        let first = reply.lines.first().map(|l| l.text.as_str()).unwrap_or("");
        let (event_type, content) = first.split_once(' ').unwrap_or((first, ""));

        let parsed = match event_type {
            "CIRC" => CircuitEvent::parse(content).ok().map(ControlEvent::Circuit),
            "BW" => parse_bandwidth(content),
            t if t.starts_with("STATUS_") => Some(parse_status(t, content)),
            _ => None,
        };

        parsed.unwrap_or_else(|| ControlEvent::Unknown {
            event_type: event_type.to_string(),
            content: content.to_string(),
        })
    }
}

fn parse_bandwidth(content: &str) -> Option<ControlEvent> {
    let mut words = content.split_whitespace();
    let read = words.next()?.parse().ok()?;
    let written = words.next()?.parse().ok()?;
    Some(ControlEvent::Bandwidth { read, written })
}

fn parse_status(kind: &str, content: &str) -> ControlEvent {
    let args = split_arguments(content);
    let positional = |i: usize| {
        args.get(i)
            .filter(|(k, _)| k.is_empty())
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    };
    let severity = positional(0);
    let action = positional(1);

    if kind == "STATUS_CLIENT" && action == "BOOTSTRAP" {
        let lookup = |key: &str| {
            args.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        };
        if let Ok(progress) = lookup("PROGRESS").parse::<u8>() {
            return ControlEvent::Bootstrap {
                progress: progress.min(100),
                tag: lookup("TAG"),
                summary: lookup("SUMMARY"),
            };
        }
    }

    ControlEvent::Status {
        kind: kind.to_string(),
        severity,
        action,
    }
}
