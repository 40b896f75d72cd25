//! Circuit tracking driven by control-port events.
//!
//! The tracker never polls Tor. Its table changes only when the manager's
//! event pump hands it a [`ControlEvent`], and events are applied strictly in
//! arrival order.
//!
//! # Update Rules
//!
//! ```text
//!   unseen id ──────────────▶ insert
//!   launched/built ─────────▶ last status wins (duplicates, reordering)
//!   failed/closed ──────────▶ absorbing: later events for the id are ignored
//! ```
//!
//! Terminal circuits are kept for display, up to [`MAX_FINISHED_CIRCUITS`];
//! the oldest are evicted first.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::events::{CircuitEvent, CircuitStatus, ControlEvent};

/// Number of failed/closed circuits retained in the table.
pub const MAX_FINISHED_CIRCUITS: usize = 64;

/// Current knowledge about one circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitInfo {
    /// Tor circuit id.
    pub id: String,
    /// Latest status.
    pub status: CircuitStatus,
    /// Fingerprint of the last hop, once known.
    pub exit_node: Option<String>,
    /// Relay fingerprints from guard to exit.
    pub path: Vec<String>,
    /// Circuit purpose (`GENERAL`, `HS_CLIENT_REND`, ...).
    pub purpose: Option<String>,
    /// Close/fail reason.
    pub reason: Option<String>,
    /// When the last event for this circuit arrived.
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    built_seq: Option<u64>,
}

/// Cumulative traffic counters from `BW` events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficStats {
    /// Total bytes read by Tor.
    pub bytes_read: u64,
    /// Total bytes written by Tor.
    pub bytes_written: u64,
}

/// In-memory circuit table.
#[derive(Debug, Default)]
pub struct CircuitTracker {
    circuits: HashMap<String, CircuitInfo>,
    finished: VecDeque<String>,
    next_seq: u64,
    traffic: TrafficStats,
}

impl CircuitTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one control event. Returns true if the table changed.
    pub fn apply(&mut self, event: &ControlEvent) -> bool {
        match event {
            ControlEvent::Circuit(circ) => self.apply_circuit(circ),
            ControlEvent::Bandwidth { read, written } => {
                self.traffic.bytes_read = self.traffic.bytes_read.saturating_add(*read);
                self.traffic.bytes_written = self.traffic.bytes_written.saturating_add(*written);
                true
            }
            _ => false,
        }
    }

    /// Loads the table from a `GETINFO circuit-status` listing.
    pub fn seed<I>(&mut self, circuits: I)
    where
        I: IntoIterator<Item = CircuitEvent>,
    {
        for circ in circuits {
            self.apply_circuit(&circ);
        }
    }

    fn apply_circuit(&mut self, event: &CircuitEvent) -> bool {
        let now = Utc::now();
        let info = match self.circuits.get_mut(&event.id) {
            Some(info) if info.status.is_terminal() => {
                tracing::debug!(
                    circuit = %event.id,
                    status = ?event.status,
                    "ignoring event for finished circuit"
                );
                return false;
            }
            Some(info) => {
                info.status = event.status;
                if !event.path.is_empty() {
                    info.path = event.path.clone();
                    info.exit_node = event.exit().map(str::to_string);
                }
                if event.purpose.is_some() {
                    info.purpose = event.purpose.clone();
                }
                if event.reason.is_some() {
                    info.reason = event.reason.clone();
                }
                info.updated_at = now;
                info
            }
            None => self
                .circuits
                .entry(event.id.clone())
                .or_insert_with(|| CircuitInfo {
                    id: event.id.clone(),
                    status: event.status,
                    exit_node: event.exit().map(str::to_string),
                    path: event.path.clone(),
                    purpose: event.purpose.clone(),
                    reason: event.reason.clone(),
                    updated_at: now,
                    built_seq: None,
                }),
        };

        match event.status {
            CircuitStatus::Built => {
                info.built_seq = Some(self.next_seq);
                self.next_seq += 1;
            }
            CircuitStatus::Failed | CircuitStatus::Closed => {
                self.finished.push_back(event.id.clone());
                while self.finished.len() > MAX_FINISHED_CIRCUITS {
                    if let Some(old) = self.finished.pop_front() {
                        self.circuits.remove(&old);
                    }
                }
            }
            CircuitStatus::Launched => {}
        }
        true
    }

    /// Exit fingerprint of the most recently built general-purpose circuit
    /// that is still open.
    pub fn current_exit(&self) -> Option<&str> {
        self.circuits
            .values()
            .filter(|c| c.status == CircuitStatus::Built)
            .filter(|c| c.purpose.as_deref().map_or(true, |p| p == "GENERAL"))
            .filter(|c| c.exit_node.is_some())
            .max_by_key(|c| c.built_seq)
            .and_then(|c| c.exit_node.as_deref())
    }

    /// Looks up a circuit by id.
    pub fn get(&self, id: &str) -> Option<&CircuitInfo> {
        self.circuits.get(id)
    }

    /// All known circuits, ordered by numeric id.
    pub fn circuits(&self) -> Vec<CircuitInfo> {
        let mut list: Vec<CircuitInfo> = self.circuits.values().cloned().collect();
        list.sort_by(|a, b| {
            let ka = a.id.parse::<u64>().ok();
            let kb = b.id.parse::<u64>().ok();
            ka.cmp(&kb).then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    /// Number of circuits currently built.
    pub fn built_count(&self) -> usize {
        self.circuits
            .values()
            .filter(|c| c.status == CircuitStatus::Built)
            .count()
    }

    /// Cumulative traffic counters.
    pub fn traffic(&self) -> TrafficStats {
        self.traffic
    }

    /// Forgets every circuit, keeping traffic totals.
    ///
    /// Circuit ids restart when Tor restarts.
    pub fn clear_circuits(&mut self) {
        self.circuits.clear();
        self.finished.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
    const B: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";
    const C: &str = "CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCC";

    fn circ(line: &str) -> ControlEvent {
        ControlEvent::Circuit(CircuitEvent::parse(line).unwrap())
    }

    #[test]
    fn test_launch_then_build() {
        let mut tracker = CircuitTracker::new();
        assert!(tracker.apply(&circ("1 LAUNCHED PURPOSE=GENERAL")));
        assert!(tracker.apply(&circ(&format!("1 BUILT ${},${} PURPOSE=GENERAL", A, B))));

        let info = tracker.get("1").unwrap();
        assert_eq!(info.status, CircuitStatus::Built);
        assert_eq!(info.exit_node.as_deref(), Some(B));
        assert_eq!(tracker.current_exit(), Some(B));
        assert_eq!(tracker.built_count(), 1);
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        let mut tracker = CircuitTracker::new();
        tracker.apply(&circ(&format!("2 BUILT ${}", A)));
        tracker.apply(&circ("2 CLOSED REASON=FINISHED"));
        assert!(!tracker.apply(&circ(&format!("2 BUILT ${}", A))));
        assert_eq!(tracker.get("2").unwrap().status, CircuitStatus::Closed);
        assert_eq!(tracker.get("2").unwrap().reason.as_deref(), Some("FINISHED"));

        tracker.apply(&circ("3 FAILED REASON=TIMEOUT"));
        assert!(!tracker.apply(&circ("3 LAUNCHED")));
        assert_eq!(tracker.get("3").unwrap().status, CircuitStatus::Failed);
    }

    #[test]
    fn test_last_status_wins_for_non_terminal() {
        let mut tracker = CircuitTracker::new();
        tracker.apply(&circ(&format!("4 BUILT ${}", A)));
        tracker.apply(&circ("4 EXTENDED"));
        let info = tracker.get("4").unwrap();
        assert_eq!(info.status, CircuitStatus::Launched);
        // a path-less event keeps the known path
        assert_eq!(info.path, [A]);
    }

    #[test]
    fn test_current_exit_prefers_latest_general_circuit() {
        let mut tracker = CircuitTracker::new();
        tracker.apply(&circ(&format!("1 BUILT ${},${} PURPOSE=GENERAL", A, B)));
        tracker.apply(&circ(&format!("2 BUILT ${},${} PURPOSE=GENERAL", A, C)));
        tracker.apply(&circ(&format!("3 BUILT ${},${} PURPOSE=HS_CLIENT_REND", A, A)));
        assert_eq!(tracker.current_exit(), Some(C));

        tracker.apply(&circ("2 CLOSED REASON=REQUESTED"));
        assert_eq!(tracker.current_exit(), Some(B));
    }

    #[test]
    fn test_finished_circuits_are_bounded() {
        let mut tracker = CircuitTracker::new();
        for id in 0..(MAX_FINISHED_CIRCUITS + 10) {
            tracker.apply(&circ(&format!("{} FAILED", id)));
        }
        assert_eq!(tracker.circuits().len(), MAX_FINISHED_CIRCUITS);
        assert!(tracker.get("0").is_none());
        assert!(tracker.get(&format!("{}", MAX_FINISHED_CIRCUITS + 9)).is_some());
    }

    #[test]
    fn test_traffic_accumulates_and_survives_clear() {
        let mut tracker = CircuitTracker::new();
        tracker.apply(&ControlEvent::Bandwidth { read: 10, written: 5 });
        tracker.apply(&ControlEvent::Bandwidth { read: 1, written: 2 });
        tracker.apply(&circ("1 LAUNCHED"));
        tracker.clear_circuits();
        assert!(tracker.circuits().is_empty());
        assert_eq!(
            tracker.traffic(),
            TrafficStats {
                bytes_read: 11,
                bytes_written: 7
            }
        );
    }

    #[test]
    fn test_circuits_sorted_numerically() {
        let mut tracker = CircuitTracker::new();
        tracker.seed(
            ["10 LAUNCHED", "9 LAUNCHED", "100 LAUNCHED"]
                .iter()
                .map(|l| CircuitEvent::parse(l).unwrap()),
        );
        let ids: Vec<String> = tracker.circuits().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, ["9", "10", "100"]);
    }
}
