//! Runtime counters
//!
//! The server bumps a handful of gauges around registration. Updates are
//! fire-and-forget: a missing metric is logged, never an error.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use tracing::warn;

pub const NUM_ACTIVE_ROOMS: &str = "NumActiveRooms";
pub const NUM_ACTIVE_CLIENTS: &str = "NumActiveClients";
pub const TOTAL_INCOMING_MESSAGES: &str = "TotalIncomingMessages";
pub const TOTAL_OUTGOING_MESSAGES: &str = "TotalOutgoingMessages";

/// Metrics sink used by the chat server
pub trait StatsProvider: Send + Sync {
    fn register_metric(&self, name: &str);
    fn incr(&self, name: &str);
    fn decr(&self, name: &str);
}

/// In-process counter table
#[derive(Debug, Default)]
pub struct Stats {
    counters: Mutex<BTreeMap<String, i64>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a registered metric
    pub fn get(&self, name: &str) -> Option<i64> {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    /// All metrics, sorted by name
    pub fn snapshot(&self) -> Vec<(String, i64)> {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, value)| (name.clone(), *value))
            .collect()
    }

    fn add(&self, name: &str, delta: i64) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        match counters.get_mut(name) {
            Some(value) => *value += delta,
            None => warn!("metric {} not registered", name),
        }
    }
}

impl StatsProvider for Stats {
    fn register_metric(&self, name: &str) {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert(0);
    }

    fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    fn decr(&self, name: &str) {
        self.add(name, -1);
    }
}
