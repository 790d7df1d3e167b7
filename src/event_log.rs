//! Structured operational event log (base spec §7, "structured event log
//! with severity NOTIFICATION/ERROR for state transitions, archive
//! creations, changemode denials, and deactivation results").
//!
//! Every event is mirrored to `tracing` so operators filtering by
//! `target: "rye::event_log"` get the same trail independent of whether
//! they're reading structured logs or polling [`EventLog::recent`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_CAPACITY: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Notification,
    Error,
    Alert,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub unix_millis: u128,
    pub severity: Severity,
    pub component: String,
    pub message: String,
}

/// A bounded, thread-safe ring of recent operational events.
pub struct EventLog {
    capacity: usize,
    ring: Mutex<VecDeque<EventRecord>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { capacity, ring: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    pub fn record(&self, severity: Severity, component: &str, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Notification => {
                tracing::info!(target: "rye::event_log", component, "{}", message)
            }
            Severity::Error => {
                tracing::error!(target: "rye::event_log", component, "{}", message)
            }
            Severity::Alert => {
                tracing::error!(target: "rye::event_log", component, alert = true, "{}", message)
            }
        }

        let record = EventRecord {
            unix_millis: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis(),
            severity,
            component: component.to_string(),
            message,
        };

        let mut ring = self.ring.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    pub fn notification(&self, component: &str, message: impl Into<String>) {
        self.record(Severity::Notification, component, message);
    }

    pub fn error(&self, component: &str, message: impl Into<String>) {
        self.record(Severity::Error, component, message);
    }

    pub fn alert(&self, component: &str, message: impl Into<String>) {
        self.record(Severity::Alert, component, message);
    }

    /// Returns up to `limit` of the most recently recorded events, oldest
    /// first.
    pub fn recent(&self, limit: usize) -> Vec<EventRecord> {
        let ring = self.ring.lock();
        ring.iter().rev().take(limit).rev().cloned().collect()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let log = EventLog::with_capacity(2);
        log.notification("test", "one");
        log.notification("test", "two");
        log.notification("test", "three");
        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "two");
        assert_eq!(recent[1].message, "three");
    }
}
