//! Per-process stats collector (base spec §4.2): an ordered table of
//! counters/gauges/events, each updated lock-free on a global aggregate
//! plus a per-thread partition, publishable to SHM and diffable by
//! out-of-process viewers.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    /// Cumulative add, diffed by subtraction.
    Counter,
    /// Cumulative add plus an accumulated duration, diffed by subtraction.
    CounterWithTime,
    /// Test-and-set; diffed by taking the newer value.
    Gauge,
    /// Cumulative add; diffed by taking the newer value, never subtracted.
    Event,
}

struct Slot {
    name: &'static str,
    level: u32,
    kind: StatKind,
    global: AtomicU64,
    global_time_nanos: AtomicU64,
    per_thread: DashMap<ThreadId, AtomicU64>,
}

/// A read-only point-in-time copy of one slot, suitable for diffing and
/// formatting without holding the collector's internals.
#[derive(Debug, Clone)]
pub struct StatSnapshot {
    pub name: &'static str,
    pub level: u32,
    pub kind: StatKind,
    pub value: u64,
    pub time_nanos: u64,
}

/// The ordered declaration table plus live atomic slots for one process.
///
/// Declaration order is fixed at construction, the way the base spec
/// describes stats as "an ordered array of (name, level, value-type)"
/// indexed positionally by the rest of the codebase.
pub struct StatsCollector {
    slots: Vec<Slot>,
}

impl StatsCollector {
    pub fn new() -> Self {
        StatsCollector { slots: Vec::new() }
    }

    /// Declares a new stat slot, returning its index for future
    /// `add`/`add_timed`/`set` calls.
    pub fn declare(&mut self, name: &'static str, level: u32, kind: StatKind) -> usize {
        self.slots.push(Slot {
            name,
            level,
            kind,
            global: AtomicU64::new(0),
            global_time_nanos: AtomicU64::new(0),
            per_thread: DashMap::new(),
        });
        self.slots.len() - 1
    }

    fn slot(&self, index: usize) -> Option<&Slot> {
        let slot = self.slots.get(index);
        debug_assert!(slot.is_some(), "stat index {index} out of range");
        slot
    }

    /// Adds `delta` to a counter or event slot. Bounds/type errors abort in
    /// debug builds and are silently dropped in release, matching the base
    /// spec's "out-of-range index or wrong value-type aborts in debug,
    /// silently drops in release".
    pub fn add(&self, index: usize, delta: u64) {
        let Some(slot) = self.slot(index) else { return };
        debug_assert!(matches!(slot.kind, StatKind::Counter | StatKind::Event));
        if !matches!(slot.kind, StatKind::Counter | StatKind::Event) {
            return;
        }
        slot.global.fetch_add(delta, Ordering::Relaxed);
        slot.per_thread
            .entry(std::thread::current().id())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Adds `delta` plus an elapsed duration to a counter-with-time slot.
    pub fn add_timed(&self, index: usize, delta: u64, elapsed: Duration) {
        let Some(slot) = self.slot(index) else { return };
        debug_assert_eq!(slot.kind, StatKind::CounterWithTime);
        if slot.kind != StatKind::CounterWithTime {
            return;
        }
        slot.global.fetch_add(delta, Ordering::Relaxed);
        slot.global_time_nanos.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        slot.per_thread
            .entry(std::thread::current().id())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Test-and-set for a gauge slot.
    pub fn set(&self, index: usize, value: u64) {
        let Some(slot) = self.slot(index) else { return };
        debug_assert_eq!(slot.kind, StatKind::Gauge);
        if slot.kind != StatKind::Gauge {
            return;
        }
        slot.global.store(value, Ordering::Relaxed);
        slot.per_thread
            .entry(std::thread::current().id())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Vec<StatSnapshot> {
        self.slots
            .iter()
            .map(|s| StatSnapshot {
                name: s.name,
                level: s.level,
                kind: s.kind,
                value: s.global.load(Ordering::Relaxed),
                time_nanos: s.global_time_nanos.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Per-thread breakdown for one slot, for debugging contention.
    pub fn per_thread_breakdown(&self, index: usize) -> Vec<(ThreadId, u64)> {
        match self.slot(index) {
            Some(slot) => slot.per_thread.iter().map(|e| (*e.key(), e.value().load(Ordering::Relaxed))).collect(),
            None => Vec::new(),
        }
    }

    /// Formats all slots whose name contains `filter`, indented by level.
    pub fn format_filtered(&self, filter: &str) -> String {
        let mut out = String::new();
        for slot in &self.slots {
            if !slot.name.contains(filter) {
                continue;
            }
            let indent = "  ".repeat(slot.level as usize);
            let value = slot.global.load(Ordering::Relaxed);
            match slot.kind {
                StatKind::CounterWithTime => {
                    let nanos = slot.global_time_nanos.load(Ordering::Relaxed);
                    out.push_str(&format!("{indent}{} = {value} ({}us)\n", slot.name, nanos / 1000));
                }
                _ => out.push_str(&format!("{indent}{} = {value}\n", slot.name)),
            }
        }
        out
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Diffs two snapshots taken from the same collector at different times,
/// per-slot using the type's rule: cumulative kinds subtract, gauge/event
/// report the newer value verbatim.
pub fn diff_snapshots(old: &[StatSnapshot], new: &[StatSnapshot]) -> Vec<(String, u64)> {
    old.iter()
        .zip(new.iter())
        .map(|(o, n)| {
            let v = match n.kind {
                StatKind::Counter | StatKind::CounterWithTime => n.value.saturating_sub(o.value),
                StatKind::Gauge | StatKind::Event => n.value,
            };
            (n.name.to_string(), v)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates_globally_and_per_thread() {
        let mut collector = StatsCollector::new();
        let idx = collector.declare("test_counter", 0, StatKind::Counter);
        collector.add(idx, 3);
        collector.add(idx, 4);
        assert_eq!(collector.snapshot()[0].value, 7);
        let breakdown = collector.per_thread_breakdown(idx);
        assert_eq!(breakdown.len(), 1);
        assert_eq!(breakdown[0].1, 7);
    }

    #[test]
    fn gauge_is_test_and_set_not_cumulative() {
        let mut collector = StatsCollector::new();
        let idx = collector.declare("test_gauge", 0, StatKind::Gauge);
        collector.set(idx, 10);
        collector.set(idx, 3);
        assert_eq!(collector.snapshot()[0].value, 3);
    }

    #[test]
    fn diff_subtracts_counters_but_not_gauges() {
        let mut collector = StatsCollector::new();
        let counter = collector.declare("c", 0, StatKind::Counter);
        let gauge = collector.declare("g", 0, StatKind::Gauge);

        collector.add(counter, 5);
        collector.set(gauge, 9);
        let snap1 = collector.snapshot();

        collector.add(counter, 5);
        collector.set(gauge, 2);
        let snap2 = collector.snapshot();

        let diff = diff_snapshots(&snap1, &snap2);
        assert_eq!(diff[0].1, 5, "counter diff is a subtraction");
        assert_eq!(diff[1].1, 2, "gauge diff reports the newer value");
    }

    #[test]
    fn format_filtered_indents_by_level() {
        let mut collector = StatsCollector::new();
        collector.declare("page_locks_acquired", 1, StatKind::Counter);
        collector.declare("csect_waits", 2, StatKind::Counter);
        let out = collector.format_filtered("page");
        assert!(out.contains("  page_locks_acquired = 0"));
        assert!(!out.contains("csect_waits"));
    }
}
