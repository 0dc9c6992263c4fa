//! Flow statistics tracking
//!
//! This module provides statistics collection for flow management.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::types::{FlowOutcome, FlowStatus};
use crate::events::now_ms;

/// Atomic flow statistics
#[derive(Debug, Default)]
pub struct FlowStats {
    /// Total flows admitted
    total_accepted: AtomicU64,
    /// Currently active flows
    active: AtomicU64,
    /// Flows that finished normally
    completed: AtomicU64,
    /// Flows that failed
    errored: AtomicU64,
    /// Flows ended by cancellation
    cancelled: AtomicU64,
    /// Flows rejected due to limit or shutdown
    rejected: AtomicU64,
    /// Flows that could not use their matched interface
    fallbacks: AtomicU64,
    /// Total bytes client -> upstream
    bytes_up: AtomicU64,
    /// Total bytes upstream -> client
    bytes_down: AtomicU64,
}

impl FlowStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly admitted flow
    pub fn record_accepted(&self) {
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a flow's outcome
    pub fn record_outcome(&self, outcome: &FlowOutcome) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        let counter = match outcome.status {
            FlowStatus::Completed => &self.completed,
            FlowStatus::Cancelled => &self.cancelled,
            FlowStatus::Failed(_) => &self.errored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if outcome.fallback {
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_up.fetch_add(outcome.bytes_up, Ordering::Relaxed);
        self.bytes_down.fetch_add(outcome.bytes_down, Ordering::Relaxed);
    }

    /// Record a rejected flow
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn errored(&self) -> u64 {
        self.errored.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all statistics
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_accepted: self.total_accepted(),
            active: self.active(),
            completed: self.completed(),
            errored: self.errored(),
            cancelled: self.cancelled(),
            rejected: self.rejected(),
            fallbacks: self.fallbacks(),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            timestamp_ms: now_ms(),
        }
    }
}

/// Snapshot of flow statistics at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_accepted: u64,
    pub active: u64,
    pub completed: u64,
    pub errored: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub fallbacks: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    /// Timestamp in milliseconds
    pub timestamp_ms: u64,
}

impl StatsSnapshot {
    /// Get total bytes transferred (both directions)
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.bytes_up + self.bytes_down
    }

    /// Share of finished flows that did not fail, as a percentage (0-100)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let total = self.completed + self.cancelled + self.errored;
        if total == 0 {
            100.0
        } else {
            ((self.completed + self.cancelled) as f64 / total as f64) * 100.0
        }
    }
}
