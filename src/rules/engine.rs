//! Lock-free rule matching with atomic snapshot replacement
//!
//! The active rule list lives in an immutable [`RuleSnapshot`] held by an
//! `ArcSwap`. Matching loads the current snapshot without locking and keeps
//! it alive for the whole call, so a reader sees either the old list or the
//! new one, never a mix. Publishing builds a complete snapshot first and
//! swaps it in with a single store.
//!
//! # Example
//!
//! ```
//! use iface_router::rules::{RuleSet, RuleRecord, RuleKind};
//!
//! let rules = RuleSet::new();
//! let report = rules.load_records(vec![
//!     RuleRecord {
//!         rule_id: "lan".into(),
//!         kind: RuleKind::Cidr,
//!         pattern: "10.0.0.0/8".into(),
//!         interface_name: "eth0".into(),
//!         enabled: true,
//!         comment: None,
//!         priority: 1,
//!     },
//! ]);
//! assert_eq!(report.loaded, 1);
//!
//! let hit = rules.match_destination(Some("10.1.2.3".parse().unwrap()), None).unwrap();
//! assert_eq!(hit.interface_name, "eth0");
//! ```

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::RuleError;
use crate::events::{ChangeKind, EventBus, RouterEvent};
use crate::rules::source::RuleSource;
use crate::rules::types::{Rule, RuleMatch, RuleRecord};

/// Immutable, ordered, validated rule list
#[derive(Debug, Clone, Default)]
pub struct RuleSnapshot {
    rules: Vec<Rule>,
    version: u64,
}

impl RuleSnapshot {
    /// Build a snapshot from already-validated rules.
    ///
    /// Rules are stable-sorted by priority; equal priorities keep their
    /// relative order.
    #[must_use]
    pub fn new(mut rules: Vec<Rule>, version: u64) -> Self {
        rules.sort_by_key(Rule::priority);
        Self { rules, version }
    }

    /// Rules in evaluation order
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First enabled rule matching any present facet
    #[must_use]
    pub fn match_destination(&self, ip: Option<IpAddr>, hostname: Option<&str>) -> Option<&Rule> {
        self.rules.iter().find(|r| r.matches(ip, hostname))
    }
}

/// Outcome of a bulk load
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// Rules published
    pub loaded: usize,
    /// Records skipped, with reasons
    pub dropped: Vec<DroppedRecord>,
    /// Version of the published snapshot
    pub version: u64,
}

/// A record rejected during load
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedRecord {
    /// Position in the input
    pub index: usize,
    /// Id, when the record had one
    pub rule_id: Option<String>,
    pub reason: String,
}

/// The matching engine
///
/// Readers never block; writers are serialized among themselves so the
/// version counter stays monotonic.
pub struct RuleSet {
    snapshot: ArcSwap<RuleSnapshot>,
    publish_lock: Mutex<u64>,
    events: EventBus,
}

impl RuleSet {
    /// Create an empty rule set with its own event bus
    #[must_use]
    pub fn new() -> Self {
        Self::with_event_bus(EventBus::default())
    }

    /// Create an empty rule set publishing changes on `events`
    #[must_use]
    pub fn with_event_bus(events: EventBus) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RuleSnapshot::default()),
            publish_lock: Mutex::new(0),
            events,
        }
    }

    /// Current snapshot (lock-free). Hold the guard to run several matches
    /// against one consistent list.
    pub fn snapshot(&self) -> Guard<Arc<RuleSnapshot>> {
        self.snapshot.load()
    }

    /// Version of the active snapshot
    #[must_use]
    pub fn version(&self) -> u64 {
        self.snapshot.load().version
    }

    /// Number of active rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    /// Subscribe to snapshot replacement (and other) events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    /// The bus this set publishes on
    #[must_use]
    pub const fn event_bus(&self) -> &EventBus {
        &self.events
    }

    /// Load all records from `source` and publish them.
    ///
    /// # Errors
    ///
    /// Returns the source's error if it cannot be read at all; the active
    /// snapshot is left untouched in that case.
    pub fn load(&self, source: &dyn RuleSource) -> Result<LoadReport, RuleError> {
        let records = source.fetch().map_err(|e| {
            warn!(source = %source.describe(), error = %e, "Rule source unavailable, keeping current rules");
            e
        })?;
        info!(source = %source.describe(), records = records.len(), "Loading rules");
        Ok(self.load_values(records))
    }

    /// Decode, validate and publish raw JSON records.
    ///
    /// Records that fail to decode or validate are dropped with a warning.
    pub fn load_values(&self, values: Vec<Value>) -> LoadReport {
        let mut dropped = Vec::new();
        let mut records = Vec::with_capacity(values.len());
        for (index, value) in values.into_iter().enumerate() {
            let rule_id = value
                .get("ruleId")
                .and_then(Value::as_str)
                .map(str::to_string);
            match serde_json::from_value::<RuleRecord>(value) {
                Ok(record) => records.push((index, record)),
                Err(e) => dropped.push(DroppedRecord {
                    index,
                    rule_id,
                    reason: e.to_string(),
                }),
            }
        }
        self.validate_and_publish(records, dropped)
    }

    /// Validate and publish decoded records (in-memory source).
    pub fn load_records(&self, records: Vec<RuleRecord>) -> LoadReport {
        self.validate_and_publish(records.into_iter().enumerate().collect(), Vec::new())
    }

    fn validate_and_publish(
        &self,
        records: Vec<(usize, RuleRecord)>,
        mut dropped: Vec<DroppedRecord>,
    ) -> LoadReport {
        let mut seen = HashSet::with_capacity(records.len());
        let mut rules = Vec::with_capacity(records.len());

        for (index, record) in records {
            let rule_id = record.rule_id.clone();
            if seen.contains(&rule_id) {
                dropped.push(DroppedRecord {
                    index,
                    rule_id: Some(rule_id.clone()),
                    reason: RuleError::DuplicateId(rule_id).to_string(),
                });
                continue;
            }
            match Rule::try_from(record) {
                Ok(rule) => {
                    seen.insert(rule_id);
                    rules.push(rule);
                }
                Err(e) => dropped.push(DroppedRecord {
                    index,
                    rule_id: Some(rule_id),
                    reason: e.to_string(),
                }),
            }
        }

        dropped.sort_by_key(|d| d.index);
        for d in &dropped {
            warn!(
                index = d.index,
                rule_id = d.rule_id.as_deref().unwrap_or("-"),
                reason = %d.reason,
                "Dropping invalid rule record"
            );
        }

        let loaded = rules.len();
        let version = self.publish(rules, ChangeKind::Reload);
        LoadReport {
            loaded,
            dropped,
            version,
        }
    }

    /// Publish already-validated rules as the new snapshot.
    ///
    /// Returns the new version.
    pub fn publish(&self, rules: Vec<Rule>, kind: ChangeKind) -> u64 {
        let mut last_version = self.publish_lock.lock();
        *last_version += 1;
        let version = *last_version;

        let snapshot = RuleSnapshot::new(rules, version);
        let rule_count = snapshot.len();
        self.snapshot.store(Arc::new(snapshot));
        drop(last_version);

        debug!(version, rule_count, ?kind, "Published rule snapshot");
        self.events.publish(RouterEvent::RuleSetChanged {
            kind,
            version,
            rule_count,
        });
        version
    }

    /// First-match-wins lookup over both facets.
    ///
    /// `None` means no enabled rule matched and the caller should use
    /// default routing.
    #[must_use]
    pub fn match_destination(&self, ip: Option<IpAddr>, hostname: Option<&str>) -> Option<RuleMatch> {
        self.snapshot
            .load()
            .match_destination(ip, hostname)
            .map(RuleMatch::from_rule)
    }

    /// IP-only lookup (CIDR rules)
    #[must_use]
    pub fn match_cidr(&self, ip: IpAddr) -> Option<RuleMatch> {
        self.match_destination(Some(ip), None)
    }

    /// Hostname-only lookup (Host rules)
    #[must_use]
    pub fn match_host(&self, hostname: &str) -> Option<RuleMatch> {
        self.match_destination(None, Some(hostname))
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot.load();
        f.debug_struct("RuleSet")
            .field("version", &snapshot.version)
            .field("rules", &snapshot.len())
            .finish_non_exhaustive()
    }
}
