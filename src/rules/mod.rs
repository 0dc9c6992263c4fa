//! Rule model and matching engine
//!
//! This module provides:
//! - Address and CIDR arithmetic ([`address`])
//! - Host pattern matching ([`host`])
//! - Rule and interchange record types ([`types`])
//! - The lock-free matching engine ([`engine`])
//! - Rule sources and the editable store ([`source`], [`store`])
//!
//! # Architecture
//!
//! Rules are evaluated in priority order (lower values first, ties in
//! insertion order). The first enabled rule whose pattern matches the
//! destination selects the interface. No match means default routing.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use iface_router::rules::{Rule, RuleKind, RuleSet, RuleStore};
//!
//! let engine = Arc::new(RuleSet::new());
//! let store = RuleStore::new(Arc::clone(&engine), None);
//! store.add(Rule::new(RuleKind::Host, "*.example.com", "wlan0").unwrap()).unwrap();
//!
//! let hit = engine.match_host("www.example.com").unwrap();
//! assert_eq!(hit.interface(), Some("wlan0"));
//! ```

pub mod address;
pub mod engine;
pub mod host;
pub mod source;
pub mod store;
pub mod types;

pub use address::Cidr;
pub use engine::{DroppedRecord, LoadReport, RuleSet, RuleSnapshot};
pub use host::HostPattern;
pub use source::{InlineSource, JsonFileSource, RuleSource};
pub use store::RuleStore;
pub use types::{Rule, RuleKind, RuleMatch, RuleRecord};
