//! Integration tests for iface-router
//!
//! # Test Organization
//!
//! - `rule_matching`: ordering and hot reload under concurrent readers
//! - `flow_lifecycle`: relaying through the flow manager with a real dialer
//! - `rule_import`: rule store files and configuration-supplied rules
//!
//! # Test Requirements
//!
//! Everything runs on loopback without privileges. Interfaces come from a
//! static provider, so no test binds to a real device.

pub mod flow_lifecycle;
pub mod rule_import;
pub mod rule_matching;
