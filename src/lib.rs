//! Transparent proxy that picks the egress interface per flow.
//!
//! Redirected TCP connections and UDP associations are matched against an
//! ordered rule list (CIDR or hostname, first match wins) and dialed out
//! through the chosen local interface with `SO_BINDTODEVICE`. An interface
//! that is down makes the flow fall back to the default route.
//!
//! ```text
//! client ──TPROXY──▶ tproxy ──▶ FlowManager ──▶ DirectDialer(eth1) ──▶ server
//!                                  │
//!                         RuleSet + InterfaceRegistry
//! ```
//!
//! [`rules`] and [`interface`] hold the routing state, [`flow`] owns each
//! flow from admission to its single completion report, and [`ipc`] lets a
//! controller swap rules and read statistics over a Unix socket. Wiring it
//! together by hand:
//!
//! ```no_run
//! use std::sync::Arc;
//! use iface_router::config::load_config;
//! use iface_router::events::EventBus;
//! use iface_router::flow::{FlowContext, FlowManager, FlowSettings};
//! use iface_router::interface::{InterfaceRegistry, SysfsInterfaceProvider};
//! use iface_router::outbound::DirectDialer;
//! use iface_router::rules::RuleSet;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/iface-router/config.json")?;
//! let events = EventBus::default();
//!
//! let rules = Arc::new(RuleSet::with_event_bus(events.clone()));
//! let interfaces = Arc::new(InterfaceRegistry::new(
//!     Arc::new(SysfsInterfaceProvider::new()),
//!     events.clone(),
//! ));
//! let dialer = Arc::new(DirectDialer::new(config.outbound.clone()));
//! let ctx = Arc::new(FlowContext::new(
//!     rules,
//!     interfaces,
//!     dialer,
//!     events,
//!     FlowSettings::from_config(&config),
//! ));
//! let manager = FlowManager::new(ctx, &config.flow);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod events;
pub mod flow;
pub mod interface;
pub mod io;
pub mod ipc;
pub mod outbound;
pub mod rules;
#[cfg(target_os = "linux")]
pub mod tproxy;

pub use config::Config;
pub use error::{
    ConfigError, FlowError, InterfaceError, IpcError, OutboundError, RouterError, RuleError,
    TproxyError,
};
pub use events::{EventBus, RouterEvent};
pub use flow::{FlowHandler, FlowManager, FlowMeta, FlowOutcome, FlowState, FlowStatus};
pub use rules::{Rule, RuleKind, RuleSet, RuleStore};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
