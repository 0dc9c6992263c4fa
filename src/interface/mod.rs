//! Local network interface discovery
//!
//! [`InterfaceRegistry`] keeps an atomically swapped list of interfaces,
//! refreshed from an [`InterfaceProvider`]. Flow handlers consult it to
//! decide whether a rule's target interface is usable.

pub mod provider;
pub mod registry;
pub mod types;

pub use provider::{InterfaceProvider, StaticInterfaceProvider, SysfsInterfaceProvider};
pub use registry::InterfaceRegistry;
pub use types::{InterfaceKind, NetworkInterface};
