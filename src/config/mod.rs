//! Configuration module for iface-router
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use iface_router::config::load_config;
//!
//! let config = load_config("/etc/iface-router/config.json").unwrap();
//! println!("Listening on {}", config.listen.address);
//! ```

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, create_default_config, load_config, load_config_str,
    load_config_with_env, ENV_PREFIX,
};
pub use types::{
    Config, FlowConfig, InterfacesConfig, IpcConfig, ListenConfig, LogConfig, OutboundConfig,
    RulesConfig, UdpMatchPolicy,
};
