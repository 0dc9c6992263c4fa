//! Config file schema
//!
//! Every field has a serde default, so `{}` is a complete configuration.
//! Each section checks its own values in `validate()`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::outbound::INTERFACE_MAX_LEN;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub interfaces: InterfacesConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub outbound: OutboundConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Checks every section, stopping at the first problem.
    ///
    /// # Errors
    ///
    /// `ConfigError::ValidationError` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen.validate()?;
        self.rules.validate()?;
        self.interfaces.validate()?;
        self.flow.validate()?;
        self.outbound.validate()?;
        self.ipc.validate()?;
        self.log.validate()
    }

    #[must_use]
    pub fn default_config() -> Self {
        Self::default()
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(msg.into())
}

/// Rejects zero for a field that counts or times something
fn nonzero<T: Default + PartialEq>(field: &str, value: T) -> Result<(), ConfigError> {
    if value == T::default() {
        return Err(invalid(format!("{field} may not be 0")));
    }
    Ok(())
}

/// Where intercepted traffic is accepted
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Target of the firewall's TPROXY rule
    #[serde(default = "default_listen_addr")]
    pub address: SocketAddr,

    #[serde(default = "default_true")]
    pub tcp_enabled: bool,

    #[serde(default = "default_true")]
    pub udp_enabled: bool,

    #[serde(default = "default_backlog")]
    pub tcp_backlog: u32,

    /// Sets `SO_REUSEPORT` on both listeners
    #[serde(default)]
    pub reuse_port: bool,
}

impl ListenConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.tcp_enabled || self.udp_enabled) {
            return Err(invalid("listen: enable tcp, udp or both"));
        }
        nonzero("listen.tcp_backlog", self.tcp_backlog)
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_addr(),
            tcp_enabled: default_true(),
            udp_enabled: default_true(),
            tcp_backlog: default_backlog(),
            reuse_port: false,
        }
    }
}

/// Where rules come from at startup
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RulesConfig {
    /// Editable rule list, saved as a JSON array of rule records
    #[serde(default)]
    pub store_path: Option<PathBuf>,

    /// Records used when `store_path` is unset. They are checked one by
    /// one at load time, so only their shape is checked here.
    #[serde(default)]
    pub inline: Vec<serde_json::Value>,
}

impl RulesConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self
            .store_path
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            return Err(invalid("rules.store_path is set but empty"));
        }
        match self.inline.iter().position(|v| !v.is_object()) {
            Some(index) => Err(invalid(format!("rules.inline[{index}] must be an object"))),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterfacesConfig {
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Used when a rule's interface is down; `None` leaves the flow on the
    /// system route
    #[serde(default)]
    pub default_interface: Option<String>,

    #[serde(default)]
    pub include_loopback: bool,

    /// Usually `/sys/class/net`; tests point it at a temp dir
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
}

impl InterfacesConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        nonzero("interfaces.refresh_interval_secs", self.refresh_interval_secs)?;
        match &self.default_interface {
            Some(name) => validate_interface_name(name),
            None => Ok(()),
        }
    }

    #[must_use]
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

impl Default for InterfacesConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            default_interface: None,
            include_loopback: false,
            sysfs_root: default_sysfs_root(),
        }
    }
}

/// How UDP associations pick their interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UdpMatchPolicy {
    /// First datagram decides for the whole association
    #[default]
    PerAssociation,
    /// Each datagram is matched on its own destination
    PerDatagram,
}

/// Admission limit, timeouts and relay sizing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlowConfig {
    #[serde(default = "default_max_flows")]
    pub max_flows: usize,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// How long a cancelled relay may spend shutting down its writers
    #[serde(default = "default_cancel_deadline_ms")]
    pub cancel_deadline_ms: u64,

    /// How long shutdown waits for live flows before giving up on them
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Bytes per relay direction
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default)]
    pub udp_policy: UdpMatchPolicy,

    #[serde(default = "default_udp_idle_timeout_secs")]
    pub udp_idle_timeout_secs: u64,

    /// Replies queued per UDP association before new ones are dropped
    #[serde(default = "default_udp_channel_capacity")]
    pub udp_channel_capacity: usize,
}

impl FlowConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        nonzero("flow.max_flows", self.max_flows)?;
        nonzero("flow.connect_timeout_secs", self.connect_timeout_secs)?;
        nonzero("flow.udp_idle_timeout_secs", self.udp_idle_timeout_secs)?;
        nonzero("flow.udp_channel_capacity", self.udp_channel_capacity)?;

        let allowed = crate::io::MIN_BUFFER_SIZE..=crate::io::MAX_BUFFER_SIZE;
        if !allowed.contains(&self.buffer_size) {
            return Err(invalid(format!(
                "flow.buffer_size {} outside {}..={}",
                self.buffer_size,
                allowed.start(),
                allowed.end()
            )));
        }
        Ok(())
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub const fn cancel_deadline(&self) -> Duration {
        Duration::from_millis(self.cancel_deadline_ms)
    }

    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    #[must_use]
    pub const fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_flows: default_max_flows(),
            connect_timeout_secs: default_connect_timeout_secs(),
            cancel_deadline_ms: default_cancel_deadline_ms(),
            drain_timeout_secs: default_drain_timeout_secs(),
            buffer_size: default_buffer_size(),
            udp_policy: UdpMatchPolicy::default(),
            udp_idle_timeout_secs: default_udp_idle_timeout_secs(),
            udp_channel_capacity: default_udp_channel_capacity(),
        }
    }
}

/// Options applied to every upstream socket
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutboundConfig {
    /// `SO_MARK` value. The firewall must skip marked packets or they loop
    /// back into the proxy.
    #[serde(default)]
    pub routing_mark: Option<u32>,

    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,

    #[serde(default = "default_keepalive_time_secs")]
    pub keepalive_time_secs: u64,

    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// On a failed interface bind, try once more without one
    #[serde(default = "default_true")]
    pub retry_unbound: bool,
}

impl OutboundConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        nonzero("outbound.keepalive_time_secs", self.keepalive_time_secs)?;
        nonzero("outbound.keepalive_interval_secs", self.keepalive_interval_secs)
    }

    #[must_use]
    pub const fn keepalive_time(&self) -> Duration {
        Duration::from_secs(self.keepalive_time_secs)
    }

    #[must_use]
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            routing_mark: None,
            tcp_nodelay: default_true(),
            keepalive_time_secs: default_keepalive_time_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            retry_unbound: default_true(),
        }
    }
}

/// Control socket
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpcConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Permission bits applied after bind
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Largest accepted frame body
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl IpcConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.socket_path.as_os_str().is_empty() {
            return Err(invalid("ipc.socket_path is required while ipc is enabled"));
        }
        nonzero("ipc.max_message_size", self.max_message_size)
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            socket_mode: default_socket_mode(),
            enabled: default_true(),
            max_message_size: default_max_message_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Print the module path of each record
    #[serde(default = "default_true")]
    pub target: bool,

    /// Lowest level copied onto the event bus
    #[serde(default = "default_event_level")]
    pub event_level: String,
}

impl LogConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("level", &self.level), ("event_level", &self.event_level)] {
            if parse_level(value).is_none() {
                return Err(invalid(format!("log.{field}: unknown level {value:?}")));
            }
        }
        match self.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(invalid(format!("log.format: expected text or json, got {other:?}"))),
        }
    }

    /// `level` parsed, falling back to INFO
    #[must_use]
    pub fn tracing_level(&self) -> tracing::Level {
        parse_level(&self.level).unwrap_or(tracing::Level::INFO)
    }

    /// `event_level` parsed, falling back to INFO
    #[must_use]
    pub fn event_tracing_level(&self) -> tracing::Level {
        parse_level(&self.event_level).unwrap_or(tracing::Level::INFO)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: default_true(),
            event_level: default_event_level(),
        }
    }
}

fn parse_level(value: &str) -> Option<tracing::Level> {
    match value.to_ascii_lowercase().as_str() {
        "warning" => Some(tracing::Level::WARN),
        other => other.parse().ok(),
    }
}

fn validate_interface_name(name: &str) -> Result<(), ConfigError> {
    if (1..=INTERFACE_MAX_LEN).contains(&name.len()) {
        Ok(())
    } else {
        Err(invalid(format!(
            "interfaces.default_interface {name:?} must be 1 to {INTERFACE_MAX_LEN} bytes"
        )))
    }
}

const fn default_true() -> bool {
    true
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7893))
}

const fn default_backlog() -> u32 {
    1024
}

const fn default_refresh_interval_secs() -> u64 {
    5
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys/class/net")
}

const fn default_max_flows() -> usize {
    4096
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

const fn default_cancel_deadline_ms() -> u64 {
    2000
}

const fn default_drain_timeout_secs() -> u64 {
    10
}

const fn default_buffer_size() -> usize {
    64 * 1024
}

const fn default_udp_idle_timeout_secs() -> u64 {
    60
}

const fn default_udp_channel_capacity() -> usize {
    256
}

const fn default_keepalive_time_secs() -> u64 {
    60
}

const fn default_keepalive_interval_secs() -> u64 {
    10
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/iface-router.sock")
}

const fn default_socket_mode() -> u32 {
    0o660
}

const fn default_max_message_size() -> usize {
    1024 * 1024
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_event_level() -> String {
    "warn".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = Config::default_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_listen_needs_a_protocol() {
        let config = ListenConfig {
            tcp_enabled: false,
            udp_enabled: false,
            ..ListenConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(ListenConfig {
            tcp_enabled: false,
            ..ListenConfig::default()
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn test_flow_limits() {
        let zero = FlowConfig {
            max_flows: 0,
            ..FlowConfig::default()
        };
        match zero.validate() {
            Err(ConfigError::ValidationError(msg)) => assert!(msg.contains("flow.max_flows")),
            other => panic!("unexpected: {other:?}"),
        }

        let config = FlowConfig {
            buffer_size: 16,
            ..FlowConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_interface_name_length() {
        let mut config = InterfacesConfig::default();
        config.default_interface = Some("en0".into());
        assert!(config.validate().is_ok());

        config.default_interface = Some("a-very-long-interface-name".into());
        assert!(config.validate().is_err());

        config.default_interface = Some(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inline_rules_must_be_objects() {
        let rules = RulesConfig {
            store_path: None,
            inline: vec![serde_json::json!({"pattern": "x"}), serde_json::json!(3)],
        };
        assert!(rules.validate().is_err());
    }

    #[test]
    fn test_log_config_validation() {
        let mut log = LogConfig::default();
        assert!(log.validate().is_ok());
        assert_eq!(log.event_tracing_level(), tracing::Level::WARN);

        log.format = "yaml".into();
        assert!(log.validate().is_err());

        log.format = "json".into();
        log.level = "loud".into();
        assert!(log.validate().is_err());
        assert_eq!(log.tracing_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_udp_policy_serialization() {
        let json = r#"{ "udp_policy": "per_datagram" }"#;
        let flow: FlowConfig = serde_json::from_str(json).unwrap();
        assert_eq!(flow.udp_policy, UdpMatchPolicy::PerDatagram);
        assert_eq!(flow.max_flows, 4096);

        let flow: FlowConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(flow.udp_policy, UdpMatchPolicy::PerAssociation);
    }

    #[test]
    fn test_levels_parse_case_insensitively() {
        assert_eq!(parse_level("DEBUG"), Some(tracing::Level::DEBUG));
        assert_eq!(parse_level("Warning"), Some(tracing::Level::WARN));
        assert_eq!(parse_level("verbose"), None);
    }

    #[test]
    fn test_empty_object_is_complete_config() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.validate().is_ok());
        assert!(config.rules.store_path.is_none());
        assert_eq!(config.outbound.keepalive_time(), Duration::from_secs(60));
    }
}
