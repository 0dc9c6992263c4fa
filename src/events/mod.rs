//! Observability events
//!
//! [`EventBus`] is a cheap-to-clone publish/subscribe handle backed by a
//! `tokio::sync::broadcast` channel. The rule set, the interface registry,
//! the flow handlers and the daemon lifecycle publish into it; UIs, control
//! clients and tests subscribe. Nothing here is required for correctness:
//! publishing with no subscribers is a no-op and slow subscribers lag
//! instead of blocking publishers.
//!
//! [`EventLayer`] bridges `tracing` records into the bus as [`LogRecord`]s.

mod layer;

use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::broadcast;

pub use layer::EventLayer;

/// Default channel capacity for an [`EventBus`]
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Kind of change that produced a new rule snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A rule was appended or inserted
    Add,
    /// A rule was removed
    Remove,
    /// A rule was replaced in place
    Update,
    /// A rule changed position
    Move,
    /// The whole set was replaced
    Reload,
}

/// Proxy lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    /// Not running
    #[default]
    Stopped,
    /// Listeners are being set up
    Starting,
    /// Accepting flows
    Running,
    /// Draining flows
    Stopping,
    /// Failed to start or crashed
    Error,
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Log severity carried by [`LogRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Map a `tracing` level; TRACE folds into Debug
    #[must_use]
    pub fn from_tracing(level: tracing::Level) -> Self {
        match level {
            tracing::Level::ERROR => Self::Error,
            tracing::Level::WARN => Self::Warning,
            tracing::Level::INFO => Self::Info,
            _ => Self::Debug,
        }
    }
}

/// A leveled, timestamped log message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    pub level: LogLevel,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    pub message: String,
}

impl LogRecord {
    /// Create a record stamped with the current time
    pub fn now(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            timestamp_ms: now_ms(),
            message: message.into(),
        }
    }
}

/// Per-flow notable events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowEvent {
    /// The matched interface was unusable and the flow used another route
    Fallback {
        flow_id: u64,
        destination: Option<SocketAddr>,
        requested: String,
        used: Option<String>,
        reason: String,
    },
}

/// Everything published on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RouterEvent {
    /// A new rule snapshot was published
    RuleSetChanged {
        kind: ChangeKind,
        version: u64,
        rule_count: usize,
    },
    /// The interface snapshot changed
    InterfacesChanged { count: usize, active: usize },
    /// Proxy lifecycle transition
    ProxyStatus { status: ProxyStatus },
    /// Forwarded log record
    Log(LogRecord),
    /// Flow-level notification
    Flow(FlowEvent),
}

/// Broadcast handle for [`RouterEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RouterEvent>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber backlog
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers that received it.
    pub fn publish(&self, event: RouterEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Publish a log record
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.publish(RouterEvent::Log(LogRecord::now(level, message)));
    }

    /// Publish a status transition
    pub fn status(&self, status: ProxyStatus) {
        self.publish(RouterEvent::ProxyStatus { status });
    }

    /// Subscribe to future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
