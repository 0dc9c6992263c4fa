//! Core rule types for the matching engine
//!
//! - [`RuleKind`]: CIDR or Host matching
//! - [`Rule`]: a validated routing rule
//! - [`RuleRecord`]: the serialized interchange form of a rule
//! - [`RuleMatch`]: the result of a successful match

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::error::RuleError;
use crate::rules::address::{self, Cidr};
use crate::rules::host::HostPattern;

/// Rule matching kind
///
/// Serialized as an integer: `0` for CIDR, `1` for Host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RuleKind {
    /// Destination IPv4 address inside a CIDR block
    Cidr,
    /// Destination hostname matches a host pattern
    Host,
}

impl RuleKind {
    /// Short label for UIs and logs
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cidr => "CIDR",
            Self::Host => "Host",
        }
    }
}

impl TryFrom<u8> for RuleKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cidr),
            1 => Ok(Self::Host),
            other => Err(format!("unknown rule type {other}")),
        }
    }
}

impl From<RuleKind> for u8 {
    fn from(kind: RuleKind) -> Self {
        match kind {
            RuleKind::Cidr => 0,
            RuleKind::Host => 1,
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compiled form of a rule pattern
#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    Cidr(Cidr),
    Host(HostPattern),
}

impl Matcher {
    fn compile(kind: RuleKind, pattern: &str) -> Result<Self, RuleError> {
        match kind {
            RuleKind::Cidr => address::parse_cidr(pattern.trim())
                .map(Self::Cidr)
                .map_err(|e| RuleError::invalid_pattern(pattern, e.to_string())),
            RuleKind::Host => HostPattern::parse(pattern).map(Self::Host),
        }
    }
}

/// A validated routing rule
///
/// A `Rule` can only be built from a pattern that parses under its kind,
/// so every value of this type is eligible for a snapshot. Fields are
/// read through accessors; edits produce a new rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "RuleRecord", try_from = "RuleRecord")]
pub struct Rule {
    id: String,
    kind: RuleKind,
    pattern: String,
    interface_name: String,
    enabled: bool,
    priority: i64,
    comment: Option<String>,
    matcher: Matcher,
}

impl Rule {
    /// Create a rule with a fresh UUID, enabled, priority 0
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidPattern` if `pattern` does not parse
    /// under `kind`.
    ///
    /// # Examples
    ///
    /// ```
    /// use iface_router::rules::{Rule, RuleKind};
    ///
    /// let rule = Rule::new(RuleKind::Cidr, "10.0.0.0/8", "eth0").unwrap();
    /// assert!(rule.enabled());
    /// assert_eq!(rule.display_string(), "10.0.0.0/8 → eth0");
    /// ```
    pub fn new(
        kind: RuleKind,
        pattern: impl Into<String>,
        interface_name: impl Into<String>,
    ) -> Result<Self, RuleError> {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            kind,
            pattern,
            interface_name,
        )
    }

    /// Create a rule with a caller-chosen id
    ///
    /// # Errors
    ///
    /// Returns `RuleError::EmptyId` for a blank id and
    /// `RuleError::InvalidPattern` for an unparseable pattern.
    pub fn with_id(
        id: impl Into<String>,
        kind: RuleKind,
        pattern: impl Into<String>,
        interface_name: impl Into<String>,
    ) -> Result<Self, RuleError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(RuleError::EmptyId);
        }
        let pattern = pattern.into().trim().to_string();
        let matcher = Matcher::compile(kind, &pattern)?;
        Ok(Self {
            id,
            kind,
            pattern,
            interface_name: interface_name.into().trim().to_string(),
            enabled: true,
            priority: 0,
            comment: None,
            matcher,
        })
    }

    /// Set the priority (lower values are matched first)
    #[must_use]
    pub const fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the enabled flag
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Attach a free-text comment
    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Retarget the rule at another interface
    #[must_use]
    pub fn with_interface(mut self, interface_name: impl Into<String>) -> Self {
        self.interface_name = interface_name.into().trim().to_string();
        self
    }

    /// Validate a record without building a rule
    ///
    /// # Errors
    ///
    /// Same conditions as [`Rule::with_id`].
    pub fn validate(kind: RuleKind, pattern: &str) -> Result<(), RuleError> {
        Matcher::compile(kind, pattern).map(|_| ())
    }

    /// Human-readable reason a pattern is invalid, or `None` if it is valid
    #[must_use]
    pub fn validation_error(kind: RuleKind, pattern: &str) -> Option<String> {
        if pattern.trim().is_empty() {
            return Some("Pattern cannot be empty".to_string());
        }
        match Self::validate(kind, pattern) {
            Ok(()) => None,
            Err(_) => Some(match kind {
                RuleKind::Cidr => {
                    "Invalid CIDR notation (expected e.g. 192.168.1.0/24)".to_string()
                }
                RuleKind::Host => "Invalid hostname".to_string(),
            }),
        }
    }

    /// Unique identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Matching kind
    #[must_use]
    pub const fn kind(&self) -> RuleKind {
        self.kind
    }

    /// Pattern as written by the user, without surrounding whitespace
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Target interface; empty means system default
    #[must_use]
    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    /// Whether the rule participates in matching
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// Evaluation priority
    #[must_use]
    pub const fn priority(&self) -> i64 {
        self.priority
    }

    /// Optional comment
    #[must_use]
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Parsed block for CIDR rules
    #[must_use]
    pub const fn cidr(&self) -> Option<&Cidr> {
        match &self.matcher {
            Matcher::Cidr(c) => Some(c),
            Matcher::Host(_) => None,
        }
    }

    /// Compiled pattern for Host rules
    #[must_use]
    pub const fn host_pattern(&self) -> Option<&HostPattern> {
        match &self.matcher {
            Matcher::Host(h) => Some(h),
            Matcher::Cidr(_) => None,
        }
    }

    /// "CIDR" or "Host"
    #[must_use]
    pub const fn type_string(&self) -> &'static str {
        self.kind.as_str()
    }

    /// `pattern → interface`, with "Default" for an empty interface
    #[must_use]
    pub fn display_string(&self) -> String {
        let target = if self.interface_name.is_empty() {
            "Default"
        } else {
            &self.interface_name
        };
        format!("{} → {}", self.pattern, target)
    }

    /// Test an IPv4 destination. Disabled and Host rules never match.
    #[must_use]
    pub fn matches_ipv4(&self, ip: Ipv4Addr) -> bool {
        self.enabled && self.cidr().is_some_and(|c| c.contains(u32::from(ip)))
    }

    /// Test a hostname destination. Disabled and CIDR rules never match.
    #[must_use]
    pub fn matches_host(&self, hostname: &str) -> bool {
        self.enabled && self.host_pattern().is_some_and(|h| h.matches(hostname))
    }

    /// Test whichever destination facets are present.
    ///
    /// A missing facet skips the rule; IPv6 addresses never match CIDR rules.
    #[must_use]
    pub fn matches(&self, ip: Option<IpAddr>, hostname: Option<&str>) -> bool {
        match self.kind {
            RuleKind::Cidr => match ip {
                Some(IpAddr::V4(v4)) => self.matches_ipv4(v4),
                _ => false,
            },
            RuleKind::Host => hostname.is_some_and(|h| self.matches_host(h)),
        }
    }

    /// Interchange record for this rule
    #[must_use]
    pub fn to_record(&self) -> RuleRecord {
        RuleRecord::from(self.clone())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.display_string())
    }
}

/// Serialized rule, as exchanged with storage and control clients
///
/// ```json
/// { "ruleId": "r1", "type": 0, "pattern": "10.0.0.0/8",
///   "interfaceName": "eth0", "enabled": true, "comment": null, "priority": 1 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuleRecord {
    /// Unique identifier
    pub rule_id: String,

    /// 0 = CIDR, 1 = Host
    #[serde(rename = "type")]
    pub kind: RuleKind,

    /// CIDR block or host pattern
    pub pattern: String,

    /// Target interface; empty means system default
    #[serde(default)]
    pub interface_name: String,

    /// Disabled rules are kept but never match
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Free text
    #[serde(default)]
    pub comment: Option<String>,

    /// Lower is evaluated first
    #[serde(default)]
    pub priority: i64,
}

const fn default_true() -> bool {
    true
}

impl RuleRecord {
    /// Check the record without converting it
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.rule_id.trim().is_empty() && Rule::validate(self.kind, &self.pattern).is_ok()
    }
}

impl TryFrom<RuleRecord> for Rule {
    type Error = RuleError;

    fn try_from(record: RuleRecord) -> Result<Self, Self::Error> {
        let mut rule = Self::with_id(
            record.rule_id,
            record.kind,
            record.pattern,
            record.interface_name,
        )?
        .with_enabled(record.enabled)
        .with_priority(record.priority);
        rule.comment = record.comment;
        Ok(rule)
    }
}

impl From<Rule> for RuleRecord {
    fn from(rule: Rule) -> Self {
        Self {
            rule_id: rule.id,
            kind: rule.kind,
            pattern: rule.pattern,
            interface_name: rule.interface_name,
            enabled: rule.enabled,
            comment: rule.comment,
            priority: rule.priority,
        }
    }
}

/// Result of a successful match
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleMatch {
    /// Id of the rule that matched
    pub rule_id: String,
    /// Target interface; empty means system default
    pub interface_name: String,
    /// Kind of the matching rule
    pub kind: RuleKind,
}

impl RuleMatch {
    pub(crate) fn from_rule(rule: &Rule) -> Self {
        Self {
            rule_id: rule.id.clone(),
            interface_name: rule.interface_name.clone(),
            kind: rule.kind,
        }
    }

    /// Interface to bind, or `None` for the system default
    #[must_use]
    pub fn interface(&self) -> Option<&str> {
        if self.interface_name.is_empty() {
            None
        } else {
            Some(&self.interface_name)
        }
    }
}
