//! Hostname pattern matching for Host rules
//!
//! Two pattern forms, chosen by syntax:
//!
//! - **Exact**: `example.com` matches only `example.com`
//! - **Suffix**: `*.example.com` or `.example.com` matches `example.com`
//!   itself and every subdomain on a label boundary
//!
//! Comparison is ASCII case-insensitive and ignores a trailing dot on
//! either side. Because the form is fixed by the pattern text, exact and
//! suffix never compete inside one rule; between rules, snapshot order
//! decides.
//!
//! # Example
//!
//! ```
//! use iface_router::rules::host::HostPattern;
//!
//! let exact = HostPattern::parse("Example.com").unwrap();
//! assert!(exact.matches("example.COM."));
//! assert!(!exact.matches("www.example.com"));
//!
//! let suffix = HostPattern::parse("*.example.com").unwrap();
//! assert!(suffix.matches("example.com"));
//! assert!(suffix.matches("a.b.example.com"));
//! assert!(!suffix.matches("badexample.com"));
//! ```

use std::fmt;

use crate::error::RuleError;
use crate::rules::address::is_valid_hostname;

/// A compiled Host rule pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostPattern {
    /// Whole-name match (lowercased, no trailing dot)
    Exact(String),
    /// Domain plus subdomains (lowercased, no leading marker or trailing dot)
    Suffix(String),
}

impl HostPattern {
    /// Compile a pattern string
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidPattern` if the name part is not a valid
    /// hostname.
    pub fn parse(pattern: &str) -> Result<Self, RuleError> {
        let trimmed = pattern.trim();
        let (name, suffix) = if let Some(rest) = trimmed.strip_prefix("*.") {
            (rest, true)
        } else if let Some(rest) = trimmed.strip_prefix('.') {
            (rest, true)
        } else {
            (trimmed, false)
        };

        if !is_valid_hostname(name) {
            return Err(RuleError::invalid_pattern(pattern, "not a valid hostname"));
        }

        let name = normalize(name);
        Ok(if suffix {
            Self::Suffix(name)
        } else {
            Self::Exact(name)
        })
    }

    /// Test a destination hostname against this pattern
    #[must_use]
    pub fn matches(&self, hostname: &str) -> bool {
        let host = hostname.strip_suffix('.').unwrap_or(hostname);
        match self {
            Self::Exact(name) => host.eq_ignore_ascii_case(name),
            Self::Suffix(name) => {
                if host.len() == name.len() {
                    return host.eq_ignore_ascii_case(name);
                }
                if host.len() <= name.len() {
                    return false;
                }
                let boundary = host.len() - name.len() - 1;
                host.as_bytes()[boundary] == b'.'
                    && host.is_char_boundary(boundary + 1)
                    && host[boundary + 1..].eq_ignore_ascii_case(name)
            }
        }
    }

    /// True for the suffix form
    #[must_use]
    pub const fn is_suffix(&self) -> bool {
        matches!(self, Self::Suffix(_))
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(name) => f.write_str(name),
            Self::Suffix(name) => write!(f, "*.{name}"),
        }
    }
}

fn normalize(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase()
}
