//! Network interface description

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// Broad category of an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    #[default]
    Unknown,
    Ethernet,
    WiFi,
    Other,
}

impl InterfaceKind {
    /// Label used in display names
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Ethernet => "Ethernet",
            Self::WiFi => "Wi-Fi",
            Self::Other => "Other",
        }
    }
}

/// A local network interface as seen at the last refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Kernel name, e.g. `eth0`
    pub name: String,
    /// Human-readable name, e.g. `Ethernet (eth0)`
    pub display_name: String,
    pub kind: InterfaceKind,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub mac: Option<String>,
    /// Administratively up with carrier
    pub is_active: bool,
}

impl NetworkInterface {
    /// Create an inactive interface with a derived display name
    pub fn new(name: impl Into<String>, kind: InterfaceKind) -> Self {
        let name = name.into();
        Self {
            display_name: display_name_for(&name, kind),
            name,
            kind,
            ipv4: None,
            ipv6: None,
            mac: None,
            is_active: false,
        }
    }

    #[must_use]
    pub const fn with_active(mut self, active: bool) -> Self {
        self.is_active = active;
        self
    }

    #[must_use]
    pub const fn with_ipv4(mut self, addr: Ipv4Addr) -> Self {
        self.ipv4 = Some(addr);
        self
    }

    #[must_use]
    pub const fn with_ipv6(mut self, addr: Ipv6Addr) -> Self {
        self.ipv6 = Some(addr);
        self
    }

    #[must_use]
    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }

    #[must_use]
    pub const fn has_ipv4(&self) -> bool {
        self.ipv4.is_some()
    }

    #[must_use]
    pub const fn has_ipv6(&self) -> bool {
        self.ipv6.is_some()
    }
}

impl fmt::Display for NetworkInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name)
    }
}

/// `"<Kind label> (<name>)"`
#[must_use]
pub fn display_name_for(name: &str, kind: InterfaceKind) -> String {
    format!("{} ({name})", kind.label())
}

/// Recover the kernel name from a display string.
///
/// Accepts either a display name (`Wi-Fi (wlan0)`) or a bare name.
#[must_use]
pub fn name_from_display_string(display: &str) -> Option<&str> {
    let display = display.trim();
    if display.is_empty() {
        return None;
    }
    match (display.rfind('('), display.strip_suffix(')')) {
        (Some(open), Some(inner)) => {
            let name = inner[open + 1..].trim();
            (!name.is_empty()).then_some(name)
        }
        _ => Some(display),
    }
}
