//! Interface enumeration backends

use std::collections::HashMap;
use std::ffi::CStr;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use super::types::{InterfaceKind, NetworkInterface};
use crate::error::InterfaceError;

/// `IFF_UP` from `include/uapi/linux/if.h`
const IFF_UP: u32 = 0x1;

/// `IFF_LOOPBACK`
const IFF_LOOPBACK: u32 = 0x8;

/// `ARPHRD_ETHER`
const ARPHRD_ETHER: u32 = 1;

/// Source of the current interface list
pub trait InterfaceProvider: Send + Sync {
    /// List every interface the host currently has.
    ///
    /// # Errors
    ///
    /// Returns `InterfaceError` if the platform query fails.
    fn list(&self) -> Result<Vec<NetworkInterface>, InterfaceError>;
}

/// Linux provider reading `/sys/class/net` plus `getifaddrs(3)`
#[derive(Debug, Clone)]
pub struct SysfsInterfaceProvider {
    root: PathBuf,
    include_loopback: bool,
}

impl SysfsInterfaceProvider {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/sys/class/net"),
            include_loopback: false,
        }
    }

    /// Read from another sysfs root (tests)
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            include_loopback: false,
        }
    }

    #[must_use]
    pub const fn include_loopback(mut self, include: bool) -> Self {
        self.include_loopback = include;
        self
    }

    fn describe(&self, dir: &Path, name: &str) -> Option<NetworkInterface> {
        let flags = read_hex(&dir.join("flags")).unwrap_or(0);
        if flags & IFF_LOOPBACK != 0 && !self.include_loopback {
            return None;
        }

        let arp_type = read_trimmed(&dir.join("type"))
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0);
        let kind = if dir.join("wireless").exists() || dir.join("phy80211").exists() {
            InterfaceKind::WiFi
        } else if arp_type == ARPHRD_ETHER && dir.join("device").exists() {
            InterfaceKind::Ethernet
        } else if arp_type == 0 {
            InterfaceKind::Unknown
        } else {
            InterfaceKind::Other
        };

        // "unknown" is what virtual devices without carrier detection report
        let operstate = read_trimmed(&dir.join("operstate")).unwrap_or_default();
        let is_active = flags & IFF_UP != 0 && matches!(operstate.as_str(), "up" | "unknown");

        let mut iface = NetworkInterface::new(name, kind).with_active(is_active);
        iface.mac = read_trimmed(&dir.join("address"))
            .filter(|mac| !mac.is_empty() && mac != "00:00:00:00:00:00");
        Some(iface)
    }
}

impl Default for SysfsInterfaceProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceProvider for SysfsInterfaceProvider {
    fn list(&self) -> Result<Vec<NetworkInterface>, InterfaceError> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            InterfaceError::Enumeration(format!("{}: {e}", self.root.display()))
        })?;

        let mut interfaces: Vec<NetworkInterface> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                self.describe(&entry.path(), &name)
            })
            .collect();
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));

        // Address lookup failing only loses the address columns.
        match interface_addresses() {
            Ok(addrs) => {
                for iface in &mut interfaces {
                    if let Some((v4, v6)) = addrs.get(&iface.name) {
                        iface.ipv4 = *v4;
                        iface.ipv6 = *v6;
                    }
                }
            }
            Err(e) => tracing::debug!(error = %e, "getifaddrs failed"),
        }
        Ok(interfaces)
    }
}

type AddressMap = HashMap<String, (Option<Ipv4Addr>, Option<Ipv6Addr>)>;

/// First IPv4 and first non-link-local IPv6 address per interface
fn interface_addresses() -> Result<AddressMap, InterfaceError> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs writes a list head we free with freeifaddrs below.
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(InterfaceError::IoError(std::io::Error::last_os_error()));
    }

    let mut map = AddressMap::new();
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: cursor is a node of the list returned by getifaddrs.
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;
        if entry.ifa_addr.is_null() || entry.ifa_name.is_null() {
            continue;
        }
        // SAFETY: ifa_name is a NUL-terminated string owned by the list.
        let name = unsafe { CStr::from_ptr(entry.ifa_name) }
            .to_string_lossy()
            .into_owned();
        // SAFETY: ifa_addr is non-null and points at a sockaddr.
        let Some(addr) = (unsafe { sockaddr_to_ip(entry.ifa_addr) }) else {
            continue;
        };

        let slot = map.entry(name).or_default();
        match addr {
            IpAddr::V4(v4) if slot.0.is_none() => slot.0 = Some(v4),
            IpAddr::V6(v6) if slot.1.is_none() && !is_link_local_v6(&v6) => slot.1 = Some(v6),
            _ => {}
        }
    }

    // SAFETY: head came from a successful getifaddrs call and is freed once.
    unsafe { libc::freeifaddrs(head) };
    Ok(map)
}

/// # Safety
///
/// `addr` must point to a valid `sockaddr` whose family tag is accurate.
unsafe fn sockaddr_to_ip(addr: *const libc::sockaddr) -> Option<IpAddr> {
    match i32::from((*addr).sa_family) {
        libc::AF_INET => {
            let sin = &*addr.cast::<libc::sockaddr_in>();
            Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))))
        }
        libc::AF_INET6 => {
            let sin6 = &*addr.cast::<libc::sockaddr_in6>();
            Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}

const fn is_link_local_v6(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn read_hex(path: &Path) -> Option<u32> {
    let raw = read_trimmed(path)?;
    u32::from_str_radix(raw.trim_start_matches("0x"), 16).ok()
}

/// Fixed, mutable interface list for tests and embedding
#[derive(Debug, Default)]
pub struct StaticInterfaceProvider {
    interfaces: RwLock<Vec<NetworkInterface>>,
}

impl StaticInterfaceProvider {
    #[must_use]
    pub fn new(interfaces: Vec<NetworkInterface>) -> Self {
        Self {
            interfaces: RwLock::new(interfaces),
        }
    }

    /// Replace the reported list
    pub fn set(&self, interfaces: Vec<NetworkInterface>) {
        *self.interfaces.write() = interfaces;
    }

    /// Flip one interface's active flag
    pub fn set_active(&self, name: &str, active: bool) {
        if let Some(iface) = self.interfaces.write().iter_mut().find(|i| i.name == name) {
            iface.is_active = active;
        }
    }
}

impl InterfaceProvider for StaticInterfaceProvider {
    fn list(&self) -> Result<Vec<NetworkInterface>, InterfaceError> {
        Ok(self.interfaces.read().clone())
    }
}
