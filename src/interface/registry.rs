//! Read-mostly snapshot of local interfaces

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::provider::InterfaceProvider;
use super::types::{name_from_display_string, InterfaceKind, NetworkInterface};
use crate::error::InterfaceError;
use crate::events::{EventBus, RouterEvent};

/// Answers "is this interface usable right now?" without locking.
///
/// `refresh()` queries the provider and swaps in a new list only when it
/// differs from the current one.
pub struct InterfaceRegistry {
    provider: Arc<dyn InterfaceProvider>,
    interfaces: ArcSwap<Vec<NetworkInterface>>,
    events: EventBus,
}

impl InterfaceRegistry {
    /// Create an empty registry; call [`refresh`](Self::refresh) to populate
    pub fn new(provider: Arc<dyn InterfaceProvider>, events: EventBus) -> Self {
        Self {
            provider,
            interfaces: ArcSwap::from_pointee(Vec::new()),
            events,
        }
    }

    /// Re-query the provider. Returns true if the list changed.
    ///
    /// # Errors
    ///
    /// Returns the provider's error; the previous list stays in place.
    pub fn refresh(&self) -> Result<bool, InterfaceError> {
        let fresh = self.provider.list()?;
        if **self.interfaces.load() == fresh {
            return Ok(false);
        }

        let count = fresh.len();
        let active = fresh.iter().filter(|i| i.is_active).count();
        self.interfaces.store(Arc::new(fresh));

        info!(count, active, "Interface list changed");
        self.events
            .publish(RouterEvent::InterfacesChanged { count, active });
        Ok(true)
    }

    /// Refresh every `interval` until `cancel` fires
    pub fn spawn_refresh_task(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = registry.refresh() {
                            warn!(error = %e, "Interface refresh failed");
                        }
                    }
                }
            }
            debug!("Interface refresh task stopped");
        })
    }

    /// Subscribe to change events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    /// All interfaces at the last refresh
    #[must_use]
    pub fn interfaces(&self) -> Arc<Vec<NetworkInterface>> {
        self.interfaces.load_full()
    }

    #[must_use]
    pub fn active_interfaces(&self) -> Vec<NetworkInterface> {
        self.interfaces
            .load()
            .iter()
            .filter(|i| i.is_active)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn interface_with_name(&self, name: &str) -> Option<NetworkInterface> {
        self.interfaces.load().iter().find(|i| i.name == name).cloned()
    }

    /// True if `name` exists and is active
    #[must_use]
    pub fn is_active(&self, name: &str) -> bool {
        self.interfaces
            .load()
            .iter()
            .any(|i| i.name == name && i.is_active)
    }

    /// First Ethernet interface, preferring active ones
    #[must_use]
    pub fn ethernet_interface(&self) -> Option<NetworkInterface> {
        self.first_of_kind(InterfaceKind::Ethernet)
    }

    /// First Wi-Fi interface, preferring active ones
    #[must_use]
    pub fn wifi_interface(&self) -> Option<NetworkInterface> {
        self.first_of_kind(InterfaceKind::WiFi)
    }

    fn first_of_kind(&self, kind: InterfaceKind) -> Option<NetworkInterface> {
        let list = self.interfaces.load();
        let mut of_kind = list.iter().filter(|i| i.kind == kind);
        list.iter()
            .find(|i| i.kind == kind && i.is_active)
            .or_else(|| of_kind.next())
            .cloned()
    }

    #[must_use]
    pub fn display_names(&self) -> Vec<String> {
        self.interfaces
            .load()
            .iter()
            .map(|i| i.display_name.clone())
            .collect()
    }

    #[must_use]
    pub fn active_display_names(&self) -> Vec<String> {
        self.interfaces
            .load()
            .iter()
            .filter(|i| i.is_active)
            .map(|i| i.display_name.clone())
            .collect()
    }

    /// Kernel name for a display string, if such an interface is known
    #[must_use]
    pub fn interface_name_from_display_string(&self, display: &str) -> Option<String> {
        let list = self.interfaces.load();
        if let Some(iface) = list.iter().find(|i| i.display_name == display) {
            return Some(iface.name.clone());
        }
        let name = name_from_display_string(display)?;
        list.iter().find(|i| i.name == name).map(|i| i.name.clone())
    }
}

impl std::fmt::Debug for InterfaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceRegistry")
            .field("interfaces", &self.interfaces.load().len())
            .finish_non_exhaustive()
    }
}
