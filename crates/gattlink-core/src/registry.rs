// ── Connection registry ──
//
// Owns the address -> controller table for one session. At most one live
// controller per address: every create/replace/remove decision happens
// under the DashMap entry for that address.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::controller::ConnectionController;
use crate::error::CoreError;
use crate::model::{ConnectionEvent, ConnectionState, DeviceIdentity, MacAddress};
use crate::notifier::{ConnectionObserver, EventNotifier, SubscriptionHandle};
use crate::session::Session;

/// Table of per-device controllers sharing one session and one notifier.
///
/// Cheaply cloneable via `Arc<RegistryInner>`. There is no global
/// instance: whoever owns the connection policy creates one and passes it
/// around.
pub struct ConnectionRegistry<S: Session> {
    inner: Arc<RegistryInner<S>>,
}

struct RegistryInner<S: Session> {
    session: Arc<S>,
    notifier: EventNotifier,
    controllers: DashMap<MacAddress, ConnectionController<S>>,
}

impl<S: Session> Clone for ConnectionRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Session> fmt::Debug for ConnectionRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("controllers", &self.inner.controllers.len())
            .field("subscribers", &self.inner.notifier.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl<S: Session> ConnectionRegistry<S> {
    /// Create a registry with its own notifier. Must be called from within
    /// a Tokio runtime.
    pub fn new(session: Arc<S>) -> Self {
        Self::with_notifier(session, EventNotifier::new())
    }

    pub fn with_notifier(session: Arc<S>, notifier: EventNotifier) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                session,
                notifier,
                controllers: DashMap::new(),
            }),
        }
    }

    pub fn session(&self) -> &Arc<S> {
        &self.inner.session
    }

    pub fn notifier(&self) -> &EventNotifier {
        &self.inner.notifier
    }

    // ── Observers ────────────────────────────────────────────────────

    pub fn subscribe(&self, observer: impl ConnectionObserver) -> SubscriptionHandle {
        self.inner.notifier.subscribe(observer)
    }

    pub fn subscribe_channel(&self) -> (SubscriptionHandle, mpsc::UnboundedReceiver<ConnectionEvent>) {
        self.inner.notifier.subscribe_channel()
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.inner.notifier.unsubscribe(handle);
    }

    // ── Connections ──────────────────────────────────────────────────

    /// Fire-and-forget form of [`connect_or_reuse`](Self::connect_or_reuse).
    pub fn connect(&self, identity: DeviceIdentity, config: ConnectionConfig) {
        self.connect_or_reuse(identity, config);
    }

    /// Return the live controller for `identity`, or create and start one.
    ///
    /// First writer wins: an existing controller keeps the config it was
    /// created with and `config` is ignored. If that controller sits in `Idle` or
    /// `Disconnected` it is restarted. A released controller is replaced by
    /// a fresh one.
    pub fn connect_or_reuse(
        &self,
        identity: DeviceIdentity,
        config: ConnectionConfig,
    ) -> ConnectionController<S> {
        let address = identity.address.clone();
        let created = match self.inner.controllers.entry(address) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if existing.reconnect().is_ok() {
                    if existing.config() != &config {
                        debug!(
                            address = %identity.address,
                            "controller already registered; keeping its first config"
                        );
                    }
                    return existing.clone();
                }
                let controller = self.new_controller(identity, config);
                entry.insert(controller.clone());
                controller
            }
            Entry::Vacant(entry) => {
                let controller = self.new_controller(identity, config);
                entry.insert(controller.clone());
                controller
            }
        };

        created.start();
        created
    }

    /// Connect and return a lease that releases the device when dropped.
    pub fn acquire(&self, identity: DeviceIdentity, config: ConnectionConfig) -> ConnectionLease<S> {
        let controller = self.connect_or_reuse(identity, config);
        ConnectionLease {
            registry: self.clone(),
            controller,
        }
    }

    /// Look up the live controller for `address`.
    pub fn get(&self, address: &MacAddress) -> Result<ConnectionController<S>, CoreError> {
        self.inner
            .controllers
            .remove_if(address, |_, controller| controller.is_released());
        self.inner
            .controllers
            .get(address)
            .map(|c| c.clone())
            .ok_or_else(|| CoreError::NotFound {
                address: address.to_string(),
            })
    }

    /// Current state of the device's live controller, if one is registered.
    pub fn state(&self, address: &MacAddress) -> Option<ConnectionState> {
        self.get(address).ok().map(|c| c.state())
    }

    /// Release the device's controller and drop it from the table.
    /// Idempotent; unknown addresses are ignored.
    pub fn release(&self, address: &MacAddress) {
        let removed = self.inner.controllers.remove_if(address, |_, controller| {
            controller.release();
            true
        });
        if removed.is_some() {
            debug!(address = %address, "controller removed from registry");
        }
    }

    /// Release `controller` only if it is still the registered instance.
    fn release_controller(&self, controller: &ConnectionController<S>) {
        let address = &controller.identity().address;
        self.inner
            .controllers
            .remove_if(address, |_, registered| registered.same_as(controller));
        controller.release();
    }

    /// Release every registered controller.
    pub fn release_all(&self) {
        let addresses = self.addresses();
        info!(count = addresses.len(), "releasing all connections");
        for address in &addresses {
            self.release(address);
        }
    }

    pub fn addresses(&self) -> Vec<MacAddress> {
        self.prune();
        self.inner
            .controllers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.prune();
        self.inner.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prune();
        self.inner.controllers.is_empty()
    }

    /// Drop entries whose controller was released through its own handle.
    fn prune(&self) {
        self.inner.controllers.retain(|address, controller| {
            let live = !controller.is_released();
            if !live {
                debug!(address = %address, "pruning released controller");
            }
            live
        });
    }

    fn new_controller(&self, identity: DeviceIdentity, config: ConnectionConfig) -> ConnectionController<S> {
        debug!(address = %identity.address, name = %identity.name, "creating controller");
        ConnectionController::new(
            identity,
            config,
            Arc::clone(&self.inner.session),
            self.inner.notifier.clone(),
        )
    }
}

// ── ConnectionLease ──────────────────────────────────────────────────

/// Scoped ownership of a device connection.
///
/// Dropping the lease releases the controller it was issued for, on every
/// exit path of the owning scope. A controller that has since been
/// replaced in the registry is left alone.
pub struct ConnectionLease<S: Session> {
    registry: ConnectionRegistry<S>,
    controller: ConnectionController<S>,
}

impl<S: Session> ConnectionLease<S> {
    pub fn controller(&self) -> &ConnectionController<S> {
        &self.controller
    }

    pub fn identity(&self) -> &DeviceIdentity {
        self.controller.identity()
    }

    pub fn state(&self) -> ConnectionState {
        self.controller.state()
    }
}

impl<S: Session> fmt::Debug for ConnectionLease<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

impl<S: Session> Drop for ConnectionLease<S> {
    fn drop(&mut self) {
        self.registry.release_controller(&self.controller);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::{SimBehavior, SimulatedSession};
    use std::time::Duration;

    fn identity(last: u8) -> DeviceIdentity {
        DeviceIdentity::parse(&format!("AA:BB:CC:DD:EE:{last:02X}"), "Tag").unwrap()
    }

    fn registry() -> ConnectionRegistry<SimulatedSession> {
        ConnectionRegistry::new(Arc::new(SimulatedSession::new(SimBehavior::HangOnOpen)))
    }

    #[tokio::test(start_paused = true)]
    async fn second_connect_reuses_live_controller() {
        let registry = registry();
        let first = registry.connect_or_reuse(identity(1), ConnectionConfig::default());
        let other_config = ConnectionConfig::builder()
            .auto_reconnect(true)
            .build()
            .unwrap();
        let second = registry.connect_or_reuse(identity(1), other_config);

        assert!(first.same_as(&second));
        assert!(!second.config().auto_reconnect());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_after_release_creates_fresh_controller() {
        let registry = registry();
        let first = registry.connect_or_reuse(identity(2), ConnectionConfig::default());
        registry.release(&identity(2).address);
        assert!(first.is_released());
        assert!(registry.is_empty());

        let second = registry.connect_or_reuse(identity(2), ConnectionConfig::default());
        assert!(!first.same_as(&second));
        assert_eq!(second.state(), ConnectionState::Scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn released_handle_is_replaced_on_connect() {
        let registry = registry();
        let first = registry.connect_or_reuse(identity(3), ConnectionConfig::default());
        first.release();
        assert!(matches!(
            registry.get(&identity(3).address),
            Err(CoreError::NotFound { .. })
        ));

        let second = registry.connect_or_reuse(identity(3), ConnectionConfig::default());
        assert!(!first.same_as(&second));
        assert!(registry.get(&identity(3).address).unwrap().same_as(&second));
    }

    #[tokio::test(start_paused = true)]
    async fn controller_release_drops_registry_entry() {
        let registry = registry();
        let controller = registry.connect_or_reuse(identity(8), ConnectionConfig::default());
        registry.connect(identity(10), ConnectionConfig::default());
        assert!(controller.release());

        assert_eq!(registry.len(), 1);
        assert!(registry.state(&identity(8).address).is_none());
        assert_eq!(registry.addresses(), vec![identity(10).address]);

        registry.release_all();
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn release_is_idempotent_and_ignores_unknown() {
        let registry = registry();
        registry.release(&identity(9).address);
        registry.connect(identity(4), ConnectionConfig::default());
        registry.release(&identity(4).address);
        registry.release(&identity(4).address);
        assert!(registry.state(&identity(4).address).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_lease_releases_device() {
        let registry = registry();
        let controller = {
            let lease = registry.acquire(identity(5), ConnectionConfig::default());
            assert_eq!(lease.state(), ConnectionState::Scanning);
            lease.controller().clone()
        };
        assert!(controller.is_released());
        assert!(registry.is_empty());
        assert_eq!(
            registry.session().stats(&identity(5).address).closes,
            1,
            "release must detach from the session"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_lease_leaves_replacement_alone() {
        let registry = registry();
        let lease = registry.acquire(identity(6), ConnectionConfig::default());
        lease.controller().release();
        let replacement = registry.connect_or_reuse(identity(6), ConnectionConfig::default());
        drop(lease);

        assert!(!replacement.is_released());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_controller_restarts_on_connect() {
        let registry = registry();
        let config = ConnectionConfig::builder()
            .connect_timeout(Duration::from_secs(1))
            .build()
            .unwrap();
        let first = registry.connect_or_reuse(identity(7), config.clone());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(first.state(), ConnectionState::Disconnected);

        let again = registry.connect_or_reuse(identity(7), config);
        assert!(first.same_as(&again));
        assert_eq!(again.state(), ConnectionState::Scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn release_all_empties_registry() {
        let registry = registry();
        for i in 0..3 {
            registry.connect(identity(0x20 + i), ConnectionConfig::default());
        }
        assert_eq!(registry.addresses().len(), 3);
        registry.release_all();
        assert!(registry.is_empty());
    }
}
