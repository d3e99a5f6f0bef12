// ── Session collaborator ──
//
// The transport layer a controller drives. Implementations own the radio;
// the controller only sequences calls, bounds them with phase timers, and
// turns their outcomes into events.

mod simulated;

use std::future::Future;

use tokio::sync::broadcast;

use crate::model::{ConnectFailureKind, DeviceIdentity, MacAddress};

pub use simulated::{SimBehavior, SimStats, SimulatedSession};

/// Unsolicited notification pushed by the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// An established link to `address` went away without being asked to.
    Lost { address: MacAddress },
}

impl LinkEvent {
    pub fn address(&self) -> &MacAddress {
        match self {
            Self::Lost { address } => address,
        }
    }
}

/// Low-level connect/discover/disconnect primitives for remote devices.
///
/// Every future may stay pending forever; the controller enforces its own
/// timeouts and drops futures whose phase has already ended.
pub trait Session: Send + Sync + 'static {
    /// Resolve once the device has been located by a scan.
    fn scan(
        &self,
        identity: &DeviceIdentity,
    ) -> impl Future<Output = Result<(), ConnectFailureKind>> + Send;

    /// Resolve once a link to the device is established.
    fn open(
        &self,
        identity: &DeviceIdentity,
    ) -> impl Future<Output = Result<(), ConnectFailureKind>> + Send;

    /// Discover services on an established link. Returns the service count.
    fn discover_services(
        &self,
        identity: &DeviceIdentity,
    ) -> impl Future<Output = Result<usize, ConnectFailureKind>> + Send;

    /// Tear down any link or pending attempt for the device. Must not block.
    fn close(&self, identity: &DeviceIdentity);

    /// Subscribe to unsolicited link notifications for all devices.
    fn link_events(&self) -> broadcast::Receiver<LinkEvent>;
}
