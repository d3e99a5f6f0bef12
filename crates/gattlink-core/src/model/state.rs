// ── Connection state and outcome classification ──

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

/// Lifecycle state of one device controller.
///
/// Starts at [`Idle`](Self::Idle); [`Released`](Self::Released) is terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    ServiceDiscovering,
    ServiceDiscovered,
    Disconnected,
    Released,
}

impl ConnectionState {
    /// States covered by the connect-phase timer.
    pub fn is_connect_phase(self) -> bool {
        matches!(self, Self::Scanning | Self::Connecting)
    }

    /// States in which a link to the device exists (or is being used).
    pub fn has_link(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::ServiceDiscovering | Self::ServiceDiscovered
        )
    }

    pub fn is_released(self) -> bool {
        matches!(self, Self::Released)
    }
}

/// Which phase's timer expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TimeoutKind {
    /// The scanner never located the device.
    DeviceNotFound,
    /// The device was located but the link never came up.
    CannotConnect,
    /// The link came up but service discovery never completed.
    ServiceDiscoveryFailed,
}

/// Reason a connection attempt failed, as reported by the session layer.
///
/// Surfaced to observers verbatim; the controller only adds
/// [`MaximumReconnection`](Self::MaximumReconnection) itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ConnectFailureKind {
    #[error("transport rejected the connection")]
    TransportRejected,

    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,

    #[error("bluetooth adapter is disabled")]
    AdapterDisabled,

    #[error("GATT status {0}")]
    GattStatus(i32),

    #[error("device exposes no services")]
    NoServices,

    #[error("reconnect attempts exhausted")]
    MaximumReconnection,

    #[error("{0}")]
    Other(String),
}
