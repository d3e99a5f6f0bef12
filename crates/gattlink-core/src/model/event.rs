// ── Connection events ──
//
// The only payloads observers ever see. Every asynchronous outcome of a
// connect() request is expressed as one of these variants.

use serde::{Deserialize, Serialize};

use super::identity::DeviceIdentity;
use super::state::{ConnectFailureKind, ConnectionState, TimeoutKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// Published after the controller's state field has been updated.
    StateChanged {
        identity: DeviceIdentity,
        state: ConnectionState,
    },
    ConnectFailed {
        identity: DeviceIdentity,
        reason: ConnectFailureKind,
    },
    /// Published before the forced transition to `Disconnected`.
    ConnectTimeout {
        identity: DeviceIdentity,
        kind: TimeoutKind,
    },
}

impl ConnectionEvent {
    pub fn identity(&self) -> &DeviceIdentity {
        match self {
            Self::StateChanged { identity, .. }
            | Self::ConnectFailed { identity, .. }
            | Self::ConnectTimeout { identity, .. } => identity,
        }
    }

    /// The new state, for `StateChanged` events.
    pub fn state(&self) -> Option<ConnectionState> {
        match self {
            Self::StateChanged { state, .. } => Some(*state),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn event_json_is_tagged() {
        let identity = DeviceIdentity::parse("AA:BB:CC:DD:EE:FF", "Band").unwrap();
        let event = ConnectionEvent::ConnectTimeout {
            identity,
            kind: TimeoutKind::DeviceNotFound,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "connect_timeout");
        assert_eq!(value["kind"], "device_not_found");
        assert_eq!(value["identity"]["address"], "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn state_accessor_only_for_state_changes() {
        let identity = DeviceIdentity::parse("AA:BB:CC:DD:EE:FF", "").unwrap();
        let changed = ConnectionEvent::StateChanged {
            identity: identity.clone(),
            state: ConnectionState::Connected,
        };
        let failed = ConnectionEvent::ConnectFailed {
            identity,
            reason: ConnectFailureKind::TransportRejected,
        };
        assert_eq!(changed.state(), Some(ConnectionState::Connected));
        assert_eq!(failed.state(), None);
    }
}
