// ── Domain model ──

pub mod event;
pub mod identity;
pub mod state;

pub use event::ConnectionEvent;
pub use identity::{DeviceIdentity, MacAddress};
pub use state::{ConnectFailureKind, ConnectionState, TimeoutKind};
