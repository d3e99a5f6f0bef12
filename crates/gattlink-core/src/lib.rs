//! Per-device connection lifecycle for BLE-style links.
//!
//! This crate owns the state machine, registry and event fan-out that sit
//! between a radio session layer and the code that wants devices connected:
//!
//! - **[`ConnectionController`]**: One device's lifecycle:
//!   `Scanning → Connecting → Connected → ServiceDiscovering →
//!   ServiceDiscovered`, with phase timers, auto-reconnect backoff, and an
//!   idempotent [`release()`](ConnectionController::release). Late results
//!   from a phase that has already ended are discarded.
//!
//! - **[`ConnectionRegistry`]**: Address-keyed table of controllers.
//!   [`connect_or_reuse()`](ConnectionRegistry::connect_or_reuse) guarantees
//!   at most one live controller per device; the first caller's config wins.
//!   [`acquire()`](ConnectionRegistry::acquire) hands out a
//!   [`ConnectionLease`] that releases on drop.
//!
//! - **[`EventNotifier`]**: Publish/subscribe hub. Events are queued in
//!   transition order and delivered by a dispatcher task that never holds a
//!   controller lock, so observers may call back into the registry.
//!
//! - **[`Session`]**: The transport seam. [`SimulatedSession`] plays back
//!   scripted per-device behavior on Tokio time.

pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod notifier;
pub mod registry;
pub mod session;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{ConnectionConfig, ConnectionConfigBuilder, ReconnectPolicy, duration_from_millis};
pub use controller::ConnectionController;
pub use error::CoreError;
pub use model::{
    ConnectFailureKind, ConnectionEvent, ConnectionState, DeviceIdentity, MacAddress, TimeoutKind,
};
pub use notifier::{ConnectionObserver, EventNotifier, SubscriptionHandle};
pub use registry::{ConnectionLease, ConnectionRegistry};
pub use session::{LinkEvent, Session, SimBehavior, SimStats, SimulatedSession};
