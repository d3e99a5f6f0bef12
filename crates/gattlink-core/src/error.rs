// ── Core error types ──
//
// Synchronous misuse only. Asynchronous connection outcomes never surface
// here; they travel through the EventNotifier as ConnectionEvents.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    // ── Configuration errors ─────────────────────────────────────────
    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // ── Identity errors ──────────────────────────────────────────────
    #[error("Invalid device address: {address}")]
    InvalidAddress { address: String },

    // ── Registry errors ──────────────────────────────────────────────
    #[error("No connection registered for {address}")]
    NotFound { address: String },

    #[error("Connection for {address} has already been released")]
    AlreadyReleased { address: String },
}

impl CoreError {
    pub(crate) fn invalid_config(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
