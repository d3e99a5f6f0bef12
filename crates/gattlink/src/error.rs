//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use gattlink_config::ConfigError;
use gattlink_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Devices ──────────────────────────────────────────────────────
    #[error("Unknown device '{device}'")]
    #[diagnostic(
        code(gattlink::unknown_device),
        help(
            "Pass a MAC address such as AA:BB:CC:DD:EE:FF, or add a [devices.{device}]\n\
             entry to the config file (see: gattlink config path)"
        )
    )]
    UnknownDevice { device: String },

    #[error("Invalid device address '{address}'")]
    #[diagnostic(
        code(gattlink::invalid_address),
        help("Addresses are six hex octets separated by ':' or '-'.")
    )]
    InvalidAddress { address: String },

    #[error("No connection for {address}")]
    #[diagnostic(code(gattlink::not_found))]
    NotFound { address: String },

    #[error("Connection for {address} was already released")]
    #[diagnostic(code(gattlink::released))]
    Released { address: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(gattlink::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(gattlink::profile_not_found),
        help("Define [profiles.{name}] in the config file, or drop --profile.")
    )]
    ProfileNotFound { name: String },

    #[error("Configuration file already exists at {path}")]
    #[diagnostic(
        code(gattlink::config_exists),
        help("Use --force to overwrite it.")
    )]
    ConfigExists { path: String },

    #[error("{0}")]
    #[diagnostic(code(gattlink::config))]
    Config(ConfigError),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to encode output: {0}")]
    #[diagnostic(code(gattlink::json))]
    Json(#[from] serde_json::Error),

    #[error("Failed to render config: {0}")]
    #[diagnostic(code(gattlink::toml))]
    Toml(#[from] toml::ser::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::UnknownDevice { .. } | Self::NotFound { .. } | Self::ProfileNotFound { .. } => {
                exit_code::NOT_FOUND
            }
            Self::InvalidAddress { .. } | Self::Validation { .. } => exit_code::USAGE,
            Self::ConfigExists { .. } | Self::Released { .. } => exit_code::CONFLICT,
            _ => exit_code::GENERAL,
        }
    }
}

// ── Library errors → CliError ────────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidConfig { field, reason } => CliError::Validation { field, reason },
            CoreError::InvalidAddress { address } => CliError::InvalidAddress { address },
            CoreError::NotFound { address } => CliError::NotFound { address },
            CoreError::AlreadyReleased { address } => CliError::Released { address },
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::UnknownProfile { name } => CliError::ProfileNotFound { name },
            ConfigError::UnknownDevice { device } => CliError::UnknownDevice { device },
            ConfigError::Core(core) => core.into(),
            ConfigError::Io(io) => CliError::Io(io),
            ConfigError::Serialization(ser) => CliError::Toml(ser),
            other @ ConfigError::Figment(_) => CliError::Config(other),
        }
    }
}
