//! Shared configuration for the gattlink CLI.
//!
//! TOML profiles of connection tunables, device aliases, and translation
//! to `gattlink_core::ConnectionConfig`. The CLI layers flag overrides on
//! top of what this crate resolves.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use gattlink_core::{ConnectionConfig, CoreError, DeviceIdentity, MacAddress, duration_from_millis};

pub const DEFAULT_PROFILE: &str = "default";
pub const ENV_PREFIX: &str = "GATTLINK_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("profile '{name}' is not defined")]
    UnknownProfile { name: String },

    #[error("'{device}' is neither a configured device alias nor a MAC address")]
    UnknownDevice { device: String },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when a device entry and the command line name none.
    pub default_profile: Option<String>,

    /// Named connection profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,

    /// Device aliases.
    #[serde(default)]
    pub devices: HashMap<String, DeviceEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some(DEFAULT_PROFILE.into()),
            profiles: HashMap::from([(DEFAULT_PROFILE.into(), Profile::default())]),
            devices: HashMap::new(),
        }
    }
}

/// Connection tunables, in milliseconds.
///
/// Stored signed so that a negative value reaches validation and is
/// reported against its field instead of failing the whole parse.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Profile {
    #[serde(default)]
    pub auto_reconnect: bool,

    #[serde(default)]
    pub discover_services_delay_ms: i64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: i64,

    #[serde(default = "default_discover_timeout_ms")]
    pub discover_timeout_ms: i64,

    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: i64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: i64,

    /// Unset retries forever.
    pub max_reconnect_attempts: Option<u32>,

    /// Reconnects that reopen the link without scanning first.
    #[serde(default)]
    pub reconnect_immediate_attempts: u32,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            auto_reconnect: false,
            discover_services_delay_ms: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
            discover_timeout_ms: default_discover_timeout_ms(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: None,
            reconnect_immediate_attempts: 0,
        }
    }
}

fn default_connect_timeout_ms() -> i64 {
    10_000
}
fn default_discover_timeout_ms() -> i64 {
    10_000
}
fn default_reconnect_initial_delay_ms() -> i64 {
    1_000
}
fn default_reconnect_max_delay_ms() -> i64 {
    30_000
}

/// A named device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceEntry {
    /// MAC address in any accepted notation.
    pub address: String,

    /// Display name. Defaults to the alias.
    pub name: Option<String>,

    /// Profile override for this device.
    pub profile: Option<String>,
}

/// A device argument resolved against the config.
#[derive(Debug, Clone)]
pub struct ResolvedDevice {
    pub identity: DeviceIdentity,
    /// Profile named by the device entry, if any.
    pub profile: Option<String>,
}

impl Config {
    /// Look up a profile by name, falling back to `default_profile` and
    /// then to `"default"`.
    pub fn profile(&self, name: Option<&str>) -> Result<(&str, &Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or(DEFAULT_PROFILE);
        self.profiles
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| ConfigError::UnknownProfile { name: name.into() })
    }

    /// Resolve a device alias or a literal MAC address.
    pub fn resolve_device(&self, device: &str) -> Result<ResolvedDevice, ConfigError> {
        if let Some(entry) = self.devices.get(device) {
            let name = entry.name.clone().unwrap_or_else(|| device.to_owned());
            return Ok(ResolvedDevice {
                identity: DeviceIdentity::parse(&entry.address, name)?,
                profile: entry.profile.clone(),
            });
        }

        let address = MacAddress::parse(device).map_err(|_| ConfigError::UnknownDevice {
            device: device.into(),
        })?;
        let name = address.to_string();
        Ok(ResolvedDevice {
            identity: DeviceIdentity::new(address, name),
            profile: None,
        })
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "gattlink", "gattlink").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("gattlink");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load the full Config from `path` + environment.
///
/// A missing file is not an error; defaults and environment still apply.
/// Nested keys use a double underscore, e.g.
/// `GATTLINK_PROFILES__DEFAULT__AUTO_RECONNECT=true`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if it cannot be read.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Translation ─────────────────────────────────────────────────────

/// Build a validated `ConnectionConfig` from a profile.
pub fn profile_to_connection_config(profile: &Profile) -> Result<ConnectionConfig, ConfigError> {
    let config = ConnectionConfig::builder()
        .auto_reconnect(profile.auto_reconnect)
        .discover_services_delay(duration_from_millis(
            "discover_services_delay_ms",
            profile.discover_services_delay_ms,
        )?)
        .connect_timeout(duration_from_millis(
            "connect_timeout_ms",
            profile.connect_timeout_ms,
        )?)
        .discover_timeout(duration_from_millis(
            "discover_timeout_ms",
            profile.discover_timeout_ms,
        )?)
        .reconnect_initial_delay(duration_from_millis(
            "reconnect_initial_delay_ms",
            profile.reconnect_initial_delay_ms,
        )?)
        .reconnect_max_delay(duration_from_millis(
            "reconnect_max_delay_ms",
            profile.reconnect_max_delay_ms,
        )?)
        .max_reconnect_attempts(profile.max_reconnect_attempts)
        .reconnect_immediate_attempts(profile.reconnect_immediate_attempts)
        .build()?;
    Ok(config)
}
