// ── Device identity types ──
//
// MacAddress is the registry key; DeviceIdentity pairs it with the
// human-facing name a scanner reported. Both are immutable once built.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::CoreError;

// ── MacAddress ──────────────────────────────────────────────────────

/// Bluetooth device address, normalized to upper-case colon form
/// (`AA:BB:CC:DD:EE:FF`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(String);

impl MacAddress {
    /// Parse an address from colon-separated, dash-separated, or bare hex.
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, CoreError> {
        let raw = raw.as_ref().trim();
        let invalid = || CoreError::InvalidAddress {
            address: raw.to_owned(),
        };

        let hex: String = if raw.contains(':') || raw.contains('-') {
            let octets: Vec<&str> = raw.split([':', '-']).collect();
            if octets.len() != 6 || octets.iter().any(|o| o.len() != 2) {
                return Err(invalid());
            }
            octets.concat()
        } else {
            raw.to_owned()
        };

        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }

        let upper = hex.to_ascii_uppercase();
        let normalized = upper
            .as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).into_owned())
            .collect::<Vec<_>>()
            .join(":");
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MacAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MacAddress {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.0
    }
}

// ── DeviceIdentity ──────────────────────────────────────────────────

/// Stable identity of one remote device.
///
/// Equality and hashing consider the address only: the same radio seen
/// under two advertised names is still one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub address: MacAddress,
    pub name: String,
}

impl DeviceIdentity {
    pub fn new(address: MacAddress, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
        }
    }

    /// Parse the address and build an identity in one step.
    pub fn parse(address: &str, name: impl Into<String>) -> Result<Self, CoreError> {
        Ok(Self::new(MacAddress::parse(address)?, name))
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for DeviceIdentity {}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{} ({})", self.name, self.address)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn mac_address_normalizes_case_and_dashes() {
        let mac = MacAddress::parse("aa-bb-cc-dd-ee-0f").unwrap();
        assert_eq!(mac.as_str(), "AA:BB:CC:DD:EE:0F");
    }

    #[test]
    fn mac_address_accepts_bare_hex() {
        let mac: MacAddress = "a1b2c3d4e5f6".parse().unwrap();
        assert_eq!(mac.to_string(), "A1:B2:C3:D4:E5:F6");
    }

    #[test]
    fn mac_address_rejects_malformed_input() {
        for raw in ["", "AA:BB:CC:DD:EE", "AA:BB:CC:DD:EE:GG", "AAA:BB:CC:DD:EE:F", "null"] {
            assert!(
                matches!(MacAddress::parse(raw), Err(CoreError::InvalidAddress { .. })),
                "expected {raw:?} to be rejected"
            );
        }
    }

    #[test]
    fn identity_equality_ignores_name() {
        let a = DeviceIdentity::parse("AA:BB:CC:DD:EE:FF", "Thermometer").unwrap();
        let b = DeviceIdentity::parse("aa:bb:cc:dd:ee:ff", "").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn identity_display_includes_name_when_present() {
        let id = DeviceIdentity::parse("AA:BB:CC:DD:EE:FF", "Band").unwrap();
        assert_eq!(id.to_string(), "Band (AA:BB:CC:DD:EE:FF)");
    }

    #[test]
    fn mac_address_deserialize_validates() {
        let ok: MacAddress = serde_json::from_str("\"aa:bb:cc:dd:ee:ff\"").unwrap();
        assert_eq!(ok.as_str(), "AA:BB:CC:DD:EE:FF");
        assert!(serde_json::from_str::<MacAddress>("\"nope\"").is_err());
    }
}
