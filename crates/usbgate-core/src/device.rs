//! Normalised identifiers for removable storage devices.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::GateError;

/// Hardware serial of a removable storage device, normalised to uppercase
/// ASCII alphanumerics.
///
/// Two identifiers compare equal iff their normalised forms match, so
/// `"ab-12 3"` and `"AB123"` name the same device. The empty string is never a
/// valid identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Normalise `raw`, returning `None` when nothing identifying remains.
    pub fn new(raw: &str) -> Option<Self> {
        let normalised: String = raw
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|ch| ch.to_ascii_uppercase())
            .collect();
        if normalised.is_empty() {
            None
        } else {
            Some(Self(normalised))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceId {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceId::new(s).ok_or_else(|| {
            GateError::InvalidConfig(format!("`{s}` contains no alphanumeric characters"))
        })
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DeviceId::new(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid device identifier `{raw}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalises_case_and_punctuation() {
        let id = DeviceId::new("4c53-0001 1103_lx").unwrap();
        assert_eq!(id.as_str(), "4C5300011103LX");
        assert_eq!(id, DeviceId::new("4C530001 1103LX").unwrap());
    }

    #[test]
    fn rejects_identifiers_without_alphanumerics() {
        assert!(DeviceId::new("").is_none());
        assert!(DeviceId::new(" &-_ ").is_none());
        assert!("--".parse::<DeviceId>().is_err());
    }

    #[test]
    fn non_ascii_characters_are_dropped() {
        let id = DeviceId::new("çab1").unwrap();
        assert_eq!(id.as_str(), "AB1");
    }

    #[test]
    fn deserialises_through_normalisation() {
        let ids: Vec<DeviceId> = serde_json::from_str(r#"["abc-123", "DEF456"]"#).unwrap();
        assert_eq!(ids[0].as_str(), "ABC123");
        assert_eq!(ids[1].as_str(), "DEF456");
        assert_eq!(serde_json::to_string(&ids).unwrap(), r#"["ABC123","DEF456"]"#);
    }
}
