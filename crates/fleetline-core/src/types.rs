//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a coordinated instance.
///
/// An instance is the pairing of a module (the child process kind) and a
/// device (the physical resource it owns), e.g. `serial:ttyUSB0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    /// Create an instance id from a module id and device id, joined as
    /// `module:device`.
    pub fn new(module_id: impl AsRef<str>, device_id: impl AsRef<str>) -> Self {
        Self(format!("{}:{}", module_id.as_ref(), device_id.as_ref()))
    }

    /// Create an instance id from an already-composed string.
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split the composed id back into its module and device parts, if the
    /// id follows the `module:device` convention.
    pub fn split(&self) -> Option<(&str, &str)> {
        self.0.split_once(':')
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_new_joins_module_and_device() {
        let id = InstanceId::new("DRT", "ACM0");
        assert_eq!(id.as_str(), "DRT:ACM0");
    }

    #[test]
    fn test_instance_id_split_roundtrip() {
        let id = InstanceId::new("DRT", "ACM0");
        assert_eq!(id.split(), Some(("DRT", "ACM0")));
    }

    #[test]
    fn test_instance_id_split_without_separator() {
        let id = InstanceId::from_raw("nodelimiter");
        assert_eq!(id.split(), None);
    }

    #[test]
    fn test_instance_id_display() {
        let id = InstanceId::new("DRT", "ACM0");
        assert_eq!(format!("{}", id), "DRT:ACM0");
    }
}
