use serde::{Deserialize, Serialize};

use crate::ErrorKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    AddFeatures,
    DeleteFeatures,
    ChangeAttributes,
    AddAttributes,
    ChangeGeometries,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::AddFeatures,
        Capability::DeleteFeatures,
        Capability::ChangeAttributes,
        Capability::AddAttributes,
        Capability::ChangeGeometries,
    ];

    fn bit(self) -> u8 {
        match self {
            Capability::AddFeatures => 1 << 0,
            Capability::DeleteFeatures => 1 << 1,
            Capability::ChangeAttributes => 1 << 2,
            Capability::AddAttributes => 1 << 3,
            Capability::ChangeGeometries => 1 << 4,
        }
    }
}

/// Bit-set over [`Capability`]. Serialized as a list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<Capability>", into = "Vec<Capability>")]
pub struct Capabilities(u8);

impl Capabilities {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Self::from_iter(Capability::ALL)
    }

    pub fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0 |= capability.bit();
    }

    pub fn remove(&mut self, capability: Capability) {
        self.0 &= !capability.bit();
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.insert(capability);
        self
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        let mut set = Capabilities::empty();
        for capability in iter {
            set.insert(capability);
        }
        set
    }
}

impl From<Vec<Capability>> for Capabilities {
    fn from(value: Vec<Capability>) -> Self {
        value.into_iter().collect()
    }
}

impl From<Capabilities> for Vec<Capability> {
    fn from(value: Capabilities) -> Self {
        value.iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceSystem {
    pub auth_id: String,
}

impl ReferenceSystem {
    pub fn new(auth_id: impl Into<String>) -> Self {
        Self {
            auth_id: auth_id.into(),
        }
    }

    pub fn epsg(code: u32) -> Self {
        Self::new(format!("EPSG:{code}"))
    }

    /// `AUTHORITY:CODE` with a known authority. Numeric codes except for OGC.
    pub fn is_valid(&self) -> bool {
        let Some((authority, code)) = self.auth_id.trim().split_once(':') else {
            return false;
        };
        if code.is_empty() {
            return false;
        }
        match authority.to_ascii_uppercase().as_str() {
            "EPSG" | "ESRI" | "IAU_2015" => code.chars().all(|c| c.is_ascii_digit()),
            "OGC" => code.chars().all(|c| c.is_ascii_alphanumeric()),
            _ => false,
        }
    }
}

impl std::fmt::Display for ReferenceSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.auth_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Read,
    AddFeatures,
    DeleteFeatures,
    ChangeAttributes,
    AddAttributes,
    ChangeGeometries,
    Reproject { target: ReferenceSystem },
}

impl Operation {
    pub fn required_capability(&self) -> Option<Capability> {
        match self {
            Operation::Read | Operation::Reproject { .. } => None,
            Operation::AddFeatures => Some(Capability::AddFeatures),
            Operation::DeleteFeatures => Some(Capability::DeleteFeatures),
            Operation::ChangeAttributes => Some(Capability::ChangeAttributes),
            Operation::AddAttributes => Some(Capability::AddAttributes),
            Operation::ChangeGeometries => Some(Capability::ChangeGeometries),
        }
    }

    pub fn is_mutation(&self) -> bool {
        self.required_capability().is_some()
    }

    pub fn bears_reference_system(&self) -> bool {
        matches!(
            self,
            Operation::ChangeGeometries | Operation::Reproject { .. }
        )
    }

    pub fn target_reference_system(&self) -> Option<&ReferenceSystem> {
        match self {
            Operation::Reproject { target } => Some(target),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::AddFeatures => "add_features",
            Operation::DeleteFeatures => "delete_features",
            Operation::ChangeAttributes => "change_attributes",
            Operation::AddAttributes => "add_attributes",
            Operation::ChangeGeometries => "change_geometries",
            Operation::Reproject { .. } => "reproject",
        }
    }
}

impl From<Capability> for Operation {
    fn from(value: Capability) -> Self {
        match value {
            Capability::AddFeatures => Operation::AddFeatures,
            Capability::DeleteFeatures => Operation::DeleteFeatures,
            Capability::ChangeAttributes => Operation::ChangeAttributes,
            Capability::AddAttributes => Operation::AddAttributes,
            Capability::ChangeGeometries => Operation::ChangeGeometries,
        }
    }
}

/// Outcome of checking one operation against one source for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityReport {
    pub request_id: String,
    pub source_id: Option<String>,
    pub operation: Operation,
    pub is_valid: bool,
    pub supported_operations: Capabilities,
    pub reason_if_invalid: Option<ErrorKind>,
    #[serde(default)]
    pub detail: String,
}

impl CapabilityReport {
    pub fn is_allowed(&self) -> bool {
        self.reason_if_invalid.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_round_trip_through_list_form() {
        let set = Capabilities::empty()
            .with(Capability::AddFeatures)
            .with(Capability::ChangeGeometries);
        let raw = serde_json::to_value(set).expect("serialize");
        assert_eq!(raw, serde_json::json!(["add_features", "change_geometries"]));
        let back: Capabilities = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(back, set);
        assert!(!back.contains(Capability::DeleteFeatures));
    }

    #[test]
    fn reference_system_self_check() {
        assert!(ReferenceSystem::epsg(4326).is_valid());
        assert!(ReferenceSystem::new("OGC:CRS84").is_valid());
        assert!(!ReferenceSystem::new("EPSG:").is_valid());
        assert!(!ReferenceSystem::new("EPSG:43x6").is_valid());
        assert!(!ReferenceSystem::new("wgs84").is_valid());
        assert!(!ReferenceSystem::new("").is_valid());
    }

    #[test]
    fn operations_map_to_capabilities() {
        assert_eq!(Operation::Read.required_capability(), None);
        assert!(!Operation::Read.is_mutation());
        assert!(Operation::DeleteFeatures.is_mutation());
        assert!(Operation::ChangeGeometries.bears_reference_system());
        let reproject = Operation::Reproject {
            target: ReferenceSystem::epsg(3857),
        };
        assert!(reproject.bears_reference_system());
        assert!(!reproject.is_mutation());
        assert_eq!(
            reproject.target_reference_system().map(|r| r.auth_id.as_str()),
            Some("EPSG:3857")
        );
    }
}
