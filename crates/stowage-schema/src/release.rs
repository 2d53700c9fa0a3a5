//! Release manifest wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::manifest::MANIFEST_VERSION;
use crate::types::{Component, ComponentType, ReleaseVersion, Version};

/// An ordered set of component references published under one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseManifest {
    /// Format version of this document.
    pub manifest_version: String,
    /// Release identity.
    pub release: ReleaseInfo,
    /// Components in publish order.
    pub components: Vec<ComponentRef>,
    /// Free-form user metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// The `release` section of a release manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    /// Release version.
    pub version: ReleaseVersion,
    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// When the release manifest was built.
    pub created_at: DateTime<Utc>,
}

/// Pointer to a published component; does not own its manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRef {
    /// Component type tag.
    #[serde(rename = "type")]
    pub kind: ComponentType,
    /// Component version.
    pub version: Version,
    /// Storage key of the component manifest.
    pub manifest: String,
}

impl ComponentRef {
    /// The `(type, version)` identity referenced.
    pub fn component(&self) -> Component {
        Component::new(self.kind.clone(), self.version.clone())
    }
}

impl ReleaseManifest {
    /// Start a release manifest stamped with the current time.
    pub fn new(version: ReleaseVersion, name: Option<String>) -> Self {
        Self {
            manifest_version: MANIFEST_VERSION.to_string(),
            release: ReleaseInfo {
                version,
                name,
                created_at: Utc::now(),
            },
            components: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_wire_shape() {
        let mut r = ReleaseManifest::new(ReleaseVersion::new("2024.01.20"), None);
        r.components.push(ComponentRef {
            kind: "model".into(),
            version: "1.0.0".into(),
            manifest: "model/1.0.0/model-1.0.0.manifest.json".into(),
        });
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["release"]["version"], "2024.01.20");
        assert!(json["release"].get("name").is_none());
        assert_eq!(json["components"][0]["type"], "model");

        let back: ReleaseManifest = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }
}
