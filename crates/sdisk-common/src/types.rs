//! Persisted records and the remote manifest schema

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DiskError, DiskResult};

/// Persisted state of one disk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub name: String,
    pub size_gb: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub is_mounted: bool,
    pub mount_path: Option<String>,
    pub in_remote: bool,
    pub checksum: Option<String>,
    /// Layer whose contents the working image continues, if any
    #[serde(default)]
    pub working_layer_id: Option<String>,
}

impl DiskRecord {
    /// Fresh record for a newly created disk
    pub fn new(name: impl Into<String>, size_gb: u64) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            size_gb,
            created_at: now,
            modified_at: now,
            is_mounted: false,
            mount_path: None,
            in_remote: false,
            checksum: None,
            working_layer_id: None,
        }
    }

    /// Bump the modification time
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}

/// A cached, immutable layer blob shared between disks
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub id: String,
    pub checksum: String,
    pub size: u64,
    pub cached_at: DateTime<Utc>,
    pub ref_count: u32,
}

impl LayerRecord {
    pub fn new(id: impl Into<String>, checksum: impl Into<String>, size: u64) -> Self {
        Self {
            id: id.into(),
            checksum: checksum.into(),
            size,
            cached_at: Utc::now(),
            ref_count: 1,
        }
    }
}

/// Position of a layer in a disk's chain (0 = base)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskLayerMapping {
    pub disk_name: String,
    pub layer_id: String,
    pub position: u32,
}

/// One entry of a remote manifest's layer list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestLayer {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub created: DateTime<Utc>,
    pub size: u64,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Per-disk document stored at `disks/<name>/metadata.json`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteManifest {
    pub name: String,
    pub size_gb: u64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<ManifestLayer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_layer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_layer_id: Option<String>,
}

impl RemoteManifest {
    /// Manifest with no layers yet
    pub fn new(name: impl Into<String>, size_gb: u64, created: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            size_gb,
            created,
            modified: Utc::now(),
            checksum: String::new(),
            layers: Vec::new(),
            base_layer_id: None,
            top_layer_id: None,
        }
    }

    /// The topmost layer entry
    #[must_use]
    pub fn top(&self) -> Option<&ManifestLayer> {
        self.layers.last()
    }

    /// Append a layer on top of the current top and update the id pointers
    pub fn push_layer(&mut self, mut layer: ManifestLayer) {
        layer.parent_id = self.top().map(|l| l.id.clone());
        if self.layers.is_empty() {
            self.base_layer_id = Some(layer.id.clone());
        }
        self.top_layer_id = Some(layer.id.clone());
        self.layers.push(layer);
    }

    /// Layer ids from base to top
    #[must_use]
    pub fn layer_ids(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.id.clone()).collect()
    }

    pub fn to_json(&self) -> DiskResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> DiskResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| DiskError::integrity(format!("malformed manifest: {e}")))
    }
}

/// Summary returned by disk listing and `Disk::info`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub name: String,
    pub size_gb: u64,
    /// Bytes allocated by the working image, 0 when unknown
    pub actual_size: u64,
    pub is_mounted: bool,
    pub mount_path: Option<String>,
    pub in_remote: bool,
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl DiskInfo {
    pub fn from_record(record: &DiskRecord, actual_size: u64) -> Self {
        Self {
            name: record.name.clone(),
            size_gb: record.size_gb,
            actual_size,
            is_mounted: record.is_mounted,
            mount_path: record.mount_path.clone(),
            in_remote: record.in_remote,
            checksum: record.checksum.clone(),
            created_at: record.created_at,
            modified_at: record.modified_at,
        }
    }
}

/// Generate a new layer id
#[must_use]
pub fn new_layer_id() -> String {
    format!("layer-{}", Uuid::new_v4().simple())
}

/// Reject names that cannot be used as a path component or object key segment
pub fn validate_disk_name(name: &str) -> DiskResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(DiskError::InvalidArgument(format!("invalid disk name: {name:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(id: &str) -> ManifestLayer {
        ManifestLayer {
            id: id.to_string(),
            parent_id: None,
            created: Utc::now(),
            size: 10,
            checksum: "c".into(),
            description: String::new(),
        }
    }

    #[test]
    fn test_push_layer_links_parents() {
        let mut manifest = RemoteManifest::new("vol", 10, Utc::now());
        manifest.push_layer(layer("a"));
        manifest.push_layer(layer("b"));

        assert_eq!(manifest.base_layer_id.as_deref(), Some("a"));
        assert_eq!(manifest.top_layer_id.as_deref(), Some("b"));
        assert_eq!(manifest.layers[0].parent_id, None);
        assert_eq!(manifest.layers[1].parent_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_manifest_json_shape() {
        let mut manifest = RemoteManifest::new("vol", 10, Utc::now());
        let json: serde_json::Value =
            serde_json::from_slice(&manifest.to_json().unwrap()).unwrap();
        assert!(json.get("layers").is_none());
        assert!(json.get("top_layer_id").is_none());

        manifest.push_layer(layer("a"));
        let json: serde_json::Value =
            serde_json::from_slice(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(json["size_gb"], 10);
        assert_eq!(json["layers"][0]["id"], "a");
        assert!(json["layers"][0].get("parent_id").is_none());
        assert_eq!(json["base_layer_id"], "a");

        let back = RemoteManifest::from_json(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn test_malformed_manifest_is_integrity_error() {
        let err = RemoteManifest::from_json(b"{\"name\": 1}").unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_disk_record_defaults_working_layer() {
        let record = DiskRecord::new("vol", 4);
        let mut json: serde_json::Value = serde_json::to_value(&record).unwrap();
        json.as_object_mut().unwrap().remove("working_layer_id");
        let back: DiskRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.working_layer_id, None);
    }

    #[test]
    fn test_validate_disk_name() {
        assert!(validate_disk_name("sandbox-01_a.b").is_ok());
        assert!(validate_disk_name("").is_err());
        assert!(validate_disk_name("..").is_err());
        assert!(validate_disk_name("a/b").is_err());
        assert!(validate_disk_name("a b").is_err());
    }

    #[test]
    fn test_layer_ids_are_unique() {
        let a = new_layer_id();
        let b = new_layer_id();
        assert!(a.starts_with("layer-"));
        assert_ne!(a, b);
    }
}
