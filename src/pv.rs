//! Conversion of device records into Kubernetes persistent volumes
//!
//! The volume uses the `dysk/dysk` flex volume driver, which mounts the blob
//! on the node using the account credentials held in a secret.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::device::{AccessMode, DeviceRecord};
use crate::error::{DyskError, Result};
use crate::store::BlobRef;

/// Flex volume driver name
pub const FLEX_DRIVER: &str = "dysk/dysk";

/// Options of the generated volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvOptions {
    pub secret_name: String,
    pub secret_namespace: Option<String>,
    pub namespace: Option<String>,
    pub reclaim_policy: String,
    pub access_mode: String,
    pub fs_type: Option<String>,
    pub storage_class: Option<String>,
    /// Forces a read-only volume even for a read-write record
    pub read_only: bool,
    pub labels: BTreeMap<String, String>,
}

impl Default for PvOptions {
    fn default() -> Self {
        Self {
            secret_name: String::new(),
            secret_namespace: None,
            namespace: None,
            reclaim_policy: "Retain".to_string(),
            access_mode: "ReadWriteOnce".to_string(),
            fs_type: Some("ext4".to_string()),
            storage_class: None,
            read_only: false,
            labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolume {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PersistentVolumeSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeSpec {
    pub access_modes: Vec<String>,
    pub capacity: Capacity,
    pub persistent_volume_reclaim_policy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    pub flex_volume: FlexVolume,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capacity {
    pub storage: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlexVolume {
    pub driver: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
    pub read_only: bool,
    pub secret_ref: SecretRef,
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretRef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Parse `k1=v1,k2=v2`. An empty string yields no labels.
pub fn parse_labels(input: &str) -> Result<BTreeMap<String, String>> {
    input
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(DyskError::Validation(format!(
                "Invalid label {}. Must be key=value",
                pair
            ))),
        })
        .collect()
}

/// Build the persistent volume for `record`
pub fn to_persistent_volume(record: &DeviceRecord, options: &PvOptions) -> Result<PersistentVolume> {
    if options.secret_name.is_empty() {
        return Err(DyskError::Validation("secretName is required".to_string()));
    }
    let blob = BlobRef::parse(&record.path)?;

    let flex_options = BTreeMap::from([
        ("accountName".to_string(), record.account_name.clone()),
        ("container".to_string(), blob.container),
        ("blob".to_string(), blob.name),
    ]);

    Ok(PersistentVolume {
        api_version: "v1".to_string(),
        kind: "PersistentVolume".to_string(),
        metadata: ObjectMeta {
            name: record.name.to_lowercase(),
            namespace: options.namespace.clone().filter(|n| !n.is_empty()),
            labels: options.labels.clone(),
        },
        spec: PersistentVolumeSpec {
            access_modes: vec![options.access_mode.clone()],
            capacity: Capacity {
                storage: format!("{}Gi", record.size_gb),
            },
            persistent_volume_reclaim_policy: options.reclaim_policy.clone(),
            storage_class_name: options.storage_class.clone().filter(|s| !s.is_empty()),
            flex_volume: FlexVolume {
                driver: FLEX_DRIVER.to_string(),
                fs_type: options.fs_type.clone().filter(|f| !f.is_empty()),
                read_only: record.mode == AccessMode::ReadOnly || options.read_only,
                secret_ref: SecretRef {
                    name: options.secret_name.clone(),
                    namespace: options.secret_namespace.clone().filter(|n| !n.is_empty()),
                },
                options: flex_options,
            },
        },
    })
}
