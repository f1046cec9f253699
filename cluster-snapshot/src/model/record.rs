//! Captured resource records.

use crate::model::kinds::KindInfo;
use crate::utils::{Result, SnapshotError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Manifest entry describing one captured object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordInfo {
    pub api_version: String,
    pub kind: String,

    /// Empty for cluster-scoped objects
    #[serde(default)]
    pub namespace: String,

    pub name: String,

    /// Assigned by the snapshot store on save
    #[serde(default)]
    pub relative_path: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl RecordInfo {
    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }

    /// `Kind namespace/name`, with `cluster` standing in for no namespace.
    pub fn display_name(&self) -> String {
        let scope = if self.is_cluster_scoped() {
            "cluster"
        } else {
            self.namespace.as_str()
        };
        format!("{} {}/{}", self.kind, scope, self.name)
    }
}

/// A captured object: manifest entry plus its serialized content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub info: RecordInfo,
    pub content: Vec<u8>,
}

/// Uniquely identifies a record within one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdentityKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceRecord {
    /// Build a record from an already normalized object.
    ///
    /// Stamps `apiVersion` and `kind` onto the object (list responses leave
    /// them out) and serializes it with sorted keys so identical objects
    /// produce identical bytes.
    pub fn from_object(info: &KindInfo, namespace: &str, mut object: Value) -> Result<Self> {
        let name = object
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .map(str::to_string);

        let conversion_error = |name: &str, reason: &str| SnapshotError::Conversion {
            kind: info.kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let name = match name {
            Some(name) if !name.is_empty() => name,
            _ => return Err(conversion_error("<unnamed>", "object has no metadata.name")),
        };

        let api_version = info.api_version();
        match object.as_object_mut() {
            Some(map) => {
                map.insert("apiVersion".to_string(), Value::String(api_version.clone()));
                map.insert("kind".to_string(), Value::String(info.kind.to_string()));
            }
            None => return Err(conversion_error(&name, "object is not a JSON map")),
        }

        object.sort_all_objects();

        let labels = string_map(&object, "/metadata/labels");
        let annotations = string_map(&object, "/metadata/annotations");

        let content = serde_json::to_vec_pretty(&object)
            .map_err(|e| conversion_error(&name, &e.to_string()))?;

        Ok(Self {
            info: RecordInfo {
                api_version,
                kind: info.kind.to_string(),
                namespace: namespace.to_string(),
                name,
                relative_path: String::new(),
                labels,
                annotations,
            },
            content,
        })
    }

    pub fn identity(&self) -> IdentityKey {
        IdentityKey {
            kind: self.info.kind.clone(),
            namespace: self.info.namespace.clone(),
            name: self.info.name.clone(),
        }
    }

    /// Parse the stored content back into an object.
    pub fn object(&self) -> serde_json::Result<Value> {
        serde_json::from_slice(&self.content)
    }
}

fn string_map(object: &Value, pointer: &str) -> BTreeMap<String, String> {
    object
        .pointer(pointer)
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
