//! Removal of server-assigned state from captured objects.
//!
//! Two captures of an unchanged object must serialize to the same bytes,
//! so everything the API server fills in on its own is dropped here.

use serde_json::{Map, Value};

/// Metadata fields assigned by the API server.
const SERVER_ASSIGNED_FIELDS: &[&str] = &[
    "resourceVersion",
    "uid",
    "generation",
    "selfLink",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "managedFields",
];

/// Written by `kubectl apply`.
const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Annotations injected by controllers at runtime.
const RUNTIME_ANNOTATION_PREFIXES: &[&str] = &[
    "deployment.kubernetes.io/",
    "autoscaling.alpha.kubernetes.io/",
];

/// Strip non-reproducible fields. Objects without metadata pass through.
pub fn normalize(mut object: Value) -> Value {
    if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        normalize_metadata(metadata);
    }
    object
}

fn normalize_metadata(metadata: &mut Map<String, Value>) {
    for field in SERVER_ASSIGNED_FIELDS {
        metadata.remove(*field);
    }

    let annotations_empty = match metadata.get_mut("annotations").and_then(Value::as_object_mut) {
        Some(annotations) => {
            annotations.retain(|key, _| !is_runtime_annotation(key));
            annotations.is_empty()
        }
        None => false,
    };
    if annotations_empty {
        metadata.remove("annotations");
    }
}

fn is_runtime_annotation(key: &str) -> bool {
    key == LAST_APPLIED_ANNOTATION
        || RUNTIME_ANNOTATION_PREFIXES
            .iter()
            .any(|prefix| key.starts_with(prefix))
}
