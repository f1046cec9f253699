//! Static knowledge about the resource kinds this tool understands.
//!
//! The registry is built once at startup and shared by `Arc`. It answers
//! four questions per kind: where it lives in the API (group/version/plural),
//! whether it is cluster-scoped, which replay tier it belongs to, and which
//! objects of that kind are never worth capturing.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Returns true when a listed object should be left out of a snapshot.
pub type SkipPredicate = fn(&Value) -> bool;

/// Everything the engine needs to list, store and replay one kind.
#[derive(Clone)]
pub struct KindInfo {
    /// CamelCase kind, e.g. `Deployment`
    pub kind: &'static str,

    /// Lower-case plural used in API paths and on the command line
    pub plural: &'static str,

    /// API group, empty for the core group
    pub group: &'static str,

    pub version: &'static str,

    pub cluster_scoped: bool,

    /// Collected when the caller names no kinds explicitly
    pub default_enabled: bool,

    pub skip: Option<SkipPredicate>,
}

impl KindInfo {
    /// `v1` for the core group, `<group>/<version>` otherwise.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn should_skip(&self, object: &Value) -> bool {
        self.skip.map(|skip| skip(object)).unwrap_or(false)
    }
}

impl fmt::Debug for KindInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindInfo")
            .field("kind", &self.kind)
            .field("plural", &self.plural)
            .field("api_version", &self.api_version())
            .field("cluster_scoped", &self.cluster_scoped)
            .field("default_enabled", &self.default_enabled)
            .field("skip", &self.skip.is_some())
            .finish()
    }
}

/// Replay order, lowest tier first. Kinds missing here replay last.
const RESTORE_ORDER: &[&str] = &[
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "PersistentVolume",
    "StorageClass",
    "VolumeSnapshotClass",
    "Namespace",
    "Secret",
    "ConfigMap",
    "ServiceAccount",
    "Role",
    "RoleBinding",
    "PersistentVolumeClaim",
    "NetworkPolicy",
    "Service",
    "Endpoints",
    "Deployment",
    "StatefulSet",
    "DaemonSet",
    "Job",
    "CronJob",
    "ReplicaSet",
    "Pod",
    "Ingress",
    "HorizontalPodAutoscaler",
    "PodDisruptionBudget",
    "Event",
];

const CORE: &str = "";
const APPS: &str = "apps";
const BATCH: &str = "batch";
const RBAC: &str = "rbac.authorization.k8s.io";
const NETWORKING: &str = "networking.k8s.io";
const STORAGE: &str = "storage.k8s.io";
const POLICY: &str = "policy";
const AUTOSCALING: &str = "autoscaling";
const APIEXTENSIONS: &str = "apiextensions.k8s.io";

fn kind(
    kind: &'static str,
    plural: &'static str,
    group: &'static str,
    version: &'static str,
    cluster_scoped: bool,
    default_enabled: bool,
    skip: Option<SkipPredicate>,
) -> KindInfo {
    KindInfo {
        kind,
        plural,
        group,
        version,
        cluster_scoped,
        default_enabled,
        skip,
    }
}

fn object_name(object: &Value) -> &str {
    object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn is_service_account_token(object: &Value) -> bool {
    object.get("type").and_then(Value::as_str) == Some("kubernetes.io/service-account-token")
}

fn is_default_service_account(object: &Value) -> bool {
    object_name(object) == "default"
}

fn is_system_object(object: &Value) -> bool {
    object_name(object).starts_with("system:")
}

fn builtin_kinds() -> Vec<KindInfo> {
    vec![
        // Cluster-scoped
        kind("Namespace", "namespaces", CORE, "v1", true, true, None),
        kind("PersistentVolume", "persistentvolumes", CORE, "v1", true, true, None),
        kind("ClusterRole", "clusterroles", RBAC, "v1", true, true, Some(is_system_object)),
        kind("ClusterRoleBinding", "clusterrolebindings", RBAC, "v1", true, true, Some(is_system_object)),
        kind("StorageClass", "storageclasses", STORAGE, "v1", true, false, None),
        kind("CustomResourceDefinition", "customresourcedefinitions", APIEXTENSIONS, "v1", true, false, None),
        // Namespaced
        kind("Secret", "secrets", CORE, "v1", false, true, Some(is_service_account_token)),
        kind("ConfigMap", "configmaps", CORE, "v1", false, true, None),
        kind("ServiceAccount", "serviceaccounts", CORE, "v1", false, true, Some(is_default_service_account)),
        kind("PersistentVolumeClaim", "persistentvolumeclaims", CORE, "v1", false, true, None),
        kind("Service", "services", CORE, "v1", false, true, None),
        kind("Role", "roles", RBAC, "v1", false, true, None),
        kind("RoleBinding", "rolebindings", RBAC, "v1", false, true, None),
        kind("NetworkPolicy", "networkpolicies", NETWORKING, "v1", false, true, None),
        kind("Ingress", "ingresses", NETWORKING, "v1", false, true, None),
        kind("Deployment", "deployments", APPS, "v1", false, true, None),
        kind("StatefulSet", "statefulsets", APPS, "v1", false, true, None),
        kind("DaemonSet", "daemonsets", APPS, "v1", false, true, None),
        kind("ReplicaSet", "replicasets", APPS, "v1", false, false, None),
        kind("Job", "jobs", BATCH, "v1", false, true, None),
        kind("CronJob", "cronjobs", BATCH, "v1", false, true, None),
        kind("HorizontalPodAutoscaler", "horizontalpodautoscalers", AUTOSCALING, "v2", false, true, None),
        kind("PodDisruptionBudget", "poddisruptionbudgets", POLICY, "v1", false, true, None),
        kind("Pod", "pods", CORE, "v1", false, false, None),
    ]
}

/// Plurals for kinds that are known by name but not collected.
const EXTRA_PLURALS: &[(&str, &str)] = &[
    ("endpoints", "endpoints"),
    ("event", "events"),
    ("volumesnapshotclass", "volumesnapshotclasses"),
];

/// Immutable lookup tables for every supported kind.
#[derive(Debug)]
pub struct KindRegistry {
    kinds: Vec<KindInfo>,
    by_kind: HashMap<&'static str, usize>,
    tiers: HashMap<&'static str, usize>,
    plurals: HashMap<String, String>,
}

impl KindRegistry {
    /// The built-in Kubernetes kinds.
    pub fn builtin() -> Self {
        Self::from_kinds(builtin_kinds())
    }

    pub fn from_kinds(kinds: Vec<KindInfo>) -> Self {
        let by_kind = kinds
            .iter()
            .enumerate()
            .map(|(idx, info)| (info.kind, idx))
            .collect();

        let tiers = RESTORE_ORDER
            .iter()
            .enumerate()
            .map(|(tier, kind)| (*kind, tier))
            .collect();

        let mut plurals: HashMap<String, String> = EXTRA_PLURALS
            .iter()
            .map(|(singular, plural)| (singular.to_string(), plural.to_string()))
            .collect();
        for info in &kinds {
            plurals.insert(info.kind.to_lowercase(), info.plural.to_string());
        }

        Self {
            kinds,
            by_kind,
            tiers,
            plurals,
        }
    }

    /// Look up a kind by its CamelCase name.
    pub fn get(&self, kind: &str) -> Option<&KindInfo> {
        self.by_kind.get(kind).map(|&idx| &self.kinds[idx])
    }

    pub fn all(&self) -> &[KindInfo] {
        &self.kinds
    }

    pub fn is_cluster_scoped(&self, kind: &str) -> bool {
        self.get(kind).map(|info| info.cluster_scoped).unwrap_or(false)
    }

    /// Replay tier; unknown kinds share the tier after every known one.
    pub fn tier(&self, kind: &str) -> usize {
        self.tiers.get(kind).copied().unwrap_or(RESTORE_ORDER.len())
    }

    /// Plural form of a lower-case kind, falling back to appending `s`.
    pub fn plural(&self, lowercase_kind: &str) -> String {
        self.plurals
            .get(lowercase_kind)
            .cloned()
            .unwrap_or_else(|| format!("{lowercase_kind}s"))
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
