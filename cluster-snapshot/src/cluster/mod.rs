//! Boundary to the remote resource store.
//!
//! The engine only depends on the `ResourceApi` capability set. `http`
//! talks to a Kubernetes API server; `memory` keeps objects in process and
//! is what the tests run against.

pub mod http;
pub mod memory;

use crate::model::KindInfo;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use http::KubeHttpApi;
pub use memory::InMemoryApi;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("API server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid object: {0}")]
    InvalidObject(String),
}

impl ApiError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ApiError::AlreadyExists { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }
}

/// What a create-or-update call ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Updated,
}

/// Operations the engine needs from a resource store, per kind.
///
/// `namespace` is ignored for cluster-scoped kinds. `None` for a namespaced
/// kind in `list` means every namespace.
#[async_trait]
pub trait ResourceApi: Send + Sync {
    /// Free-text version of the store, recorded in snapshot metadata.
    async fn server_version(&self) -> Result<String, ApiError>;

    async fn list(&self, kind: &KindInfo, namespace: Option<&str>) -> Result<Vec<Value>, ApiError>;

    /// `Ok(None)` when the object does not exist.
    async fn get(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>, ApiError>;

    /// Fails with `ApiError::AlreadyExists` when the object is present.
    async fn create(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        object: &Value,
        dry_run: bool,
    ) -> Result<(), ApiError>;

    /// Fails with `ApiError::NotFound` when the object is absent.
    async fn replace(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        object: &Value,
        dry_run: bool,
    ) -> Result<(), ApiError>;

    /// Create, falling back to replace when the object already exists.
    async fn create_or_update(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        object: &Value,
        dry_run: bool,
    ) -> Result<WriteOutcome, ApiError> {
        match self.create(kind, namespace, object, dry_run).await {
            Ok(()) => Ok(WriteOutcome::Created),
            Err(e) if e.is_already_exists() => {
                self.replace(kind, namespace, object, dry_run).await?;
                Ok(WriteOutcome::Updated)
            }
            Err(e) => Err(e),
        }
    }
}

/// `metadata.name` of an object, if any.
pub fn object_name(object: &Value) -> Option<&str> {
    object.pointer("/metadata/name").and_then(Value::as_str)
}
