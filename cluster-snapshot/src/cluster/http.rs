//! Kubernetes API server client.
//!
//! Plain REST over reqwest: collection paths are derived from the kind's
//! group/version/plural, conflicts come back as 409 with reason
//! `AlreadyExists`, dry runs use `dryRun=All`.

use super::{object_name, ApiError, ResourceApi};
use crate::config::ApiConfig;
use crate::model::KindInfo;
use crate::utils::{Result, SnapshotError};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Page size for list calls
const LIST_PAGE_SIZE: usize = 500;

pub struct KubeHttpApi {
    client: reqwest::Client,
    server: String,
    token: Option<String>,
}

/// Error body returned by the API server.
#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ListBody {
    #[serde(default)]
    items: Vec<Value>,
    #[serde(default)]
    metadata: ListMeta,
}

#[derive(Debug, Default, Deserialize)]
struct ListMeta {
    #[serde(default, rename = "continue")]
    continue_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionBody {
    git_version: String,
}

impl KubeHttpApi {
    /// Build a client from resolved API settings.
    pub fn from_config(config: &ApiConfig) -> Result<Self> {
        let server = config
            .server
            .clone()
            .ok_or_else(|| SnapshotError::Config("no API server configured".to_string()))?;

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify);

        if let Some(ca_path) = &config.ca_cert {
            let pem = std::fs::read(ca_path).map_err(|e| {
                SnapshotError::Config(format!("cannot read CA certificate {}: {}", ca_path.display(), e))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| SnapshotError::Config(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| SnapshotError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
            token: config.bearer_token()?,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.client.request(method, format!("{}{}", self.server, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// `/api/v1` for the core group, `/apis/<group>/<version>` otherwise.
fn group_prefix(kind: &KindInfo) -> String {
    if kind.group.is_empty() {
        format!("/api/{}", kind.version)
    } else {
        format!("/apis/{}/{}", kind.group, kind.version)
    }
}

pub(crate) fn collection_path(kind: &KindInfo, namespace: Option<&str>) -> String {
    let prefix = group_prefix(kind);
    match namespace {
        Some(ns) if !kind.cluster_scoped && !ns.is_empty() => {
            format!("{}/namespaces/{}/{}", prefix, ns, kind.plural)
        }
        _ => format!("{}/{}", prefix, kind.plural),
    }
}

pub(crate) fn object_path(kind: &KindInfo, namespace: Option<&str>, name: &str) -> String {
    format!("{}/{}", collection_path(kind, namespace), name)
}

/// Namespace for a write: the explicit one, else the object's own.
fn write_namespace<'a>(kind: &KindInfo, namespace: Option<&'a str>, object: &'a Value) -> Option<&'a str> {
    if kind.cluster_scoped {
        return None;
    }
    namespace
        .filter(|ns| !ns.is_empty())
        .or_else(|| object.pointer("/metadata/namespace").and_then(Value::as_str))
}

fn required_name<'a>(kind: &KindInfo, object: &'a Value) -> std::result::Result<&'a str, ApiError> {
    object_name(object)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::InvalidObject(format!("{} without metadata.name", kind.kind)))
}

/// Turn a non-success response into an `ApiError`.
async fn error_from_response(response: Response, kind: &KindInfo, name: &str) -> ApiError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let parsed: Option<StatusBody> = serde_json::from_str(&body).ok();
    let message = parsed
        .as_ref()
        .map(|s| s.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or(body);
    let reason = parsed.map(|s| s.reason).unwrap_or_default();

    match status {
        StatusCode::CONFLICT if reason == "AlreadyExists" || reason.is_empty() => {
            ApiError::AlreadyExists {
                kind: kind.kind.to_string(),
                name: name.to_string(),
            }
        }
        StatusCode::NOT_FOUND => ApiError::NotFound {
            kind: kind.kind.to_string(),
            name: name.to_string(),
        },
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => ApiError::Forbidden(message),
        _ => ApiError::Status {
            status: status.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl ResourceApi for KubeHttpApi {
    async fn server_version(&self) -> std::result::Result<String, ApiError> {
        let response = self.request(Method::GET, "/version").send().await?;
        if !response.status().is_success() {
            return Err(ApiError::Status {
                status: response.status().as_u16(),
                message: "version endpoint unavailable".to_string(),
            });
        }
        let body: VersionBody = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        Ok(body.git_version)
    }

    async fn list(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
    ) -> std::result::Result<Vec<Value>, ApiError> {
        let path = collection_path(kind, namespace);
        let mut items = Vec::new();
        let mut continue_token: Option<String> = None;

        loop {
            let mut query = vec![("limit", LIST_PAGE_SIZE.to_string())];
            if let Some(token) = &continue_token {
                query.push(("continue", token.clone()));
            }

            let response = self.request(Method::GET, &path).query(&query).send().await?;
            if !response.status().is_success() {
                return Err(error_from_response(response, kind, kind.plural).await);
            }

            let page: ListBody = response
                .json()
                .await
                .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", path, e)))?;
            items.extend(page.items);

            match page.metadata.continue_token.filter(|t| !t.is_empty()) {
                Some(token) => continue_token = Some(token),
                None => break,
            }
        }

        debug!("Listed {} {} from {}", items.len(), kind.plural, path);
        Ok(items)
    }

    async fn get(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        name: &str,
    ) -> std::result::Result<Option<Value>, ApiError> {
        let path = object_path(kind, namespace, name);
        let response = self.request(Method::GET, &path).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(error_from_response(response, kind, name).await);
        }

        let object = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", path, e)))?;
        Ok(Some(object))
    }

    async fn create(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        object: &Value,
        dry_run: bool,
    ) -> std::result::Result<(), ApiError> {
        let name = required_name(kind, object)?;
        let path = collection_path(kind, write_namespace(kind, namespace, object));

        let mut request = self.request(Method::POST, &path).json(object);
        if dry_run {
            request = request.query(&[("dryRun", "All")]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, kind, name).await);
        }
        Ok(())
    }

    async fn replace(
        &self,
        kind: &KindInfo,
        namespace: Option<&str>,
        object: &Value,
        dry_run: bool,
    ) -> std::result::Result<(), ApiError> {
        let name = required_name(kind, object)?;
        let namespace = write_namespace(kind, namespace, object);

        // PUT needs the live resourceVersion to pass optimistic concurrency.
        let current = self
            .get(kind, namespace, name)
            .await?
            .ok_or_else(|| ApiError::NotFound {
                kind: kind.kind.to_string(),
                name: name.to_string(),
            })?;

        let mut desired = object.clone();
        if let (Some(version), Some(metadata)) = (
            current.pointer("/metadata/resourceVersion").cloned(),
            desired.get_mut("metadata").and_then(Value::as_object_mut),
        ) {
            metadata.insert("resourceVersion".to_string(), version);
        }

        let path = object_path(kind, namespace, name);
        let mut request = self.request(Method::PUT, &path).json(&desired);
        if dry_run {
            request = request.query(&[("dryRun", "All")]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, kind, name).await);
        }
        Ok(())
    }
}
