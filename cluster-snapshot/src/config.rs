//! Configuration management for cluster-snapshot.
//!
//! Loads configuration from a TOML file; every field has a default.
//! `KUBE_API_SERVER` and `KUBE_TOKEN` override the API section, and a pod
//! running inside a cluster falls back to its service-account credentials.

use crate::utils::{Result, SnapshotError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub backup: BackupConfig,
    pub restore: RestoreConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API server URL, e.g. `https://10.0.0.1:6443`
    pub server: Option<String>,

    /// Bearer token
    pub token: Option<String>,

    /// File holding the bearer token (read when `token` is unset)
    pub token_file: Option<PathBuf>,

    /// PEM bundle used to verify the server certificate
    pub ca_cert: Option<PathBuf>,

    pub insecure_skip_tls_verify: bool,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding snapshot directories and archives
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub compress: bool,

    /// Namespaces left out unless named explicitly
    pub exclude_namespaces: Vec<String>,

    /// Maximum concurrent collection tasks
    pub max_concurrent_partitions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Default timeout for waiting operations
    pub timeout_secs: u64,

    /// Upper bound on the post-apply pause
    pub wait_ceiling_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            server: None,
            token: None,
            token_file: None,
            ca_cert: None,
            insecure_skip_tls_verify: false,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./backups"),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            compress: true,
            exclude_namespaces: vec![
                "kube-system".to_string(),
                "kube-public".to_string(),
                "kube-node-lease".to_string(),
            ],
            max_concurrent_partitions: 8,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            wait_ceiling_secs: 30,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SnapshotError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SnapshotError::Config(e.to_string()))
    }

    /// Apply environment overrides and in-cluster defaults.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(server) = std::env::var("KUBE_API_SERVER") {
            self.api.server = Some(server);
        }
        if let Ok(token) = std::env::var("KUBE_TOKEN") {
            self.api.token = Some(token);
        }
        if self.api.server.is_none() {
            self.api.apply_in_cluster_defaults();
        }
        self
    }
}

impl ApiConfig {
    /// Fill in the in-cluster service-account settings when running in a pod.
    fn apply_in_cluster_defaults(&mut self) {
        let (Ok(host), Ok(port)) = (
            std::env::var("KUBERNETES_SERVICE_HOST"),
            std::env::var("KUBERNETES_SERVICE_PORT"),
        ) else {
            return;
        };

        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };
        self.server = Some(format!("https://{host}:{port}"));

        let sa_dir = Path::new(SERVICE_ACCOUNT_DIR);
        if self.token.is_none() && self.token_file.is_none() {
            self.token_file = Some(sa_dir.join("token"));
        }
        if self.ca_cert.is_none() {
            self.ca_cert = Some(sa_dir.join("ca.crt"));
        }
    }

    /// The bearer token, reading `token_file` when no inline token is set.
    pub fn bearer_token(&self) -> Result<Option<String>> {
        if let Some(token) = &self.token {
            return Ok(Some(token.clone()));
        }
        match &self.token_file {
            Some(path) => std::fs::read_to_string(path)
                .map(|t| Some(t.trim().to_string()))
                .map_err(|e| {
                    SnapshotError::Config(format!("cannot read token file {}: {}", path.display(), e))
                }),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.storage.base_dir, PathBuf::from("./backups"));
        assert!(config.backup.compress);
        assert_eq!(config.backup.exclude_namespaces.len(), 3);
        assert_eq!(config.restore.wait_ceiling_secs, 30);
        assert_eq!(config.api.request_timeout_secs, 30);
        assert!(config.api.server.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [api]
            server = "https://10.0.0.1:6443"
            token = "abc"

            [backup]
            compress = false
            "#,
        )
        .unwrap();

        assert_eq!(config.api.server.as_deref(), Some("https://10.0.0.1:6443"));
        assert!(!config.backup.compress);
        assert_eq!(config.backup.max_concurrent_partitions, 8);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.api.bearer_token().unwrap().as_deref(), Some("abc"));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            Config::from_toml("[api\nserver = 1"),
            Err(SnapshotError::Config(_))
        ));
    }

    #[test]
    fn test_token_file() -> std::io::Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "secret-token")?;

        let api = ApiConfig {
            token_file: Some(file.path().to_path_buf()),
            ..ApiConfig::default()
        };
        assert_eq!(api.bearer_token().unwrap().as_deref(), Some("secret-token"));
        Ok(())
    }

    #[test]
    fn test_from_file() -> std::io::Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "[storage]\nbase_dir = \"/srv/snapshots\"")?;
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.storage.base_dir, PathBuf::from("/srv/snapshots"));
        Ok(())
    }
}
