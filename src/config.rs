//! Operator configuration.
//!
//! A single YAML document. Only the deploy repository block is required;
//! everything else falls back to the defaults in [`crate::constants`].

use crate::constants::{
    CACHE_NAMESPACE, DEFAULT_MAX_ATTEMPTS, DEFAULT_REQUEUE_BASE, DEFAULT_REQUEUE_MAX, DEFAULT_TICK_TIMEOUT,
    MAX_FILE_BYTES, MAX_FILE_COUNT, MAX_MANIFEST_BYTES, MAX_TOTAL_EXTRACT_BYTES,
};
use crate::error::{Error, Result};
use crate::extract::ExtractLimits;
use crate::logs::{LogFormat, LogLevel, LogOptions};
use crate::verify::CosignOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable naming the config file when no path is given.
pub const CONFIG_ENV: &str = "FORGE_OPERATOR_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    pub deployer: DeployerConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    #[serde(default = "default_tick_timeout_secs")]
    pub tick_timeout_secs: u64,

    #[serde(default)]
    pub requeue: RequeueConfig,

    #[serde(default)]
    pub kcl: KclConfig,

    #[serde(default)]
    pub helm: HelmConfig,

    #[serde(default)]
    pub oci: OciConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// Where rendered manifests are pushed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployerConfig {
    pub git: GitConfig,
    pub root_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    pub url: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub creds: Option<SecretRef>,
}

/// Pointer into a [`crate::secrets::SecretStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub provider: String,
    pub path: String,
    #[serde(default = "default_secret_key")]
    pub key: String,
}

fn default_secret_key() -> String {
    "token".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub url: String,
    /// Environment variable holding a bearer token.
    #[serde(default)]
    pub token_env: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequeueConfig {
    pub base_secs: u64,
    pub max_secs: u64,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            base_secs: DEFAULT_REQUEUE_BASE.as_secs(),
            max_secs: DEFAULT_REQUEUE_MAX.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KclConfig {
    #[serde(default = "default_kcl_binary")]
    pub binary: String,
    /// Where pulled KCL modules are cached. Defaults under `cache_dir`.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
}

impl Default for KclConfig {
    fn default() -> Self {
        Self {
            binary: default_kcl_binary(),
            cache_path: None,
        }
    }
}

fn default_kcl_binary() -> String {
    "kcl".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelmConfig {
    #[serde(default = "default_helm_binary")]
    pub binary: String,
}

impl Default for HelmConfig {
    fn default() -> Self {
        Self {
            binary: default_helm_binary(),
        }
    }
}

fn default_helm_binary() -> String {
    "helm".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciConfig {
    #[serde(default = "default_max_manifest_bytes")]
    pub max_manifest_bytes: u64,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: u64,
    #[serde(default = "default_max_file_count")]
    pub max_file_count: u64,
    #[serde(default)]
    pub verify: Option<CosignOptions>,
}

impl Default for OciConfig {
    fn default() -> Self {
        Self {
            max_manifest_bytes: MAX_MANIFEST_BYTES,
            max_file_bytes: MAX_FILE_BYTES,
            max_total_bytes: MAX_TOTAL_EXTRACT_BYTES,
            max_file_count: MAX_FILE_COUNT,
            verify: None,
        }
    }
}

impl OciConfig {
    pub fn limits(&self) -> ExtractLimits {
        ExtractLimits {
            max_manifest_bytes: self.max_manifest_bytes,
            max_file_bytes: self.max_file_bytes,
            max_total_bytes: self.max_total_bytes,
            max_file_count: self.max_file_count,
        }
    }
}

fn default_max_manifest_bytes() -> u64 {
    MAX_MANIFEST_BYTES
}

fn default_max_file_bytes() -> u64 {
    MAX_FILE_BYTES
}

fn default_max_total_bytes() -> u64 {
    MAX_TOTAL_EXTRACT_BYTES
}

fn default_max_file_count() -> u64 {
    MAX_FILE_COUNT
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
}

impl From<&LogConfig> for LogOptions {
    fn from(cfg: &LogConfig) -> Self {
        LogOptions {
            level: cfg.level,
            format: cfg.format,
        }
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(CACHE_NAMESPACE)
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("forge-operator")
}

fn default_tick_timeout_secs() -> u64 {
    DEFAULT_TICK_TIMEOUT.as_secs()
}

impl OperatorConfig {
    /// Reads, parses, and validates a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config = Self::parse(&raw)?;
        debug!(path = %path.display(), "Loaded operator config");
        Ok(config)
    }

    /// Parses and validates YAML.
    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(raw).map_err(|e| Error::Config(format!("invalid operator config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolves the config path from an explicit flag or `FORGE_OPERATOR_CONFIG`.
    pub fn resolve_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
        explicit
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .ok_or_else(|| Error::Config(format!("no config given: pass --config or set {}", CONFIG_ENV)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.deployer.git.url.trim().is_empty() {
            return Err(Error::Config("deployer.git.url cannot be empty".to_string()));
        }
        if self.deployer.git.git_ref.trim().is_empty() {
            return Err(Error::Config("deployer.git.ref cannot be empty".to_string()));
        }
        if self.deployer.root_dir.trim().is_empty() {
            return Err(Error::Config("deployer.root_dir cannot be empty".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be positive".to_string()));
        }
        if self.tick_timeout_secs == 0 {
            return Err(Error::Config("tick_timeout_secs must be positive".to_string()));
        }
        if self.requeue.base_secs == 0 || self.requeue.max_secs < self.requeue.base_secs {
            return Err(Error::Config("requeue.base_secs must be positive and <= max_secs".to_string()));
        }

        let oci = &self.oci;
        if oci.max_manifest_bytes == 0 || oci.max_file_bytes == 0 || oci.max_total_bytes == 0 || oci.max_file_count == 0
        {
            return Err(Error::Config("oci limits must be positive".to_string()));
        }

        Ok(())
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_secs(self.tick_timeout_secs)
    }

    pub fn requeue_base(&self) -> Duration {
        Duration::from_secs(self.requeue.base_secs)
    }

    pub fn requeue_max(&self) -> Duration {
        Duration::from_secs(self.requeue.max_secs)
    }

    /// Cache for pulled KCL modules.
    pub fn kcl_cache_path(&self) -> PathBuf {
        self.kcl
            .cache_path
            .clone()
            .unwrap_or_else(|| self.cache_dir.join("kcl"))
    }

    /// Bearer token from `api.token_env`, when set and present.
    pub fn api_token(&self) -> Option<String> {
        self.api
            .token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty())
    }
}
