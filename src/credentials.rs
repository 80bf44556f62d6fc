//! Docker-style registry credential lookup.
//!
//! Reads `config.json` from `$DOCKER_CONFIG` or `~/.docker` and returns
//! basic-auth credentials for a registry host. Credential helpers are not
//! executed; hosts without an inline entry are pulled anonymously.

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use oci_distribution::secrets::RegistryAuth;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuth {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Credentials resolved from a Docker config file.
#[derive(Debug, Default)]
pub struct DockerCredentials {
    entries: HashMap<String, (String, String)>,
}

impl DockerCredentials {
    /// Loads the default Docker config. A missing file yields no entries.
    pub fn load_default() -> Result<Self> {
        match default_config_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Loads credentials from an explicit config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        Self::parse(&raw)
    }

    /// Parses Docker config JSON.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let config: DockerConfig = serde_json::from_slice(raw)?;
        let mut entries = HashMap::new();

        for (host, auth) in config.auths {
            let pair = match (auth.username, auth.password, auth.auth) {
                (Some(user), Some(pass), _) => (user, pass),
                (_, _, Some(encoded)) => decode_auth(&encoded)?,
                _ => continue,
            };
            entries.insert(normalize_host(&host), pair);
        }

        Ok(Self { entries })
    }

    /// Returns the auth to use for `registry`.
    pub fn auth_for(&self, registry: &str) -> RegistryAuth {
        match self.entries.get(&normalize_host(registry)) {
            Some((user, pass)) => {
                debug!(registry, "Using credentials from docker config");
                RegistryAuth::Basic(user.clone(), pass.clone())
            }
            None => RegistryAuth::Anonymous,
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    dirs::home_dir().map(|h| h.join(".docker").join("config.json"))
}

fn decode_auth(encoded: &str) -> Result<(String, String)> {
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Config(format!("invalid docker auth entry: {}", e)))?;
    let text = String::from_utf8(decoded).map_err(|e| Error::Config(format!("invalid docker auth entry: {}", e)))?;
    let (user, pass) = text
        .split_once(':')
        .ok_or_else(|| Error::Config("docker auth entry is not user:password".to_string()))?;
    Ok((user.to_string(), pass.to_string()))
}

/// Strips scheme and path so `https://index.docker.io/v1/` matches `index.docker.io`.
fn normalize_host(host: &str) -> String {
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host);
    let host = host.split('/').next().unwrap_or(host);
    match host {
        "docker.io" | "registry-1.docker.io" => "index.docker.io".to_string(),
        other => other.to_string(),
    }
}
