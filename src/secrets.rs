//! Secret lookup.
//!
//! Providers:
//! - `local`: `path` names a JSON object file of string values
//! - `env`: `path` names an environment variable, returned as `{"token": value}`

use crate::config::SecretRef;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};

/// Resolves a secret reference to a key/value map.
pub trait SecretStore: Send + Sync {
    fn get(&self, provider: &str, path: &str) -> Result<HashMap<String, String>>;
}

/// Filesystem and environment backed store.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSecretStore;

impl SecretStore for LocalSecretStore {
    fn get(&self, provider: &str, path: &str) -> Result<HashMap<String, String>> {
        match provider {
            "local" => {
                let raw = std::fs::read(path).map_err(|e| Error::NotFound(format!("secret {}: {}", path, e)))?;
                let values: HashMap<String, String> = serde_json::from_slice(&raw)?;
                Ok(values)
            }
            "env" => {
                let value = std::env::var(path).map_err(|_| Error::NotFound(format!("secret env {}", path)))?;
                Ok(HashMap::from([("token".to_string(), value)]))
            }
            other => Err(Error::Config(format!("unknown secret provider: {}", other))),
        }
    }
}

/// In-memory store keyed by `(provider, path)`.
#[derive(Debug, Default)]
pub struct StaticSecretStore {
    entries: RwLock<HashMap<(String, String), HashMap<String, String>>>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, provider: &str, path: &str, values: HashMap<String, String>) {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert((provider.to_string(), path.to_string()), values);
    }
}

impl SecretStore for StaticSecretStore {
    fn get(&self, provider: &str, path: &str) -> Result<HashMap<String, String>> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&(provider.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("secret {}:{}", provider, path)))
    }
}

/// Resolves the git token for a secret reference.
///
/// Failures are logged and yield `None`; the caller proceeds without auth.
pub fn resolve_token(store: &dyn SecretStore, creds: Option<&SecretRef>) -> Option<String> {
    let creds = creds?;
    match store.get(&creds.provider, &creds.path) {
        Ok(values) => match values.get(&creds.key) {
            Some(token) => {
                debug!(provider = %creds.provider, "Resolved git credentials");
                Some(token.clone())
            }
            None => {
                warn!(provider = %creds.provider, key = %creds.key, "Secret has no such key, continuing without auth");
                None
            }
        },
        Err(e) => {
            warn!(provider = %creds.provider, "Failed to resolve git credentials, continuing without auth: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn secret_ref(provider: &str, path: &str) -> SecretRef {
        SecretRef {
            provider: provider.to_string(),
            path: path.to_string(),
            key: "token".to_string(),
        }
    }

    #[test]
    fn test_local_json_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("git.json");
        std::fs::write(&path, r#"{"token": "s3cret"}"#).unwrap();

        let creds = secret_ref("local", path.to_str().unwrap());
        assert_eq!(resolve_token(&LocalSecretStore, Some(&creds)).as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        assert!(matches!(LocalSecretStore.get("vault", "x"), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_secret_yields_no_token() {
        let store = StaticSecretStore::new();
        assert!(resolve_token(&store, Some(&secret_ref("local", "nope"))).is_none());
        assert!(resolve_token(&store, None).is_none());
    }

    #[test]
    fn test_static_store_custom_key() {
        let store = StaticSecretStore::new();
        store.insert(
            "aws",
            "deploy",
            HashMap::from([("password".to_string(), "pw".to_string())]),
        );
        let creds = SecretRef {
            key: "password".to_string(),
            ..secret_ref("aws", "deploy")
        };
        assert_eq!(resolve_token(&store, Some(&creds)).as_deref(), Some("pw"));
    }
}
