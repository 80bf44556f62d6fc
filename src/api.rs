//! # Foundry API Client
//!
//! The operator's view of release deployments lives in the Foundry API, not
//! in the cluster. The reconciler reads and writes it through [`ReleaseApi`].
//!
//! | Operation          | HTTP                                         |
//! |--------------------|----------------------------------------------|
//! | `get_deployment`   | `GET  {base}/deployments/{rid}/{did}`        |
//! | `update_deployment`| `PUT  {base}/deployments/{rid}`              |
//! | `add_event`        | `POST {base}/deployments/{rid}/{did}/events` |
//!
//! A 404 maps to [`Error::NotFound`]; any other failure is
//! [`Error::TransportError`] so the reconciler requeues.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("forge-operator/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Models
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: String,
    pub source_repo: String,
    pub source_commit: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_branch: String,
    pub project: String,
    pub project_path: String,
    /// Base64 bundle source overriding the blueprint. Empty means none.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bundle: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseDeployment {
    pub id: String,
    pub release_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: DeploymentStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<Release>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<DeploymentEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct EventRequest<'a> {
    name: &'a str,
    message: &'a str,
}

// =============================================================================
// Client Trait
// =============================================================================

#[async_trait]
pub trait ReleaseApi: Send + Sync {
    async fn get_deployment(&self, release_id: &str, deploy_id: &str) -> Result<ReleaseDeployment>;

    async fn update_deployment(&self, release_id: &str, deployment: &ReleaseDeployment) -> Result<ReleaseDeployment>;

    /// Appends an event. The server assigns the timestamp.
    async fn add_event(&self, release_id: &str, deploy_id: &str, name: &str, message: &str) -> Result<ReleaseDeployment>;
}

// =============================================================================
// HTTP Implementation
// =============================================================================

pub struct HttpReleaseApi {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl HttpReleaseApi {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "Foundry API request");

        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<ReleaseDeployment> {
        let response = builder.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::TransportError(format!("{}: {} {}", what, status, body.trim())));
        }

        response
            .json::<ReleaseDeployment>()
            .await
            .map_err(|e| Error::TransportError(format!("{}: invalid response: {}", what, e)))
    }
}

#[async_trait]
impl ReleaseApi for HttpReleaseApi {
    async fn get_deployment(&self, release_id: &str, deploy_id: &str) -> Result<ReleaseDeployment> {
        let path = format!("/deployments/{}/{}", release_id, deploy_id);
        let what = format!("deployment {}/{}", release_id, deploy_id);
        self.send(self.request(reqwest::Method::GET, &path), &what).await
    }

    async fn update_deployment(&self, release_id: &str, deployment: &ReleaseDeployment) -> Result<ReleaseDeployment> {
        let path = format!("/deployments/{}", release_id);
        let what = format!("deployment {}/{}", release_id, deployment.id);
        self.send(self.request(reqwest::Method::PUT, &path).json(deployment), &what)
            .await
    }

    async fn add_event(&self, release_id: &str, deploy_id: &str, name: &str, message: &str) -> Result<ReleaseDeployment> {
        let path = format!("/deployments/{}/{}/events", release_id, deploy_id);
        let what = format!("events for {}/{}", release_id, deploy_id);
        let body = EventRequest { name, message };
        self.send(self.request(reqwest::Method::POST, &path).json(&body), &what)
            .await
    }
}

// =============================================================================
// In-Memory Implementation
// =============================================================================

/// Process-local API backed by a map. Stamps events and update times itself.
#[derive(Default)]
pub struct MemoryReleaseApi {
    records: RwLock<HashMap<(String, String), ReleaseDeployment>>,
}

impl MemoryReleaseApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, deployment: ReleaseDeployment) {
        if let Ok(mut records) = self.records.write() {
            records.insert((deployment.release_id.clone(), deployment.id.clone()), deployment);
        }
    }

    /// Snapshot of a record, if present.
    pub fn get(&self, release_id: &str, deploy_id: &str) -> Option<ReleaseDeployment> {
        self.records
            .read()
            .ok()?
            .get(&(release_id.to_string(), deploy_id.to_string()))
            .cloned()
    }

    fn with_record<T>(
        &self,
        release_id: &str,
        deploy_id: &str,
        f: impl FnOnce(&mut ReleaseDeployment) -> T,
    ) -> Result<T> {
        let mut records = self
            .records
            .write()
            .map_err(|_| Error::Internal("release store lock poisoned".to_string()))?;
        let record = records
            .get_mut(&(release_id.to_string(), deploy_id.to_string()))
            .ok_or_else(|| Error::NotFound(format!("deployment {}/{}", release_id, deploy_id)))?;
        Ok(f(record))
    }
}

#[async_trait]
impl ReleaseApi for MemoryReleaseApi {
    async fn get_deployment(&self, release_id: &str, deploy_id: &str) -> Result<ReleaseDeployment> {
        self.with_record(release_id, deploy_id, |r| r.clone())
    }

    async fn update_deployment(&self, release_id: &str, deployment: &ReleaseDeployment) -> Result<ReleaseDeployment> {
        self.with_record(release_id, &deployment.id, |r| {
            r.status = deployment.status;
            r.reason = deployment.reason.clone();
            r.attempts = deployment.attempts;
            r.updated_at = Some(Utc::now());
            r.clone()
        })
    }

    async fn add_event(&self, release_id: &str, deploy_id: &str, name: &str, message: &str) -> Result<ReleaseDeployment> {
        self.with_record(release_id, deploy_id, |r| {
            r.events.push(DeploymentEvent {
                name: name.to_string(),
                message: message.to_string(),
                timestamp: Some(Utc::now()),
            });
            r.clone()
        })
    }
}
