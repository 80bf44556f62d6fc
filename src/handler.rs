//! Deployment handler: the reconciler's window onto one Foundry API record.
//!
//! Status setters round-trip through [`ReleaseApi::update_deployment`] and
//! are no-ops when the record already holds the target status.

use crate::api::{DeploymentStatus, Release, ReleaseApi, ReleaseDeployment};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Event names recorded against a deployment.
pub mod events {
    pub const STARTED: &str = "DeploymentStarted";
    pub const SUCCEEDED: &str = "DeploymentSucceeded";
    pub const FAILED: &str = "DeploymentFailed";
    pub const NO_CHANGES: &str = "DeploymentNoChanges";
    pub const MAX_ATTEMPTS: &str = "DeploymentMaxAttempts";
    pub const LOAD_FAILED: &str = "DeploymentLoadFailed";
    pub const SOURCE_FETCH_FAILED: &str = "SourceFetchFailed";
    pub const BUNDLE_LOAD_FAILED: &str = "BundleLoadFailed";
    pub const DEPLOY_FETCH_FAILED: &str = "DeployFetchFailed";
    pub const CREATE_FAILED: &str = "DeploymentCreateFailed";
    pub const PUSH_FAILED: &str = "DeploymentPushFailed";
}

pub struct DeploymentHandler {
    api: Arc<dyn ReleaseApi>,
    record: Option<ReleaseDeployment>,
}

impl DeploymentHandler {
    pub fn new(api: Arc<dyn ReleaseApi>) -> Self {
        Self { api, record: None }
    }

    /// Fetches the API record for a custom resource's ids.
    pub async fn load(&mut self, release_id: &str, deploy_id: &str) -> Result<()> {
        let record = self.api.get_deployment(release_id, deploy_id).await?;
        debug!(release_id, deploy_id, status = %record.status, attempts = record.attempts, "Loaded deployment");
        self.record = Some(record);
        Ok(())
    }

    fn record(&self) -> Result<&ReleaseDeployment> {
        self.record
            .as_ref()
            .ok_or_else(|| Error::Internal("deployment handler used before load".to_string()))
    }

    fn record_mut(&mut self) -> Result<&mut ReleaseDeployment> {
        self.record
            .as_mut()
            .ok_or_else(|| Error::Internal("deployment handler used before load".to_string()))
    }

    pub fn deployment(&self) -> Option<&ReleaseDeployment> {
        self.record.as_ref()
    }

    pub fn status(&self) -> Option<DeploymentStatus> {
        self.record.as_ref().map(|r| r.status)
    }

    pub fn attempts(&self) -> u32 {
        self.record.as_ref().map_or(0, |r| r.attempts)
    }

    pub fn is_completed(&self) -> bool {
        self.record.as_ref().is_some_and(|r| r.status.is_terminal())
    }

    pub fn max_attempts_reached(&self, max: u32) -> bool {
        self.attempts() >= max
    }

    /// Parent release metadata.
    pub fn release(&self) -> Result<&Release> {
        let record = self.record()?;
        record
            .release
            .as_ref()
            .ok_or_else(|| Error::ValidationFailed(format!("deployment {} has no release", record.id)))
    }

    /// Marks the record Running and counts an attempt.
    ///
    /// `DeploymentStarted` is recorded only for the first attempt.
    pub async fn set_running(&mut self) -> Result<()> {
        if self.attempts() == 0 {
            self.add_event(events::STARTED, "Deployment has started").await?;
        }

        let record = self.record_mut()?;
        record.status = DeploymentStatus::Running;
        record.reason = "Deployment in progress".to_string();
        record.attempts += 1;
        info!(deployment = %record.id, attempt = record.attempts, "Deployment running");

        self.push().await
    }

    pub async fn set_succeeded(&mut self) -> Result<()> {
        self.set_status(DeploymentStatus::Succeeded, "Deployment succeeded").await
    }

    pub async fn set_failed(&mut self, reason: &str) -> Result<()> {
        self.set_status(DeploymentStatus::Failed, reason).await
    }

    pub async fn add_event(&mut self, name: &str, message: &str) -> Result<()> {
        let record = self.record()?;
        let updated = self
            .api
            .add_event(&record.release_id, &record.id, name, message)
            .await?;
        debug!(deployment = %updated.id, event = name, "Recorded event");
        if let Some(current) = self.record.as_mut() {
            current.events = updated.events;
        }
        Ok(())
    }

    async fn set_status(&mut self, status: DeploymentStatus, reason: &str) -> Result<()> {
        let record = self.record_mut()?;
        if record.status == status {
            return Ok(());
        }
        record.status = status;
        record.reason = reason.to_string();
        info!(deployment = %record.id, %status, reason, "Deployment status changed");

        self.push().await
    }

    async fn push(&mut self) -> Result<()> {
        let record = self.record()?;
        let updated = self.api.update_deployment(&record.release_id, record).await?;
        self.record = Some(updated);
        Ok(())
    }
}
