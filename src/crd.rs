//! `ReleaseDeployment` custom resource.
//!
//! The cluster object only records intent (`id`, `release_id`, `ttl`) and
//! a mirror of the terminal outcome. The authoritative deployment state
//! lives in the Foundry API.

use crate::constants::DEFAULT_TTL_SECONDS;
use chrono::{DateTime, TimeDelta, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type set after the API record loads (or fails to).
pub const CONDITION_LOADED: &str = "Loaded";
/// Condition type reflecting the latest tick's outcome.
pub const CONDITION_READY: &str = "Ready";

fn default_ttl() -> i64 {
    DEFAULT_TTL_SECONDS
}

/// Desired state of a release deployment.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "ReleaseDeployment",
    group = "foundry.projectcatalyst.io",
    version = "v1alpha1",
    plural = "releasedeployments",
    shortname = "rd",
    namespaced,
    status = "ReleaseDeploymentStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
pub struct ReleaseDeploymentSpec {
    /// Deployment id in the Foundry API.
    pub id: String,
    pub release_id: String,
    /// Seconds a terminal resource is kept before deletion.
    #[serde(default = "default_ttl")]
    #[schemars(range(min = 0))]
    pub ttl: i64,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum DeploymentState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl DeploymentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl From<crate::api::DeploymentStatus> for DeploymentState {
    fn from(status: crate::api::DeploymentStatus) -> Self {
        use crate::api::DeploymentStatus;
        match status {
            DeploymentStatus::Pending => Self::Pending,
            DeploymentStatus::Running => Self::Running,
            DeploymentStatus::Succeeded => Self::Succeeded,
            DeploymentStatus::Failed => Self::Failed,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseDeploymentStatus {
    #[serde(default)]
    pub state: DeploymentState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    /// `True` or `False`.
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(type_: &str, ok: bool, reason: &str, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            type_: type_.to_string(),
            status: if ok { "True" } else { "False" }.to_string(),
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: now,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

impl ReleaseDeploymentStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Replaces the condition of the same type. The transition time is kept
    /// when the status did not flip. Returns whether anything changed.
    pub fn merge_condition(&mut self, mut condition: Condition) -> bool {
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                if *existing == condition {
                    return false;
                }
                *existing = condition;
                true
            }
            None => {
                self.conditions.push(condition);
                true
            }
        }
    }
}

impl ReleaseDeployment {
    /// Status, creating an empty one if absent.
    pub fn status_mut(&mut self) -> &mut ReleaseDeploymentStatus {
        self.status.get_or_insert_with(Default::default)
    }

    pub fn state(&self) -> DeploymentState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn completion_time(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.completion_time)
    }

    /// TTL in whole seconds, never negative. Values past what a
    /// `TimeDelta` can hold saturate to `TimeDelta::MAX`.
    pub fn ttl(&self) -> TimeDelta {
        TimeDelta::try_seconds(self.spec.ttl.max(0)).unwrap_or(TimeDelta::MAX)
    }

    /// When the resource may be deleted. `None` if it never expires.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.completion_time()?.checked_add_signed(self.ttl())
    }
}

/// CRD manifest as YAML.
pub fn crd_yaml() -> crate::error::Result<String> {
    use kube::CustomResourceExt;
    Ok(serde_yaml::to_string(&ReleaseDeployment::crd())?)
}
