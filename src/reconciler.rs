//! # ReleaseDeployment Reconciler
//!
//! Drives one `ReleaseDeployment` custom resource through its lifecycle.
//!
//! ```text
//! (created) ─► Pending ─tick─► Running ─ok──► Succeeded ─TTL─► (deleted)
//!                                  └─error─► Failed    ─TTL─► (deleted)
//! ```
//!
//! ## Tick
//!
//! 1. Get the resource; gone means done.
//! 2. Load the Foundry API record. Failure sets `Loaded=False` and requeues
//!    with backoff without touching the state.
//! 3. Completed records only get `completionTime` stamped and, once the TTL
//!    has passed, the resource is deleted. A terminal record never moves.
//! 4. Otherwise: attempt cap, `Running`, source checkout at the pinned
//!    commit, bundle, deploy repo fetched and reset to origin, render,
//!    commit, push.
//!
//! Each failing step has a named event. Transient errors under the attempt
//! cap requeue with exponential backoff; everything else marks the record
//! Failed.
//!
//! ## Concurrency
//!
//! The controller never runs two ticks for the same object. Ticks for
//! different objects may share a cached checkout, so every repository use is
//! wrapped in [`CachedRepos::lock`] for its URL. The source lock is released
//! before the deploy lock is taken.

use crate::api::{Release, ReleaseApi};
use crate::clock::{Clock, SystemClock};
use crate::constants::{DEFAULT_MAX_ATTEMPTS, DEFAULT_REQUEUE_BASE, DEFAULT_REQUEUE_MAX, MAX_TTL_REQUEUE};
use crate::crd::{CONDITION_LOADED, CONDITION_READY, Condition, DeploymentState, ReleaseDeployment};
use crate::deployer::{CreateOptions, Deployer};
use crate::error::{Error, Result};
use crate::git::{CachedRepos, GitAuth, Repo};
use crate::handler::{DeploymentHandler, events};
use crate::module::{Blueprint, ModuleBundle};
use crate::resources::ResourceClient;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const MIN_REQUEUE: Duration = Duration::from_secs(1);

/// What the controller should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Wait for the next change to the object.
    Done,
    Requeue(Duration),
}

/// Where rendered deployments are pushed.
#[derive(Debug, Clone)]
pub struct DeployTarget {
    pub url: String,
    pub git_ref: String,
    pub auth: Option<GitAuth>,
}

// =============================================================================
// Backoff
// =============================================================================

/// Per-object exponential backoff: `min(base * 2^failures, max)`.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Delay for the next retry of `key`, counting this failure.
    pub fn next(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(key.to_string()).or_insert(0);
        let delay = self.base.saturating_mul(2u32.saturating_pow(*count)).min(self.max);
        *count = count.saturating_add(1);
        delay
    }

    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEUE_BASE, DEFAULT_REQUEUE_MAX)
    }
}

// =============================================================================
// Reconciler
// =============================================================================

struct StepFailure {
    event: &'static str,
    error: Error,
}

fn step(event: &'static str) -> impl FnOnce(Error) -> StepFailure {
    move |error| StepFailure { event, error }
}

pub struct Reconciler {
    resources: Arc<dyn ResourceClient>,
    api: Arc<dyn ReleaseApi>,
    deployer: Deployer,
    repos: Arc<CachedRepos>,
    target: DeployTarget,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    backoff: Backoff,
}

impl Reconciler {
    pub fn new(
        resources: Arc<dyn ResourceClient>,
        api: Arc<dyn ReleaseApi>,
        deployer: Deployer,
        repos: Arc<CachedRepos>,
        target: DeployTarget,
    ) -> Self {
        Self {
            resources,
            api,
            deployer,
            repos,
            target,
            clock: Arc::new(SystemClock),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff = Backoff::new(base, max);
        self
    }

    /// Requeue delay after a failed tick for `key`.
    pub fn backoff(&self, key: &str) -> Duration {
        self.backoff.next(key)
    }

    /// Runs one tick for `namespace/name`.
    #[instrument(skip(self, cancel))]
    pub async fn reconcile(&self, cancel: &CancellationToken, namespace: &str, name: &str) -> Result<Outcome> {
        let key = format!("{}/{}", namespace, name);
        let Some(mut resource) = self.resources.get(namespace, name).await? else {
            debug!(resource = %key, "Resource no longer exists");
            self.backoff.reset(&key);
            return Ok(Outcome::Done);
        };

        let mut handler = DeploymentHandler::new(self.api.clone());
        if let Err(e) = handler.load(&resource.spec.release_id, &resource.spec.id).await {
            warn!(resource = %key, event = events::LOAD_FAILED, "Failed to load deployment: {}", e);
            let condition = Condition::new(CONDITION_LOADED, false, events::LOAD_FAILED, e.to_string(), self.clock.now());
            if resource.status_mut().merge_condition(condition) {
                self.resources.update_status(&resource).await?;
            }
            return Ok(Outcome::Requeue(self.backoff.next(&key)));
        }

        let loaded = Condition::new(CONDITION_LOADED, true, "DeploymentLoaded", "", self.clock.now());
        let loaded_changed = resource.status_mut().merge_condition(loaded);

        if handler.is_completed() {
            return self.reconcile_completed(&key, resource, &handler, loaded_changed).await;
        }

        if handler.max_attempts_reached(self.max_attempts) {
            warn!(resource = %key, attempts = handler.attempts(), "Maximum attempts reached");
            handler
                .add_event(events::MAX_ATTEMPTS, "Deployment has reached the maximum number of attempts")
                .await?;
            self.mark_failed(&mut handler, &mut resource, events::MAX_ATTEMPTS, "maximum attempts reached")
                .await?;
            return Ok(self.requeue_at_ttl(&resource));
        }

        handler.set_running().await?;
        resource.status_mut().state = DeploymentState::Running;
        self.resources.update_status(&resource).await?;
        info!(resource = %key, attempt = handler.attempts(), "Deploying release {}", resource.spec.release_id);

        match self.deploy(cancel, &handler, &resource).await {
            Ok(committed) => {
                if !committed {
                    handler
                        .add_event(events::NO_CHANGES, "Deployment repository already up to date")
                        .await?;
                }
                handler.add_event(events::SUCCEEDED, "Deployment has succeeded").await?;
                handler.set_succeeded().await?;

                let now = self.clock.now();
                let status = resource.status_mut();
                status.state = DeploymentState::Succeeded;
                status.completion_time.get_or_insert(now);
                status.merge_condition(Condition::new(CONDITION_READY, true, events::SUCCEEDED, "", now));
                self.resources.update_status(&resource).await?;

                self.backoff.reset(&key);
                info!(resource = %key, "Deployment succeeded");
                Ok(self.requeue_at_ttl(&resource))
            }
            Err(StepFailure { event, error }) => {
                let message = error.to_string();
                warn!(resource = %key, event, "Deployment step failed: {}", message);
                handler.add_event(event, &message).await?;

                if error.is_transient() && !handler.max_attempts_reached(self.max_attempts) {
                    let condition = Condition::new(CONDITION_READY, false, event, message, self.clock.now());
                    resource.status_mut().merge_condition(condition);
                    self.resources.update_status(&resource).await?;
                    return Ok(Outcome::Requeue(self.backoff.next(&key)));
                }

                let reason = format!("{}: {}", event, message);
                self.mark_failed(&mut handler, &mut resource, event, &reason).await?;
                Ok(self.requeue_at_ttl(&resource))
            }
        }
    }

    /// Completed records: stamp completion, then delete after the TTL.
    async fn reconcile_completed(
        &self,
        key: &str,
        mut resource: ReleaseDeployment,
        handler: &DeploymentHandler,
        mut changed: bool,
    ) -> Result<Outcome> {
        let now = self.clock.now();
        let terminal = handler.status().map(DeploymentState::from).unwrap_or_default();

        let status = resource.status_mut();
        if status.state != terminal {
            status.state = terminal;
            changed = true;
        }

        if status.completion_time.is_none() {
            status.completion_time = Some(now);
            self.resources.update_status(&resource).await?;
            debug!(resource = %key, "Recorded completion time");
            return Ok(self.requeue_at_ttl(&resource));
        }

        let expires = resource.expires_at();
        if expires.is_some_and(|at| now >= at) {
            info!(resource = %key, "TTL expired, deleting resource");
            self.resources
                .delete(
                    resource.metadata.namespace.as_deref().unwrap_or_default(),
                    resource.metadata.name.as_deref().unwrap_or_default(),
                )
                .await?;
            self.backoff.reset(key);
            return Ok(Outcome::Done);
        }

        if changed {
            self.resources.update_status(&resource).await?;
        }
        let remaining = expires.map_or(MAX_TTL_REQUEUE, |at| (at - now).to_std().unwrap_or(MIN_REQUEUE));
        Ok(Outcome::Requeue(remaining.clamp(MIN_REQUEUE, MAX_TTL_REQUEUE)))
    }

    async fn mark_failed(
        &self,
        handler: &mut DeploymentHandler,
        resource: &mut ReleaseDeployment,
        event: &str,
        reason: &str,
    ) -> Result<()> {
        handler.add_event(events::FAILED, reason).await?;
        handler.set_failed(reason).await?;

        let now = self.clock.now();
        let status = resource.status_mut();
        status.state = DeploymentState::Failed;
        status.completion_time.get_or_insert(now);
        status.merge_condition(Condition::new(CONDITION_READY, false, event, reason, now));
        self.resources.update_status(resource).await
    }

    fn requeue_at_ttl(&self, resource: &ReleaseDeployment) -> Outcome {
        let ttl = resource.ttl().to_std().unwrap_or(MIN_REQUEUE);
        Outcome::Requeue(ttl.clamp(MIN_REQUEUE, MAX_TTL_REQUEUE))
    }

    /// Steps 5 to 8. `Ok(false)` means the deploy repo already matched.
    async fn deploy(
        &self,
        cancel: &CancellationToken,
        handler: &DeploymentHandler,
        resource: &ReleaseDeployment,
    ) -> std::result::Result<bool, StepFailure> {
        let release = handler.release().map_err(step(events::LOAD_FAILED))?;

        let bundle = {
            let _source_lock = self.repos.lock(&release.source_repo).await;
            let source = self
                .load_source(cancel, release)
                .await
                .map_err(step(events::SOURCE_FETCH_FAILED))?;
            load_bundle(&source, release).map_err(step(events::BUNDLE_LOAD_FAILED))?
        };

        let _deploy_lock = self.repos.lock(&self.target.url).await;
        let deploy = self
            .load_deploy_repo(cancel)
            .await
            .map_err(step(events::DEPLOY_FETCH_FAILED))?;

        let mut metadata = BTreeMap::new();
        metadata.insert("release_id".to_string(), release.id.clone());
        metadata.insert("source_commit".to_string(), release.source_commit.clone());
        let opts = CreateOptions {
            id: resource.spec.id.clone(),
            metadata,
        };

        let deployment = self
            .deployer
            .create_deployment(cancel, deploy, &release.project, &bundle, opts)
            .await
            .map_err(step(events::CREATE_FAILED))?;

        match deployment.commit(cancel).await {
            Ok(hash) => {
                info!(project = %release.project, commit = %hash, "Pushed deployment");
                Ok(true)
            }
            Err(Error::NoChanges) => Ok(false),
            Err(e) => Err(StepFailure {
                event: events::PUSH_FAILED,
                error: e,
            }),
        }
    }

    /// Cached source checkout at the release's pinned commit.
    async fn load_source(&self, cancel: &CancellationToken, release: &Release) -> Result<Repo> {
        let repo = self
            .repos
            .open_or_clone(cancel, &release.source_repo, self.target.auth.clone())
            .await?;

        match repo.fetch(cancel).await {
            Ok(()) | Err(Error::NoUpdates) => {}
            Err(e) => return Err(e),
        }
        repo.checkout_commit(&release.source_commit)?;
        Ok(repo)
    }

    /// Cached deploy checkout on the configured ref, matching origin.
    ///
    /// Local state is never trusted: a commit left behind by a failed push
    /// is dropped and regenerated, so the retry pushes again.
    async fn load_deploy_repo(&self, cancel: &CancellationToken) -> Result<Repo> {
        let repo = self
            .repos
            .open_or_clone(cancel, &self.target.url, self.target.auth.clone())
            .await?;

        match repo.fetch(cancel).await {
            Ok(()) | Err(Error::NoUpdates) => {}
            Err(e) => return Err(e),
        }
        repo.checkout_ref(&self.target.git_ref)?;
        repo.reset_to_upstream()?;
        Ok(repo)
    }
}

/// A release's bundle override wins over the blueprint.
fn load_bundle(source: &Repo, release: &Release) -> Result<ModuleBundle> {
    if !release.bundle.is_empty() {
        debug!(release = %release.id, "Using bundle from release");
        return ModuleBundle::from_base64(&release.bundle);
    }
    Blueprint::load(source, &release.project_path)?.bundle()
}
