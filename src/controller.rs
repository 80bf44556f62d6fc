//! Kubernetes controller glue.
//!
//! Watches `ReleaseDeployment` objects and feeds them to the [`Reconciler`].
//! The runtime's work queue guarantees at most one tick per object.

use crate::crd::ReleaseDeployment;
use crate::error::{Error, Result};
use crate::reconciler::{Outcome, Reconciler};
use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared state for every tick.
pub struct ControllerContext {
    pub reconciler: Reconciler,
    pub tick_timeout: Duration,
    /// Parent of every tick's cancellation token.
    pub shutdown: CancellationToken,
}

async fn reconcile(resource: Arc<ReleaseDeployment>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let namespace = resource.namespace().unwrap_or_default();
    let name = resource.name_any();
    let cancel = ctx.shutdown.child_token();

    let tick = ctx.reconciler.reconcile(&cancel, &namespace, &name);
    let outcome = match tokio::time::timeout(ctx.tick_timeout, tick).await {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            Err(Error::Timeout {
                operation: format!("reconcile {}/{}", namespace, name),
                duration: ctx.tick_timeout,
            })
        }
    }?;

    debug!(namespace = %namespace, name = %name, ?outcome, "Tick finished");
    Ok(match outcome {
        Outcome::Done => Action::await_change(),
        Outcome::Requeue(after) => Action::requeue(after),
    })
}

fn error_policy(resource: Arc<ReleaseDeployment>, err: &Error, ctx: Arc<ControllerContext>) -> Action {
    let key = format!("{}/{}", resource.namespace().unwrap_or_default(), resource.name_any());
    let delay = ctx.reconciler.backoff(&key);
    warn!(resource = %key, kind = ?err.kind(), "Reconcile failed, retrying in {:?}: {}", delay, err);
    Action::requeue(delay)
}

/// Runs until SIGTERM or Ctrl-C.
pub async fn run_controller(client: Client, ctx: Arc<ControllerContext>) -> Result<()> {
    let api: Api<ReleaseDeployment> = Api::all(client);

    // Fail fast when the CRD is missing instead of watching forever
    api.list(&kube::api::ListParams::default().limit(1))
        .await
        .map_err(|e| Error::Kube(format!("ReleaseDeployment CRD is not installed or not readable: {}", e)))?;

    info!("Starting ReleaseDeployment controller");
    let shutdown = ctx.shutdown.clone();

    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(name = %object.name, "Reconciled"),
                Err(e) => error!("Controller error: {}", e),
            }
        })
        .await;

    shutdown.cancel();
    info!("Controller stopped");
    Ok(())
}
