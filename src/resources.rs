//! Access to `ReleaseDeployment` objects in the cluster.

use crate::crd::ReleaseDeployment;
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

const FIELD_MANAGER: &str = "forge-operator";

#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// `None` when the object no longer exists.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ReleaseDeployment>>;

    /// Writes the object's status subresource.
    async fn update_status(&self, resource: &ReleaseDeployment) -> Result<()>;

    /// Deletes the object. Already gone is success.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

pub struct KubeResources {
    client: Client,
}

impl KubeResources {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ReleaseDeployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ResourceClient for KubeResources {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ReleaseDeployment>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn update_status(&self, resource: &ReleaseDeployment) -> Result<()> {
        let namespace = resource
            .namespace()
            .ok_or_else(|| Error::Kube(format!("{} has no namespace", resource.name_any())))?;
        let patch = serde_json::json!({ "status": resource.status });

        self.api(&namespace)
            .patch_status(
                &resource.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        debug!(namespace = %namespace, name = %resource.name_any(), "Patched status");
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Map-backed resources for tests and dry runs.
#[derive(Default)]
pub struct MemoryResources {
    objects: RwLock<HashMap<(String, String), ReleaseDeployment>>,
}

impl MemoryResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, resource: ReleaseDeployment) {
        let key = (resource.namespace().unwrap_or_default(), resource.name_any());
        if let Ok(mut objects) = self.objects.write() {
            objects.insert(key, resource);
        }
    }

    pub fn snapshot(&self, namespace: &str, name: &str) -> Option<ReleaseDeployment> {
        self.objects
            .read()
            .ok()?
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn lock_err() -> Error {
        Error::Internal("resource store lock poisoned".to_string())
    }
}

#[async_trait]
impl ResourceClient for MemoryResources {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ReleaseDeployment>> {
        let objects = self.objects.read().map_err(|_| Self::lock_err())?;
        Ok(objects.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn update_status(&self, resource: &ReleaseDeployment) -> Result<()> {
        let key = (resource.namespace().unwrap_or_default(), resource.name_any());
        let mut objects = self.objects.write().map_err(|_| Self::lock_err())?;
        let stored = objects
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(format!("{}/{}", key.0, key.1)))?;
        stored.status = resource.status.clone();
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let mut objects = self.objects.write().map_err(|_| Self::lock_err())?;
        objects.remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}
