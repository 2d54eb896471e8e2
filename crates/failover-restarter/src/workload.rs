//! Cluster access for Deployments and StatefulSets

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::resource::{ResourceKind, ResourceRef};

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("Resource not found")]
    NotFound,
    #[error("Kubernetes API call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),
}

/// Operations the controller needs from the cluster control plane
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// Names of all workloads of `kind` in `namespace`
    async fn list_names(
        &self,
        kind: ResourceKind,
        namespace: &str,
    ) -> Result<Vec<String>, WorkloadError>;

    /// Read the workload, then set `annotation = value` on its pod template.
    ///
    /// Returns [`WorkloadError::NotFound`] when the workload does not exist.
    async fn stamp_template(
        &self,
        target: &ResourceRef,
        annotation: &str,
        value: &str,
    ) -> Result<(), WorkloadError>;
}

/// [`WorkloadApi`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeWorkloads {
    client: Client,
    timeout: Duration,
}

impl KubeWorkloads {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, kube::Error>>,
    ) -> Result<T, WorkloadError> {
        match timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(kube::Error::Api(ref ae))) if ae.code == 404 => Err(WorkloadError::NotFound),
            Ok(Err(e)) => Err(WorkloadError::Api(e)),
            Err(_) => Err(WorkloadError::Timeout(self.timeout)),
        }
    }

    async fn list_in<K>(&self, namespace: &str) -> Result<Vec<String>, WorkloadError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + serde::de::DeserializeOwned,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let list = self.bounded(api.list(&ListParams::default())).await?;

        Ok(list.items.iter().map(|item| item.name_any()).collect())
    }

    async fn stamp<K>(
        &self,
        target: &ResourceRef,
        annotation: &str,
        value: &str,
    ) -> Result<(), WorkloadError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + serde::de::DeserializeOwned,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &target.namespace);

        // Surface a missing workload before attempting the write
        let current = self.bounded(api.get(&target.name)).await?;
        debug!(
            resource_version = current.resource_version().as_deref().unwrap_or(""),
            "Read workload"
        );

        // Merge patch keeps annotations owned by other controllers
        let patch = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": { annotation: value }
                    }
                }
            }
        });

        self.bounded(api.patch(&target.name, &PatchParams::default(), &Patch::Merge(&patch)))
            .await?;

        Ok(())
    }
}

#[async_trait]
impl WorkloadApi for KubeWorkloads {
    #[instrument(skip(self))]
    async fn list_names(
        &self,
        kind: ResourceKind,
        namespace: &str,
    ) -> Result<Vec<String>, WorkloadError> {
        match kind {
            ResourceKind::Deployment => self.list_in::<Deployment>(namespace).await,
            ResourceKind::StatefulSet => self.list_in::<StatefulSet>(namespace).await,
        }
    }

    #[instrument(skip(self, target), fields(kind = %target.kind, namespace = %target.namespace, name = %target.name))]
    async fn stamp_template(
        &self,
        target: &ResourceRef,
        annotation: &str,
        value: &str,
    ) -> Result<(), WorkloadError> {
        match target.kind {
            ResourceKind::Deployment => self.stamp::<Deployment>(target, annotation, value).await,
            ResourceKind::StatefulSet => self.stamp::<StatefulSet>(target, annotation, value).await,
        }
    }
}
