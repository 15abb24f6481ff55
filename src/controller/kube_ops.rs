//! Kubernetes write operations used by the reconcilers.
//!
//! Cluster writes sit behind a mockable trait so reconcilers stay
//! unit-testable without an apiserver; production wires in [`KubeWriter`]
//! backed by a real client.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::crd::{Domain, DomainStatus, FINALIZER};
use crate::error::Error;

/// Trait abstracting the cluster mutations the controller performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeOps: Send + Sync {
    /// Attach the controller finalizer to a Service (idempotent)
    async fn set_service_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Remove every finalizer from a Service once its Kong apis are gone
    async fn clear_service_finalizers(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Mark an Ingress with the dirty annotation to flag a state it cannot
    /// recover from
    async fn set_ingress_dirty(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create a Domain resource, returning the stored object
    async fn create_domain(&self, namespace: &str, domain: &Domain) -> Result<Domain, Error>;

    /// Replace a Domain resource (spec and metadata), returning the stored
    /// object
    async fn replace_domain(&self, namespace: &str, domain: &Domain) -> Result<Domain, Error>;

    /// Merge-patch the status subresource of a Domain
    async fn patch_domain_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DomainStatus,
    ) -> Result<(), Error>;

    /// Set the controller finalizer on a Domain
    async fn set_domain_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Clear every finalizer on a Domain so the server can reap it
    async fn clear_domain_finalizers(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Delete a Domain resource
    async fn delete_domain(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Production implementation backed by a kube [`Client`]
pub struct KubeWriter {
    client: Client,
}

impl KubeWriter {
    /// Create a writer using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn domains(&self, namespace: &str) -> Api<Domain> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeOps for KubeWriter {
    async fn set_service_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({"metadata": {"finalizers": [FINALIZER]}});
        services
            .patch(name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await?;
        Ok(())
    }

    async fn clear_service_finalizers(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({"metadata": {"finalizers": []}});
        services
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_ingress_dirty(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({"metadata": {"annotations": {"kolihub.io/dirty": "true"}}});
        ingresses
            .patch(name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await?;
        Ok(())
    }

    async fn create_domain(&self, namespace: &str, domain: &Domain) -> Result<Domain, Error> {
        Ok(self
            .domains(namespace)
            .create(&PostParams::default(), domain)
            .await?)
    }

    async fn replace_domain(&self, namespace: &str, domain: &Domain) -> Result<Domain, Error> {
        let name = domain
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("domain resource has no name"))?;
        Ok(self
            .domains(namespace)
            .replace(name, &PostParams::default(), domain)
            .await?)
    }

    async fn patch_domain_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DomainStatus,
    ) -> Result<(), Error> {
        // explicit nulls so a merge patch clears reason/message on resubmit
        let patch = json!({
            "status": {
                "phase": status.phase,
                "reason": status.reason,
                "message": status.message,
                "lastUpdateTime": status.last_update_time,
            }
        });
        self.domains(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_domain_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let patch = json!({"metadata": {"finalizers": [FINALIZER]}});
        self.domains(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn clear_domain_finalizers(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let patch = json!({"metadata": {"finalizers": []}});
        self.domains(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_domain(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.domains(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}
