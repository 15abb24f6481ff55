//! Startup tasks: Domain CRD installation and namespace bootstrap.
//!
//! The controller installs its own CRD on startup using server-side apply,
//! so the resource definition always matches the controller version.

use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Client, CustomResourceExt};

use crate::crd::Domain;

/// Qualified name of the Domain CRD
pub const CRD_NAME: &str = "domains.platform.koli.io";

/// How long to wait for the apiserver to establish the CRD
const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Install the Domain CRD and wait until the apiserver establishes it.
///
/// Bails out early when the names are rejected, which means another
/// definition already claims them.
pub async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("kong-controller").force();

    tracing::info!("Installing {} CRD...", CRD_NAME);
    crds.patch(CRD_NAME, &params, &Patch::Apply(&Domain::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", CRD_NAME, e))?;

    let deadline = tokio::time::Instant::now() + ESTABLISH_TIMEOUT;
    loop {
        let crd = crds
            .get(CRD_NAME)
            .await
            .map_err(|e| anyhow::anyhow!("failed reading {} CRD: {}", CRD_NAME, e))?;
        let conditions = crd
            .status
            .and_then(|s| s.conditions)
            .unwrap_or_default();
        if conditions
            .iter()
            .any(|c| c.type_ == "Established" && c.status == "True")
        {
            tracing::info!("{} CRD established", CRD_NAME);
            return Ok(());
        }
        if let Some(rejected) = conditions
            .iter()
            .find(|c| c.type_ == "NamesAccepted" && c.status == "False")
        {
            anyhow::bail!(
                "CRD names were not accepted: {}",
                rejected.message.as_deref().unwrap_or("unknown reason")
            );
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for {} CRD to be established", CRD_NAME);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Create the namespace holding cluster-level primary domains. An existing
/// namespace is fine.
pub async fn ensure_namespace(client: &Client, name: &str) -> anyhow::Result<()> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    match namespaces.create(&PostParams::default(), &ns).await {
        Ok(_) => {
            tracing::info!(namespace = %name, "created namespace");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
        Err(e) => Err(anyhow::anyhow!("failed creating namespace [{e}]")),
    }
}
