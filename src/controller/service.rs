//! Service reconciliation: garbage-collect the Kong apis pointing at a
//! Service that is going away, then release the finalizer holding it.

use std::sync::Arc;

use kube::ResourceExt;
use tracing::debug;

use super::metrics::APIS_TOTAL;
use super::utils::upstream_url;
use super::Context;
use crate::{Error, Result};

/// Reconcile a single Service key.
///
/// Only Services in deferred deletion (deletion timestamp set, blocked by
/// our finalizer) need work: every Kong api whose `upstream_url` points at
/// one of the Service ports is removed, then the finalizer is cleared so
/// the server can reap the object. Partial failures abort and the queue
/// retries.
pub async fn sync_services(key: String, _requeues: u32, ctx: Arc<Context>) -> Result<()> {
    let Some(svc) = ctx.services.get(&key) else {
        debug!(%key, "gc=true, service resource doesn't exist");
        return Ok(());
    };
    if svc.metadata.deletion_timestamp.is_none() {
        return Ok(());
    }
    let namespace = svc.namespace().unwrap_or_default();
    let name = svc.name_any();

    let ports = svc
        .spec
        .as_ref()
        .and_then(|s| s.ports.clone())
        .unwrap_or_default();
    for port in ports {
        let upstream = upstream_url(&ctx.cfg.cluster_dns, &namespace, &name, port.port);
        debug!(%key, upstream = %upstream, "gc=true, cleaning up kong apis from upstream");
        let list = ctx
            .kong
            .list_apis(&[("upstream_url", upstream.as_str())])
            .await
            .map_err(|e| Error::sync(format!("gc=true, failed listing apis [{e}]")))?;
        for api in list.data {
            let Some(api_name) = api.name.as_deref() else {
                continue;
            };
            debug!(%key, api = %api_name, "gc=true, removing kong api");
            ctx.kong.delete_api(api_name).await.map_err(|e| {
                Error::sync(format!("gc=true, failed removing kong api {api_name}, [{e}]"))
            })?;
            APIS_TOTAL.dec();
        }
    }

    ctx.kube
        .clear_service_finalizers(&namespace, &name)
        .await
        .map_err(|e| Error::sync(format!("gc=true, failed patch service [{e}]")))?;
    Ok(())
}
