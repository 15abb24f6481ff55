//! Ingress reconciliation: claim (or verify) the domains behind every rule
//! host and materialize one Kong api per (rule, path) pair.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::metrics::{APIS_FAILED, APIS_TOTAL};
use super::utils::{
    api_name, backend_port, hosts_from_ingress, is_dirty, upstream_url, validate_ingress,
};
use super::Context;
use crate::crd::{DomainPhase, DomainStatus};
use crate::events::{object_ref, reasons};
use crate::kong::Api;
use crate::{Error, Result};

/// Requeues tolerated before an Ingress is flagged as dirty
pub const AUTO_CLAIM_MAX_RETRIES: u32 = 8;

/// How long the reconciler waits for the Domain cache to observe its own
/// auto-claim writes before giving up and requeueing
const CLAIM_SYNC_TIMEOUT: Duration = Duration::from_secs(2);

/// What kind of write auto-claim performed for a given Domain key
enum ClaimWrite {
    Created,
    Replaced { previous_version: Option<String> },
}

/// Reconcile a single Ingress key.
pub async fn sync_ingress(key: String, requeues: u32, ctx: Arc<Context>) -> Result<()> {
    let Some(ing) = ctx.ingresses.get(&key) else {
        debug!(%key, "ingress doesn't exist");
        return Ok(());
    };
    let namespace = ing.namespace().unwrap_or_default();

    if requeues > AUTO_CLAIM_MAX_RETRIES {
        // The dirty state only signals that the object couldn't recover
        // from a bad state, useful to warn clients.
        if let Err(e) = set_dirty(&ing, &ctx).await {
            warn!(%key, error = %e, "failed to set resource as dirty");
        }
    }

    if let Err(e) = validate_ingress(&ing) {
        ctx.events
            .publish(
                &object_ref(&*ing),
                EventType::Warning,
                reasons::INVALID,
                Some(e.to_string()),
            )
            .await;
        // a validation failure needs a spec change, requeueing won't help
        return Ok(());
    }

    if ctx.cfg.auto_claim {
        let writes = claim_domains(&ing, &ctx)
            .await
            .map_err(|e| Error::sync(format!("autoclaim=on, failed claiming domains [{e}]")))?;
        wait_domains_observed(&ctx, writes).await?;
    }

    if let Some(host) = unclaimed_host(&ing, &ctx) {
        if requeues > 2 {
            ctx.events
                .publish(
                    &object_ref(&*ing),
                    EventType::Warning,
                    reasons::DOMAIN_NOT_FOUND,
                    Some(format!(
                        "The domain '{host}' wasn't claimed, check its state"
                    )),
                )
                .await;
        }
        return Err(Error::sync(format!(
            "failed claiming domain {host}, check its state"
        )));
    }
    debug!(%key, "allowed to sync ingress routes, found all domains");

    // Rules could repeat domains, it will be redundant but it will work.
    let rules = ing
        .spec
        .as_ref()
        .and_then(|s| s.rules.clone())
        .unwrap_or_default();
    for rule in rules {
        let Some(host) = rule.host.filter(|h| !h.is_empty()) else {
            continue;
        };
        let Some(http) = rule.http else {
            debug!(%key, "http is nil, skipping");
            continue;
        };
        // Each path generates its own api registry on Kong, a domain ends up
        // with multiple endpoints allowing path based routing.
        for path in http.paths {
            let Some(backend) = path.backend.service.clone() else {
                continue;
            };
            let service_key = format!("{namespace}/{}", backend.name);
            if ctx.services.get(&service_key).is_none() {
                ctx.events
                    .publish(
                        &object_ref(&*ing),
                        EventType::Warning,
                        reasons::SERVICE_NOT_FOUND,
                        Some(format!(
                            "Service '{}' not found for ingress",
                            backend.name
                        )),
                    )
                    .await;
                return Err(Error::sync(format!("service {} not found", backend.name)));
            }
            // A finalizer is necessary to clean the apis associated with
            // Kong, a service relates to several of them by its upstream.
            ctx.kube
                .set_service_finalizer(&namespace, &backend.name)
                .await
                .map_err(|e| Error::sync(format!("failed configuring service: {e}")))?;

            let Some(port) = backend_port(&path) else {
                ctx.events
                    .publish(
                        &object_ref(&*ing),
                        EventType::Warning,
                        reasons::INVALID,
                        Some(format!(
                            "Service '{}' backend must declare a numeric port",
                            backend.name
                        )),
                    )
                    .await;
                return Ok(());
            };
            let upstream = upstream_url(&ctx.cfg.cluster_dns, &namespace, &backend.name, port);

            // An empty path and the root one are the same route on Kong;
            // normalize so both produce one adler hash.
            let declared = path.path.clone().unwrap_or_default();
            let normalized = if declared.is_empty() { "/" } else { declared.as_str() };
            let name = api_name(&host, &namespace, normalized);

            let existing = match ctx.kong.get_api(&name).await {
                Ok(existing) => existing,
                Err(e) => {
                    ctx.events
                        .publish(
                            &object_ref(&*ing),
                            EventType::Warning,
                            reasons::FAILED_ADD_ROUTE,
                            Some(e.to_string()),
                        )
                        .await;
                    return Err(Error::sync(format!("failed listing api: {e}")));
                }
            };

            let mut api = Api {
                name: Some(name.clone()),
                hosts: vec![host.clone()],
                upstream_url: upstream,
                ..Default::default()
            };
            if !declared.is_empty() && declared != "/" {
                api.uris = vec![declared.clone()];
            }
            // Providing the uuid triggers an update, otherwise a new
            // record is created.
            let created = existing.is_none();
            if let Some(existing) = existing {
                api.id = existing.id;
                api.created_at = existing.created_at;
            }
            match ctx.kong.upsert_api(&api).await {
                Ok(stored) => {
                    if created {
                        APIS_TOTAL.inc();
                    }
                    info!(
                        %key,
                        host = %host,
                        api = stored.id.as_deref().unwrap_or_default(),
                        "added route"
                    );
                }
                Err(e) if e.is_conflict() => {
                    debug!(%key, api = %name, "conflict on upsert, another sync got there first");
                }
                Err(e) => {
                    APIS_FAILED.inc();
                    return Err(Error::sync(format!("failed adding api: {e}")));
                }
            }
        }
    }
    Ok(())
}

/// Create or update the Domains implied by the Ingress hosts. Returns the
/// set of writes so the caller can wait for the cache to observe them.
async fn claim_domains(ing: &Ingress, ctx: &Context) -> Result<Vec<(String, ClaimWrite)>> {
    let namespace = ing.namespace().unwrap_or_default();
    let name = ing.name_any();
    let mut writes = Vec::new();

    for desired in hosts_from_ingress(ing) {
        if !desired.is_valid_domain() {
            return Err(Error::sync(format!(
                "it's not a valid domain {}",
                desired.fqdn()
            )));
        }
        let domain_key = desired.store_key();
        debug!(
            ingress = %format!("{namespace}/{name}"),
            domain = %desired.fqdn(),
            kind = desired.domain_type(),
            "trying to claim domain"
        );
        match ctx.domains.get(&domain_key) {
            Some(current) => {
                if current.spec == desired.spec {
                    debug!(domain = %desired.fqdn(), "skip update, no changes found");
                    continue;
                }
                info!(domain = %desired.fqdn(), "updating domain");
                let mut updated = (*current).clone();
                updated.spec = desired.spec.clone();
                let previous_version = current.resource_version();
                ctx.kube
                    .replace_domain(&namespace, &updated)
                    .await
                    .map_err(|e| Error::sync(format!("failed updating domain [{e}]")))?;
                // a domain that isn't settled restarts its claim from scratch
                if current.phase() != DomainPhase::Ok {
                    ctx.kube
                        .patch_domain_status(
                            &namespace,
                            &updated.name_any(),
                            &DomainStatus::default(),
                        )
                        .await
                        .map_err(|e| Error::sync(format!("failed resetting domain [{e}]")))?;
                }
                writes.push((domain_key, ClaimWrite::Replaced { previous_version }));
            }
            None => {
                ctx.kube
                    .create_domain(&namespace, &desired)
                    .await
                    .map_err(|e| Error::sync(format!("failed creating new domain [{e}]")))?;
                writes.push((domain_key, ClaimWrite::Created));
            }
        }
    }
    Ok(writes)
}

/// Block until the Domain cache observed every write, bounded by
/// [`CLAIM_SYNC_TIMEOUT`]. Expiry requeues the Ingress instead of reading
/// stale state.
async fn wait_domains_observed(ctx: &Context, writes: Vec<(String, ClaimWrite)>) -> Result<()> {
    if writes.is_empty() {
        return Ok(());
    }
    let deadline = tokio::time::Instant::now() + CLAIM_SYNC_TIMEOUT;
    for (key, write) in writes {
        loop {
            let observed = match (&write, ctx.domains.get(&key)) {
                (ClaimWrite::Created, Some(d)) => {
                    d.resource_version().is_some_and(|rv| !rv.is_empty())
                }
                (ClaimWrite::Replaced { previous_version }, Some(d)) => {
                    d.resource_version() != *previous_version
                }
                (_, None) => false,
            };
            if observed {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::sync(format!(
                    "domain cache didn't observe the claim for {key}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
    Ok(())
}

/// Returns the first rule host with no OK-phase Domain backing it in the
/// Ingress namespace, `None` when every host is claimed.
fn unclaimed_host(ing: &Ingress, ctx: &Context) -> Option<String> {
    let namespace = ing.namespace().unwrap_or_default();
    let domains = ctx.domains.list_namespace(&namespace);
    let rules = ing.spec.as_ref().and_then(|s| s.rules.as_ref())?;
    for rule in rules {
        let Some(host) = rule.host.clone() else {
            continue;
        };
        let claimed = domains
            .iter()
            .any(|d| d.phase() == DomainPhase::Ok && d.fqdn() == host);
        if !claimed {
            return Some(host);
        }
        debug!(host = %host, "found claimed domain");
    }
    None
}

/// Set the dirty annotation unless it is already there
async fn set_dirty(ing: &Ingress, ctx: &Context) -> Result<()> {
    if is_dirty(ing) {
        return Ok(());
    }
    info!(
        ingress = %ing.name_any(),
        "the object could not recover from itself, setting as dirty"
    );
    ctx.kube
        .set_ingress_dirty(&ing.namespace().unwrap_or_default(), &ing.name_any())
        .await
}
