//! Domain reconciliation: the claim state machine, the primary-domain
//! resolver and the orphaned-route garbage collector.

use std::sync::Arc;

use chrono::{Duration, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info};

use super::cache::Store;
use super::metrics::APIS_TOTAL;
use super::utils::apis_by_host;
use super::Context;
use crate::crd::{Domain, DomainPhase, DomainStatus};
use crate::events::{object_ref, reasons};
use crate::{Error, Result};

/// Find the primary domain authorizing `d`, trying namespaces in a fixed
/// order and stopping at the first hit:
///
/// 1. the parent namespace, when `spec.parent` is set (the parent must
///    explicitly delegate to the claimer's namespace)
/// 2. the resource's own namespace (no delegation check)
/// 3. the controller's system namespace (same rule as the first)
///
/// A negative answer means the resource has no permission to claim the
/// shared domain.
pub fn search_for_primary(
    store: &Store<Domain>,
    d: &Domain,
    system_namespace: &str,
) -> Option<Arc<Domain>> {
    let own_namespace = d.namespace().unwrap_or_default();
    let mut namespaces = Vec::new();
    if !d.spec.parent.is_empty() {
        namespaces.push(d.spec.parent.clone());
    }
    if !namespaces.contains(&own_namespace) {
        namespaces.push(own_namespace.clone());
    }
    if !namespaces.iter().any(|ns| ns == system_namespace) {
        namespaces.push(system_namespace.to_string());
    }

    for namespace in namespaces {
        for candidate in store.list_namespace(&namespace) {
            if candidate.phase() != DomainPhase::Ok
                || !candidate.is_primary()
                || candidate.spec.primary != d.spec.primary
            {
                continue;
            }
            let authorized = candidate.namespace().unwrap_or_default() == own_namespace
                || candidate
                    .spec
                    .delegates
                    .iter()
                    .any(|ns| ns == &own_namespace || ns == "*");
            if authorized {
                return Some(candidate);
            }
        }
    }
    None
}

/// Reconcile a single Domain key.
pub async fn sync_domain(key: String, _requeues: u32, ctx: Arc<Context>) -> Result<()> {
    let Some(d) = ctx.domains.get(&key) else {
        debug!(%key, "the domain resource doesn't exist");
        return collect_orphans(&key, &ctx).await;
    };

    if !d.is_valid_domain() {
        debug!(%key, "the domain specified isn't valid");
        update_domain_status(
            &ctx,
            &d,
            reasons::INVALID,
            "The domain specified on the resource is invalid",
            DomainPhase::Failed,
        )
        .await?;
        return Ok(());
    }

    if d.is_marked_for_deletion() {
        return purge_domain(&key, &d, &ctx).await;
    }

    match d.phase() {
        DomainPhase::New => {
            // moving out of New pins the finalizer so routes are cleaned
            // before the server reaps the resource
            ctx.kube
                .set_domain_finalizer(&d.namespace().unwrap_or_default(), &d.name_any())
                .await
                .map_err(|e| Error::sync(format!("failed updating new domain claim [{e}]")))?;
            update_domain_status(&ctx, &d, "", "", DomainPhase::Pending).await?;
        }
        DomainPhase::Pending => {
            if d.is_primary() {
                claim_primary(&key, &d, &ctx).await?;
            } else {
                claim_shared(&key, &d, &ctx).await?;
            }
        }
        DomainPhase::Ok => {
            // shared domains must keep their parents; primaries need no action
            if !d.is_primary() {
                debug!(%key, "validating the resource state");
                if search_for_primary(&ctx.domains, &d, &ctx.cfg.pod_namespace).is_none() {
                    ctx.events
                        .publish(
                            &object_ref(&*d),
                            EventType::Warning,
                            reasons::DOMAIN_NOT_FOUND,
                            Some("Primary domain not found".to_string()),
                        )
                        .await;
                    update_domain_status(
                        &ctx,
                        &d,
                        reasons::DOMAIN_NOT_FOUND,
                        "Primary domain not found",
                        DomainPhase::Failed,
                    )
                    .await?;
                }
            }
        }
        DomainPhase::Failed => {
            if d.is_update_expired(Duration::seconds(ctx.cfg.resync_on_failed)) {
                debug!(%key, "update expired, requeueing");
                let phase = if d.has_kong_finalizer() {
                    DomainPhase::Pending
                } else {
                    DomainPhase::New
                };
                if let Err(e) = update_domain_status(&ctx, &d, "", "", phase).await {
                    // let the resync replay the key instead of hot-looping
                    info!(%key, error = %e, "failed updating domain status");
                }
            }
        }
    }
    Ok(())
}

/// Settle a primary claim: exactly one OK primary per `spec.primary` may
/// exist cluster-wide.
async fn claim_primary(key: &str, d: &Domain, ctx: &Context) -> Result<()> {
    let conflict = ctx.domains.list().into_iter().find(|candidate| {
        // skip the target resource itself
        !(candidate.name_any() == d.name_any() && candidate.namespace() == d.namespace())
            && candidate.is_primary()
            && candidate.spec.primary == d.spec.primary
    });
    if let Some(conflict) = conflict {
        let msg = "The primary domain already exists";
        ctx.events
            .publish(
                &object_ref(d),
                EventType::Warning,
                reasons::DOMAIN_ALREADY_EXISTS,
                Some(msg.to_string()),
            )
            .await;
        info!(
            %key,
            conflict = %conflict.store_key(),
            "{msg}, source of conflict"
        );
        update_domain_status(
            ctx,
            d,
            reasons::DOMAIN_ALREADY_EXISTS,
            "The domain already exists",
            DomainPhase::Failed,
        )
        .await?;
        return Ok(());
    }
    update_domain_status(ctx, d, "", "Primary domain claimed with success", DomainPhase::Ok)
        .await?;
    ctx.events
        .publish(
            &object_ref(d),
            EventType::Normal,
            reasons::OK,
            Some("Primary domain claimed with success".to_string()),
        )
        .await;
    Ok(())
}

/// Settle a shared claim through the resolver
async fn claim_shared(key: &str, d: &Domain, ctx: &Context) -> Result<()> {
    if !d.is_valid_shared_domain() {
        ctx.events
            .publish(
                &object_ref(d),
                EventType::Warning,
                reasons::INVALID,
                Some("The shared domain must be a subdomain from the primary".to_string()),
            )
            .await;
        return Ok(());
    }
    match search_for_primary(&ctx.domains, d, &ctx.cfg.pod_namespace) {
        None => {
            ctx.events
                .publish(
                    &object_ref(d),
                    EventType::Warning,
                    reasons::DOMAIN_NOT_FOUND,
                    Some("Primary domain not found".to_string()),
                )
                .await;
            update_domain_status(
                ctx,
                d,
                reasons::DOMAIN_NOT_FOUND,
                "Primary domain not found",
                DomainPhase::Failed,
            )
            .await?;
        }
        Some(primary) => {
            debug!(%key, primary = %primary.store_key(), "found a primary domain");
            update_domain_status(
                ctx,
                d,
                "",
                "Shared domain claimed with success",
                DomainPhase::Ok,
            )
            .await?;
        }
    }
    Ok(())
}

/// Cascade-delete the routes of a Domain that is marked for deletion, then
/// release the finalizer and remove the resource. Deleting a primary purges
/// its whole family of shared siblings.
async fn purge_domain(key: &str, d: &Domain, ctx: &Context) -> Result<()> {
    let family: Vec<Arc<Domain>> = if d.is_primary() {
        ctx.domains
            .list()
            .into_iter()
            .filter(|candidate| candidate.spec.primary == d.spec.primary)
            .collect()
    } else {
        vec![Arc::new(d.clone())]
    };

    for member in family {
        info!(
            %key,
            domain = %member.fqdn(),
            kind = member.domain_type(),
            "gc=true, purging routes"
        );
        delete_apis_matching(ctx, &member.fqdn()).await?;
        update_domain_status(
            ctx,
            &member,
            "DomainDeleted",
            "The primary domain was deleted",
            DomainPhase::Failed,
        )
        .await
        .map_err(|e| Error::sync(format!("gc=true, failed updating domain status [{e}]")))?;
    }

    let namespace = d.namespace().unwrap_or_default();
    ctx.kube
        .clear_domain_finalizers(&namespace, &d.name_any())
        .await
        .map_err(|e| Error::sync(format!("gc=true, failed removing finalizer [{e}]")))?;
    // removing the finalizer doesn't remove the resource by itself
    ctx.kube
        .delete_domain(&namespace, &d.name_any())
        .await
        .map_err(|e| Error::sync(format!("gc=true, failed removing domain resource [{e}]")))?;
    debug!(%key, primary = d.is_primary(), "gc=true, domain purged");
    Ok(())
}

/// The cache-miss branch: the key is gone from the store. With
/// `wipe-on-delete` enabled, run the two-sweep orphan collection over
/// shared domains and over Kong apis with no backing Domain at all.
async fn collect_orphans(key: &str, ctx: &Context) -> Result<()> {
    if !ctx.cfg.wipe_on_delete {
        return Ok(());
    }

    // Sweep 1: a deleted resource can't tell us whether it was primary or
    // shared, so re-resolve every settled shared domain and fail the ones
    // whose primary vanished.
    let orphan_candidates: Vec<Arc<Domain>> = ctx
        .domains
        .list()
        .into_iter()
        .filter(|d| !d.is_primary() && d.phase() == DomainPhase::Ok)
        .collect();
    for shared in orphan_candidates {
        if search_for_primary(&ctx.domains, &shared, &ctx.cfg.pod_namespace).is_some() {
            continue;
        }
        debug!(
            %key,
            shared = %shared.fqdn(),
            "gc=true, wipeondelete=true, primary domain not found for shared"
        );
        delete_apis_matching(ctx, &shared.fqdn()).await?;
        update_domain_status(
            ctx,
            &shared,
            "DomainDeleted",
            "The primary domain was deleted",
            DomainPhase::Failed,
        )
        .await
        .map_err(|e| {
            Error::sync(format!(
                "gc=true, wipeondelete=true, failed updating domain status [{e}]"
            ))
        })?;
    }

    // Sweep 2: wipe api groups whose hostname has no Domain resource left.
    let list = ctx
        .kong
        .list_apis(&[])
        .await
        .map_err(|e| Error::sync(format!("gc=true, wipeondelete=true, failed listing kong apis [{e}]")))?;
    let cached = ctx.domains.list();
    for (kong_host, apis) in apis_by_host(&list) {
        if let Some(owner) = cached.iter().find(|d| d.fqdn() == kong_host) {
            debug!(
                %key,
                host = %kong_host,
                kind = owner.domain_type(),
                "gc=true, wipeondelete=true, found owning domain, skip"
            );
            continue;
        }
        info!(
            %key,
            host = %kong_host,
            "gc=true, wipeondelete=true, missing domain resource for the kong api"
        );
        for api in apis {
            let Some(name) = api.name.as_deref() else {
                continue;
            };
            debug!(%key, api = %name, "gc=true, wipeondelete=true, removing kong api");
            ctx.kong.delete_api(name).await.map_err(|e| {
                Error::sync(format!("gc=true, wipeondelete=true, failed removing api [{e}]"))
            })?;
            APIS_TOTAL.dec();
        }
    }
    Ok(())
}

/// Delete every Kong api whose name belongs to `fqdn`
async fn delete_apis_matching(ctx: &Context, fqdn: &str) -> Result<()> {
    let pattern = format!("^{}~.+$", regex::escape(fqdn));
    let list = ctx
        .kong
        .list_apis_by_regexp(&[], &pattern)
        .await
        .map_err(|e| Error::sync(format!("gc=true, failed listing kong apis [{e}]")))?;
    for api in list.data {
        let Some(name) = api.name.as_deref() else {
            continue;
        };
        debug!(api = %name, "gc=true, removing kong api");
        ctx.kong
            .delete_api(name)
            .await
            .map_err(|e| Error::sync(format!("gc=true, failed removing kong api [{e}]")))?;
        APIS_TOTAL.dec();
    }
    Ok(())
}

/// Write a status transition, skipping the RPC when `(phase, reason,
/// message)` already match the cached object.
pub(super) async fn update_domain_status(
    ctx: &Context,
    d: &Domain,
    reason: &str,
    message: &str,
    phase: DomainPhase,
) -> Result<()> {
    let current = d.status.clone().unwrap_or_default();
    if current.phase == phase
        && current.reason.as_deref().unwrap_or_default() == reason
        && current.message.as_deref().unwrap_or_default() == message
    {
        return Ok(());
    }
    let status = DomainStatus {
        phase,
        reason: (!reason.is_empty()).then(|| reason.to_string()),
        message: (!message.is_empty()).then(|| message.to_string()),
        last_update_time: Some(Time(Utc::now())),
        deletion_timestamp: current.deletion_timestamp,
    };
    ctx.kube
        .patch_domain_status(&d.namespace().unwrap_or_default(), &d.name_any(), &status)
        .await
        .map_err(|e| Error::sync(format!("failed updating domain status [{e}]")))
}
