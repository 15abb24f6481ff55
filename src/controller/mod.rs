//! The reconciliation runtime: watched caches feeding rate-limited work
//! queues, one worker per queue running the matching reconciler.

mod cache;
mod domain;
mod ingress;
mod kube_ops;
mod metrics;
mod queue;
mod service;
mod utils;

use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;

use kube::{Api, Client};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use cache::{object_key, run_watch, CacheEvent, Store};
pub use domain::{search_for_primary, sync_domain};
pub use ingress::{sync_ingress, AUTO_CLAIM_MAX_RETRIES};
pub use kube_ops::{KubeOps, KubeWriter};
pub use queue::TaskQueue;
pub use service::sync_services;
pub use utils::{
    adler32_hex, api_name, apis_by_host, host_matches_namespace, hosts_from_ingress,
    is_kong_ingress, parse_host, upstream_url, validate_ingress, DIRTY_ANNOTATION,
    INGRESS_CLASS_KEY, KONG_INGRESS_CLASS, PARENT_ANNOTATION,
};

use crate::crd::Domain;
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::kong::KongClient;
use crate::Result;

/// Configuration parameters for the controller
#[derive(Clone, Debug)]
pub struct Config {
    /// DNS suffix used when constructing upstream URLs
    pub cluster_dns: String,
    /// Namespace holding cluster-level primary domains
    pub pod_namespace: String,
    /// Create missing Domains from Ingress hosts
    pub auto_claim: bool,
    /// Orphan-sweep Kong routes when Domains vanish
    pub wipe_on_delete: bool,
    /// Seconds before a Failed Domain is retried
    pub resync_on_failed: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_dns: "svc.cluster.local".to_string(),
            pod_namespace: crate::DEFAULT_POD_NAMESPACE.to_string(),
            auto_claim: false,
            wipe_on_delete: false,
            resync_on_failed: 60,
        }
    }
}

/// Shared state handed to every reconciliation
pub struct Context {
    /// Controller configuration
    pub cfg: Config,
    /// Kubernetes write operations (trait object for testability)
    pub kube: Arc<dyn KubeOps>,
    /// Kong Admin API client
    pub kong: KongClient,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Watched Ingress cache
    pub ingresses: Arc<Store<Ingress>>,
    /// Watched Service cache
    pub services: Arc<Store<Service>>,
    /// Watched Domain cache
    pub domains: Arc<Store<Domain>>,
}

/// Watches the kubernetes api server and adds/removes apis on Kong
pub struct KongController {
    client: Client,
    ctx: Arc<Context>,
    resync_period: Duration,
    ing_queue: Arc<TaskQueue>,
    dom_queue: Arc<TaskQueue>,
    svc_queue: Arc<TaskQueue>,
}

impl KongController {
    /// Wire up caches, queues and contexts for a controller instance
    pub fn new(client: Client, kong: KongClient, cfg: Config, resync_period: Duration) -> Self {
        let ctx = Arc::new(Context {
            cfg,
            kube: Arc::new(KubeWriter::new(client.clone())),
            kong,
            events: Arc::new(KubeEventPublisher::new(client.clone(), "kong-controller")),
            ingresses: Store::new(),
            services: Store::new(),
            domains: Store::new(),
        });
        Self {
            client,
            ctx,
            resync_period,
            ing_queue: TaskQueue::new("kong_ingress_queue"),
            dom_queue: TaskQueue::new("kong_domain_queue"),
            svc_queue: TaskQueue::new("kong_service_queue"),
        }
    }

    /// Run the controller until `shutdown` is cancelled.
    ///
    /// Workers only start once the Ingress and Service caches finished their
    /// initial list. On shutdown the queues drain in LIFO order of creation
    /// and in-flight reconciliations run to completion.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("starting kong controller");
        let Self {
            client,
            ctx,
            resync_period,
            ing_queue,
            dom_queue,
            svc_queue,
        } = self;

        let mut watches: Vec<JoinHandle<()>> = Vec::new();
        {
            let api: Api<Ingress> = Api::all(client.clone());
            let queue = ing_queue.clone();
            watches.push(tokio::spawn(run_watch(
                api,
                ctx.ingresses.clone(),
                resync_period,
                shutdown.clone(),
                move |event| cache::handle_ingress_event(&queue, event),
            )));
        }
        {
            let api: Api<Service> = Api::all(client.clone());
            let queue = svc_queue.clone();
            watches.push(tokio::spawn(run_watch(
                api,
                ctx.services.clone(),
                resync_period,
                shutdown.clone(),
                move |event| cache::handle_service_event(&queue, event),
            )));
        }
        {
            let api: Api<Domain> = Api::all(client.clone());
            let queue = dom_queue.clone();
            let kube_ops = ctx.kube.clone();
            watches.push(tokio::spawn(run_watch(
                api,
                ctx.domains.clone(),
                resync_period,
                shutdown.clone(),
                move |event| cache::handle_domain_event(&queue, &kube_ops, event),
            )));
        }

        // wait for the initial lists before letting reconcilers read the
        // caches
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutting down kong controller before cache sync");
                return;
            }
            _ = async {
                ctx.ingresses.wait_synced().await;
                ctx.services.wait_synced().await;
            } => {}
        }
        info!("caches synced, starting workers");

        let workers = vec![
            tokio::spawn(worker(ing_queue.clone(), ctx.clone(), sync_ingress)),
            tokio::spawn(worker(dom_queue.clone(), ctx.clone(), sync_domain)),
            tokio::spawn(worker(svc_queue.clone(), ctx.clone(), sync_services)),
        ];

        shutdown.cancelled().await;
        info!("shutting down kong controller");
        svc_queue.shutdown();
        dom_queue.shutdown();
        ing_queue.shutdown();
        for handle in workers {
            let _ = handle.await;
        }
        for handle in watches {
            let _ = handle.await;
        }
    }
}

/// Pull keys off a queue and run `sync` on them until the queue drains.
/// Success forgets the per-key backoff, failures requeue rate-limited.
/// Reconcilers report terminal conditions (validation failures, settled
/// Failed phases) as success after surfacing them, so only retryable work
/// comes back.
async fn worker<F, Fut>(queue: Arc<TaskQueue>, ctx: Arc<Context>, sync: F)
where
    F: Fn(String, u32, Arc<Context>) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    while let Some(key) = queue.get().await {
        let requeues = queue.num_requeues(&key);
        let started = Instant::now();
        match sync(key.clone(), requeues, ctx.clone()).await {
            Ok(()) => queue.forget(&key),
            Err(e) => {
                warn!(queue = %queue.name(), %key, requeues, error = %e, "requeueing after failure");
                queue.add_rate_limited(key.clone());
            }
        }
        queue.observe_work_duration(started.elapsed());
        queue.done(&key);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::events::NoopEventPublisher;

    /// Build a [`Context`] over empty stores, a mocked kube seam and a Kong
    /// client pointing at `kong_url` (usually a wiremock server).
    pub(crate) fn context(cfg: Config, kube_ops: Arc<dyn KubeOps>, kong_url: &str) -> Context {
        Context {
            cfg,
            kube: kube_ops,
            kong: KongClient::new(kong_url).expect("test kong url"),
            events: Arc::new(NoopEventPublisher),
            ingresses: Store::new(),
            services: Store::new(),
            domains: Store::new(),
        }
    }
}
