//! Watched, indexed caches over cluster state.
//!
//! Each cache is a [`Store`] kept current by a `kube` watcher stream plus a
//! periodic resync that replays every cached object as a synthetic update,
//! bounding staleness. Event handlers translate cache events into
//! `namespace/name` keys on the work queues; reconcilers read the stores
//! instead of hitting the apiserver.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::kube_ops::KubeOps;
use super::queue::TaskQueue;
use super::utils::{adler32_hex, is_kong_ingress};
use crate::crd::{Domain, DomainPhase, DomainStatus};

/// `namespace/name` key of a cached object
pub fn object_key<K: ResourceExt>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// A thread-safe object store keyed by `namespace/name`.
pub struct Store<K> {
    items: RwLock<HashMap<String, Arc<K>>>,
    synced: AtomicBool,
    synced_notify: Notify,
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            synced: AtomicBool::new(false),
            synced_notify: Notify::new(),
        }
    }
}

impl<K> Store<K> {
    /// Create an empty store
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get an object by its `namespace/name` key
    pub fn get(&self, key: &str) -> Option<Arc<K>> {
        self.items.read().expect("store poisoned").get(key).cloned()
    }

    /// Every cached object
    pub fn list(&self) -> Vec<Arc<K>> {
        self.items
            .read()
            .expect("store poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Objects cached under the given namespace
    pub fn list_namespace(&self, namespace: &str) -> Vec<Arc<K>> {
        let prefix = format!("{namespace}/");
        self.items
            .read()
            .expect("store poisoned")
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Every cached key
    pub fn keys(&self) -> Vec<String> {
        self.items
            .read()
            .expect("store poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Mark the initial list as complete and wake waiters
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
        self.synced_notify.notify_waiters();
    }

    /// Returns true once the initial list completed
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Wait until the initial list completed
    pub async fn wait_synced(&self) {
        while !self.has_synced() {
            let notified = self.synced_notify.notified();
            if self.has_synced() {
                return;
            }
            notified.await;
        }
    }
}

impl<K: ResourceExt> Store<K> {
    /// Insert an object, returning the previously cached version
    pub fn insert(&self, obj: K) -> Option<Arc<K>> {
        let key = object_key(&obj);
        self.items
            .write()
            .expect("store poisoned")
            .insert(key, Arc::new(obj))
    }

    /// Remove an object by key, returning the cached version
    pub fn remove(&self, key: &str) -> Option<Arc<K>> {
        self.items.write().expect("store poisoned").remove(key)
    }

    /// Swap the full content of the store, returning the previous content
    fn replace_all(&self, items: HashMap<String, Arc<K>>) -> HashMap<String, Arc<K>> {
        std::mem::replace(&mut *self.items.write().expect("store poisoned"), items)
    }
}

/// An observed change on a cached object
pub enum CacheEvent<K> {
    /// The object appeared
    Added(Arc<K>),
    /// The object changed (or was replayed by a resync, old == new)
    Updated {
        /// Previously cached version
        old: Arc<K>,
        /// Currently cached version
        new: Arc<K>,
    },
    /// The object is gone
    Deleted(Arc<K>),
}

/// Follow a watcher stream, keep `store` current and feed every change to
/// `handler`. Replays the whole store as synthetic updates every
/// `resync_period`. Runs until `shutdown` is cancelled.
pub async fn run_watch<K>(
    api: Api<K>,
    store: Arc<Store<K>>,
    resync_period: Duration,
    shutdown: CancellationToken,
    handler: impl Fn(CacheEvent<K>) + Send + Sync + 'static,
) where
    K: kube::Resource<DynamicType = ()>
        + ResourceExt
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    let stream = watcher(api, watcher::Config::default().any_semantic()).default_backoff();
    tokio::pin!(stream);

    let mut resync = tokio::time::interval_at(
        tokio::time::Instant::now() + resync_period,
        resync_period,
    );
    let mut pending: Option<HashMap<String, Arc<K>>> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("watch loop stopped");
                return;
            }
            _ = resync.tick() => {
                for obj in store.list() {
                    handler(CacheEvent::Updated { old: obj.clone(), new: obj });
                }
            }
            event = stream.next() => {
                match event {
                    Some(Ok(watcher::Event::Init)) => {
                        pending = Some(HashMap::new());
                    }
                    Some(Ok(watcher::Event::InitApply(obj))) => {
                        if let Some(buf) = pending.as_mut() {
                            buf.insert(object_key(&obj), Arc::new(obj));
                        }
                    }
                    Some(Ok(watcher::Event::InitDone)) => {
                        let fresh = pending.take().unwrap_or_default();
                        let old = store.replace_all(fresh.clone());
                        for (key, new) in &fresh {
                            match old.get(key) {
                                None => handler(CacheEvent::Added(new.clone())),
                                Some(prev)
                                    if prev.resource_version() != new.resource_version() =>
                                {
                                    handler(CacheEvent::Updated {
                                        old: prev.clone(),
                                        new: new.clone(),
                                    });
                                }
                                Some(_) => {}
                            }
                        }
                        for (key, gone) in old {
                            if !fresh.contains_key(&key) {
                                handler(CacheEvent::Deleted(gone));
                            }
                        }
                        store.mark_synced();
                    }
                    Some(Ok(watcher::Event::Apply(obj))) => {
                        let new = Arc::new(obj.clone());
                        match store.insert(obj) {
                            None => handler(CacheEvent::Added(new)),
                            Some(old) => handler(CacheEvent::Updated { old, new }),
                        }
                    }
                    Some(Ok(watcher::Event::Delete(obj))) => {
                        store.remove(&object_key(&obj));
                        handler(CacheEvent::Deleted(Arc::new(obj)));
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "watch error, backing off");
                    }
                    None => {
                        warn!("watch stream ended");
                        return;
                    }
                }
            }
        }
    }
}

/// Ingress cache handler: enqueue keys for Ingresses matching the kong
/// class; updates only when the resource version moved.
pub fn handle_ingress_event(queue: &TaskQueue, event: CacheEvent<Ingress>) {
    match event {
        CacheEvent::Added(ing) | CacheEvent::Deleted(ing) => {
            if is_kong_ingress(&ing) {
                queue.add(object_key(&*ing));
            } else {
                debug!(ingress = %ing.name_any(), "ignoring ingress based on class annotation");
            }
        }
        CacheEvent::Updated { old, new } => {
            if old.resource_version() != new.resource_version() && is_kong_ingress(&new) {
                queue.add(object_key(&*new));
            }
        }
    }
}

/// Service cache handler: every add and delete enqueues, updates only when
/// the resource version moved.
pub fn handle_service_event(queue: &TaskQueue, event: CacheEvent<Service>) {
    match event {
        CacheEvent::Added(svc) | CacheEvent::Deleted(svc) => queue.add(object_key(&*svc)),
        CacheEvent::Updated { old, new } => {
            if old.resource_version() != new.resource_version() {
                queue.add(object_key(&*new));
            }
        }
    }
}

/// Domain cache handler. `(primary, sub)` must be immutable once set; when
/// an update changes the pair, a *shadow* Domain carrying the old spec and a
/// status deletion timestamp is posted so the garbage collector reclaims the
/// routes of the old hostname.
pub fn handle_domain_event(
    queue: &TaskQueue,
    kube: &Arc<dyn KubeOps>,
    event: CacheEvent<Domain>,
) {
    match event {
        CacheEvent::Added(d) | CacheEvent::Deleted(d) => queue.add(object_key(&*d)),
        CacheEvent::Updated { old, new } => {
            if old.spec.primary != new.spec.primary || old.spec.sub != new.spec.sub {
                let shadow = shadow_domain(&old, &new);
                let kube = kube.clone();
                let namespace = shadow.namespace().unwrap_or_default();
                tokio::spawn(async move {
                    if let Err(e) = kube.create_domain(&namespace, &shadow).await {
                        warn!(
                            domain = %shadow.name_any(),
                            error = %e,
                            "failed recovering routes of a renamed domain"
                        );
                    }
                });
            }
            if old.resource_version() != new.resource_version()
                || new.phase() == DomainPhase::Failed
            {
                queue.add(object_key(&*new));
            }
        }
    }
}

/// Build the shadow resource that stands in for the old hostname of a
/// renamed Domain until its routes are wiped.
fn shadow_domain(old: &Domain, new: &Domain) -> Domain {
    let name = format!(
        "{}-{}",
        old.name_any(),
        adler32_hex(&format!("{}{}", new.spec.primary, new.spec.sub))
    );
    let mut shadow = Domain::new(&name, old.spec.clone());
    shadow.metadata.namespace = old.namespace();
    let mut status = old.status.clone().unwrap_or_else(|| DomainStatus {
        phase: DomainPhase::New,
        ..Default::default()
    });
    status.deletion_timestamp = Some(Time(Utc::now()));
    shadow.status = Some(status);
    shadow
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::kube_ops::MockKubeOps;
    use crate::crd::DomainSpec;

    fn domain(namespace: &str, name: &str, primary: &str, sub: &str, rv: &str) -> Domain {
        let mut d = Domain::new(
            name,
            DomainSpec {
                primary: primary.to_string(),
                sub: sub.to_string(),
                ..Default::default()
            },
        );
        d.metadata.namespace = Some(namespace.to_string());
        d.metadata.resource_version = Some(rv.to_string());
        d
    }

    #[test]
    fn store_indexes_by_namespace() {
        let store: Arc<Store<Domain>> = Store::new();
        store.insert(domain("ns-a", "one", "example.io", "", "1"));
        store.insert(domain("ns-a", "two", "example.io", "blog", "1"));
        store.insert(domain("ns-b", "three", "other.io", "", "1"));

        assert_eq!(store.list().len(), 3);
        assert_eq!(store.list_namespace("ns-a").len(), 2);
        assert_eq!(store.list_namespace("ns-b").len(), 1);
        assert!(store.get("ns-a/one").is_some());
        assert!(store.get("ns-c/one").is_none());

        store.remove("ns-a/one");
        assert_eq!(store.list_namespace("ns-a").len(), 1);
    }

    #[test]
    fn store_insert_returns_previous_version() {
        let store: Arc<Store<Domain>> = Store::new();
        assert!(store.insert(domain("ns", "d", "example.io", "", "1")).is_none());
        let old = store
            .insert(domain("ns", "d", "example.io", "", "2"))
            .expect("previous version");
        assert_eq!(old.resource_version().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn wait_synced_wakes_on_mark() {
        let store: Arc<Store<Domain>> = Store::new();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_synced().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        store.mark_synced();
        waiter.await.unwrap();
        assert!(store.has_synced());
    }

    #[tokio::test]
    async fn ingress_updates_enqueue_only_on_version_change() {
        use super::super::utils::tests::{ingress, ingress_path, ingress_rule};

        let queue = TaskQueue::new("kong_test_queue");
        let mut a = ingress(
            "team-acme-org",
            "web",
            &[],
            vec![ingress_rule(
                "app-team-acme-org.example.io",
                vec![ingress_path("/", "web", 80)],
            )],
        );
        a.metadata.resource_version = Some("1".to_string());
        let mut b = a.clone();
        b.metadata.resource_version = Some("2".to_string());

        handle_ingress_event(
            &queue,
            CacheEvent::Updated {
                old: Arc::new(a.clone()),
                new: Arc::new(a.clone()),
            },
        );
        assert!(queue.is_empty(), "same version must not enqueue");

        handle_ingress_event(
            &queue,
            CacheEvent::Updated {
                old: Arc::new(a),
                new: Arc::new(b),
            },
        );
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn non_kong_ingresses_are_ignored() {
        use super::super::utils::tests::{ingress, ingress_rule};
        use super::super::utils::INGRESS_CLASS_KEY;

        let queue = TaskQueue::new("kong_test_queue");
        let ing = ingress(
            "team-acme-org",
            "web",
            &[(INGRESS_CLASS_KEY, "nginx")],
            vec![ingress_rule("app-team-acme-org.example.io", vec![])],
        );
        handle_ingress_event(&queue, CacheEvent::Added(Arc::new(ing)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn failed_domains_reenqueue_on_resync() {
        let queue = TaskQueue::new("kong_test_queue");
        let kube: Arc<dyn KubeOps> = Arc::new(MockKubeOps::new());

        let mut d = domain("ns", "d", "example.io", "", "7");
        d.status = Some(DomainStatus {
            phase: DomainPhase::Failed,
            ..Default::default()
        });
        let d = Arc::new(d);

        // resync replays the object with old == new; same version but the
        // Failed phase forces a pass through the reconciler
        handle_domain_event(
            &queue,
            &kube,
            CacheEvent::Updated {
                old: d.clone(),
                new: d.clone(),
            },
        );
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn renamed_domains_post_a_shadow_resource() {
        let queue = TaskQueue::new("kong_test_queue");

        let mut mock = MockKubeOps::new();
        let (tx, rx) = std::sync::mpsc::channel::<Domain>();
        mock.expect_create_domain().returning(move |_, d| {
            tx.send(d.clone()).unwrap();
            Ok(d.clone())
        });
        let kube: Arc<dyn KubeOps> = Arc::new(mock);

        let old = Arc::new(domain("ns", "app-example-io", "example.io", "app", "1"));
        let new = Arc::new(domain("ns", "app-example-io", "example.io", "www", "2"));

        handle_domain_event(
            &queue,
            &kube,
            CacheEvent::Updated {
                old: old.clone(),
                new,
            },
        );
        // the create runs on a spawned task
        tokio::task::yield_now().await;

        let shadow = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(shadow.spec.sub, "app", "shadow carries the old spec");
        assert!(shadow.name_any().starts_with("app-example-io-"));
        assert!(shadow.is_marked_for_deletion());
        assert_eq!(queue.len(), 1, "version change also enqueues");
    }
}
