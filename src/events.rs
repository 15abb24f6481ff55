//! Kubernetes Event recording for the controller.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that reconcilers can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "kong-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: actions::RECONCILE.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _note: Option<String>,
    ) {
        // intentionally empty
    }
}

/// Build an [`ObjectReference`] for any typed resource
pub fn object_ref<K>(obj: &K) -> ObjectReference
where
    K: Resource<DynamicType = ()>,
{
    ObjectReference {
        api_version: Some(K::api_version(&()).into_owned()),
        kind: Some(K::kind(&()).into_owned()),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        uid: obj.uid(),
        ..Default::default()
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// No OK-phase Domain backs an Ingress host, or a shared domain lost
    /// its primary
    pub const DOMAIN_NOT_FOUND: &str = "DomainNotFound";
    /// Another primary domain already claims the same name
    pub const DOMAIN_ALREADY_EXISTS: &str = "DomainAlreadyExists";
    /// An Ingress backend points at a Service that doesn't exist
    pub const SERVICE_NOT_FOUND: &str = "ServiceNotFound";
    /// The gateway rejected a route write
    pub const FAILED_ADD_ROUTE: &str = "FailedAddRoute";
    /// A Domain spec or an Ingress rule failed validation
    pub const INVALID: &str = "Invalid";
    /// A domain claim settled successfully
    pub const OK: &str = "OK";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Domain, DomainSpec};

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn object_ref_carries_group_version_kind() {
        let mut d = Domain::new("app-example-io", DomainSpec::default());
        d.metadata.namespace = Some("team-a".to_string());
        let r = object_ref(&d);
        assert_eq!(r.api_version.as_deref(), Some("platform.koli.io/v1"));
        assert_eq!(r.kind.as_deref(), Some("Domain"));
        assert_eq!(r.name.as_deref(), Some("app-example-io"));
        assert_eq!(r.namespace.as_deref(), Some("team-a"));
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        let obj_ref = ObjectReference::default();
        publisher
            .publish(
                &obj_ref,
                EventType::Warning,
                reasons::DOMAIN_NOT_FOUND,
                Some("The domain 'x.example.io' wasn't claimed".to_string()),
            )
            .await;
    }
}
