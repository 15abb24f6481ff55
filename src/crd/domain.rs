//! Domain Custom Resource Definition
//!
//! A Domain claims ownership of a hostname. A resource with an empty `sub` is
//! a *primary* domain; a non-empty `sub` makes it a *shared* domain living
//! under some primary, subject to delegation.

use chrono::{Duration, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::FINALIZER;

/// Specification of a domain claim
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "platform.koli.io",
    version = "v1",
    kind = "Domain",
    plural = "domains",
    namespaced,
    status = "DomainStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Primary","type":"string","jsonPath":".spec.primary"}"#,
    printcolumn = r#"{"name":"Sub","type":"string","jsonPath":".spec.sub"}"#
)]
pub struct DomainSpec {
    /// The name of the primary domain. A resource where `sub` is empty claims
    /// this name as a primary domain.
    pub primary: String,

    /// Label under the primary domain forming a subdomain; empty means the
    /// resource *is* the primary.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub: String,

    /// Namespaces allowed to claim shared domains under this primary.
    /// The wildcard `*` delegates to every namespace in the cluster.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delegates: Vec<String>,

    /// Namespace where the primary domain lives. Only meaningful for
    /// shared domains.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,
}

/// Status of a domain claim
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainStatus {
    /// The state of the claim; an empty phase means a new resource
    #[serde(default)]
    pub phase: DomainPhase,

    /// A human readable message indicating details about why the domain
    /// claim is in this state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// A brief CamelCase reason for the current phase, e.g. 'DomainNotFound'
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// The last time the status was updated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,

    /// Shadow of `metadata.deletionTimestamp`. CRD finalizers don't reliably
    /// survive a server-side delete round-trip, so the controller sets this
    /// field before starting cleanup and treats either timestamp as a
    /// deletion mark.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<Time>,
}

/// DomainPhase is a label for the condition of a domain at the current time.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DomainPhase {
    /// A new resource, the phase is not set yet
    #[default]
    #[serde(rename = "")]
    New,
    /// A claim request was received and is being processed
    Pending,
    /// The claim is settled, ingresses may route the domain
    #[serde(rename = "OK")]
    Ok,
    /// The resource failed claiming the domain
    Failed,
}

impl Domain {
    /// Current phase, New when no status was written yet
    pub fn phase(&self) -> DomainPhase {
        self.status
            .as_ref()
            .map(|s| s.phase.clone())
            .unwrap_or_default()
    }

    /// Returns true if the controller finalizer is set on the resource
    pub fn has_kong_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    /// Returns true if either deletion timestamp is set
    pub fn is_marked_for_deletion(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
            || self
                .status
                .as_ref()
                .is_some_and(|s| s.deletion_timestamp.is_some())
    }

    /// Returns true if it's a primary domain
    pub fn is_primary(&self) -> bool {
        self.spec.sub.is_empty()
    }

    /// Returns true if the spec describes a well-formed domain: the primary
    /// has at least two dot-segments and the sub at most one.
    pub fn is_valid_domain(&self) -> bool {
        self.spec.sub.split('.').count() <= 1 && self.spec.primary.split('.').count() >= 2
    }

    /// Returns true if the shared domain is a well-formed subdomain of the
    /// primary
    pub fn is_valid_shared_domain(&self) -> bool {
        !self.is_primary() && self.is_valid_domain()
    }

    /// The fully qualified name claimed by this resource
    pub fn fqdn(&self) -> String {
        if self.is_primary() {
            self.spec.primary.clone()
        } else {
            format!("{}.{}", self.spec.sub, self.spec.primary)
        }
    }

    /// The type of the resource: 'primary' or 'shared'
    pub fn domain_type(&self) -> &'static str {
        if self.is_primary() {
            "primary"
        } else {
            "shared"
        }
    }

    /// Returns true if the last status update is older than `expire_after`
    pub fn is_update_expired(&self, expire_after: Duration) -> bool {
        let last = self
            .status
            .as_ref()
            .and_then(|s| s.last_update_time.as_ref())
            .map(|t| t.0)
            .unwrap_or_default();
        last + expire_after < Utc::now()
    }

    /// `namespace/name` cache key of the resource
    pub fn store_key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn domain(primary: &str, sub: &str) -> Domain {
        Domain::new(
            "test",
            DomainSpec {
                primary: primary.to_string(),
                sub: sub.to_string(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn primary_domain_has_empty_sub() {
        assert!(domain("example.io", "").is_primary());
        assert!(!domain("example.io", "blog").is_primary());
    }

    #[test]
    fn fqdn_joins_sub_and_primary() {
        assert_eq!(domain("example.io", "").fqdn(), "example.io");
        assert_eq!(domain("example.io", "blog").fqdn(), "blog.example.io");
    }

    #[test]
    fn validity_counts_dot_segments() {
        // primary needs at least two segments
        assert!(!domain("example", "").is_valid_domain());
        assert!(domain("example.io", "").is_valid_domain());
        assert!(domain("sub.example.io", "").is_valid_domain());
        // sub must be a single label
        assert!(domain("example.io", "blog").is_valid_domain());
        assert!(!domain("example.io", "my.blog").is_valid_domain());
    }

    #[test]
    fn shared_validity_requires_non_primary() {
        assert!(!domain("example.io", "").is_valid_shared_domain());
        assert!(domain("example.io", "blog").is_valid_shared_domain());
        assert!(!domain("example.io", "my.blog").is_valid_shared_domain());
    }

    #[test]
    fn deletion_mark_honors_status_shadow() {
        let mut d = domain("example.io", "");
        assert!(!d.is_marked_for_deletion());

        d.status = Some(DomainStatus {
            deletion_timestamp: Some(Time(Utc::now())),
            ..Default::default()
        });
        assert!(d.is_marked_for_deletion());

        let mut d = domain("example.io", "");
        d.metadata.deletion_timestamp = Some(Time(Utc::now()));
        assert!(d.is_marked_for_deletion());
    }

    #[test]
    fn phase_defaults_to_new() {
        let d = domain("example.io", "");
        assert_eq!(d.phase(), DomainPhase::New);

        let json = serde_json::to_value(DomainPhase::New).unwrap();
        assert_eq!(json, serde_json::Value::String(String::new()));
        let json = serde_json::to_value(DomainPhase::Ok).unwrap();
        assert_eq!(json, serde_json::Value::String("OK".to_string()));
    }

    #[test]
    fn update_expiry_compares_against_now() {
        let mut d = domain("example.io", "");
        d.status = Some(DomainStatus {
            last_update_time: Some(Time(Utc::now() - Duration::seconds(120))),
            ..Default::default()
        });
        assert!(d.is_update_expired(Duration::seconds(60)));
        assert!(!d.is_update_expired(Duration::seconds(300)));
        // no status at all counts as expired
        assert!(domain("example.io", "").is_update_expired(Duration::seconds(60)));
    }

    #[test]
    fn finalizer_detection() {
        let mut d = domain("example.io", "");
        assert!(!d.has_kong_finalizer());
        d.metadata = ObjectMeta {
            finalizers: Some(vec![FINALIZER.to_string()]),
            ..d.metadata
        };
        assert!(d.has_kong_finalizer());
    }
}
