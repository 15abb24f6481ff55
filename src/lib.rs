//! Kong ingress controller for Kubernetes.
//!
//! The controller watches Ingress, Service and Domain resources and keeps the
//! routing table of a Kong gateway (its Admin API "API objects") in sync with
//! the hostnames claimed inside the cluster.
//!
//! # Architecture
//!
//! Cluster events flow through three watched caches into three rate-limited
//! work queues (Ingress, Domain, Service). One worker per queue pulls keys and
//! runs the matching reconciler, which reads the caches and the Kong Admin API
//! and converges both sides. Errors requeue the key with exponential backoff.
//!
//! # Modules
//!
//! - [`crd`] - the Domain custom resource and its derived predicates
//! - [`kong`] - typed client for the Kong Admin API
//! - [`controller`] - caches, task queues, reconcilers and the orchestrator
//! - [`events`] - Kubernetes Event publishing
//! - [`startup`] - CRD installation and namespace bootstrap
//! - [`monitoring`] - health and metrics HTTP surface
//! - [`error`] - error types for the controller

pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod kong;
pub mod monitoring;
pub mod startup;
pub mod version;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// The namespace used for cluster-level primary domains when the controller
/// is not told otherwise (`--pod-namespace` / `POD_NAMESPACE`).
pub const DEFAULT_POD_NAMESPACE: &str = "kong-system";

/// Minimal Kong minor version the controller is known to work against.
pub const MINIMAL_MINOR_KONG_VERSION: u64 = 10;
