//! Custom Resource Definitions owned by the controller.

mod domain;

pub use domain::{Domain, DomainPhase, DomainSpec, DomainStatus};

/// Finalizer attached to Domains and Services so Kong routes are cleaned up
/// before Kubernetes reaps the resource.
pub const FINALIZER: &str = "kolihub.io/kong";

/// API group of the Domain resource
pub const GROUP: &str = "platform.koli.io";
