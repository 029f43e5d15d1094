//! Update planning and status aggregation for InstanceSets.
//!
//! An [`InstanceSet`](crd::InstanceSet) manages named, ordered and role-aware Pods. This crate
//! contains the parts of its controller which don't talk to the API server:
//!
//! - [`names`] resolves the names of all desired instances.
//! - [`plan`] decides which outdated instances may be replaced next.
//! - [`status`] aggregates the observed Pods into the status of the InstanceSet.
//! - [`reconcile`] wraps both into reconcilers operating on an [`ObjectTree`](reconcile::ObjectTree).

pub mod cli;
pub mod crd;
pub mod logging;
pub mod names;
pub mod node_selector;
pub mod plan;
pub mod pod_utils;
pub mod reconcile;
pub mod role;
pub mod status;
pub mod utils;

// External re-exports
pub use k8s_openapi;
pub use kube;
pub use schemars;
