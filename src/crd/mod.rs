//! Custom resource type definitions. Two kinds, group `tgp.io`, version
//! `v1`: [`nodeclass::NodeClass`] (cluster-scoped infrastructure template)
//! and [`nodepool::NodePool`] (namespaced, pod-driven provisioning request).

pub mod conditions;
pub mod nodeclass;
pub mod nodepool;

pub use nodeclass::{NodeClass, NodeClassSpec, NodeClassStatus};
pub use nodepool::{NodePool, NodePoolSpec, NodePoolStatus};

pub const NODECLASS_FINALIZER: &str = "tgp.io/gpunodeclass-finalizer";
pub const NODEPOOL_FINALIZER: &str = "tgp.io/gpunodepool-finalizer";
