//! `tgp-operator`: a Kubernetes operator that provisions ephemeral GPU
//! compute nodes across heterogeneous cloud providers.
//!
//! The two watched custom resources, `NodeClass` and `NodePool`, are
//! reconciled independently (`controller::nodeclass`, `controller::nodepool`)
//! against a shared [`provider::Provider`] abstraction layer.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod offering;
pub mod pricing;
pub mod provider;
pub mod selector;
pub mod template;
