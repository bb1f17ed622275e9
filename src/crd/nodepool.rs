//! `NodePool`: the namespaced, pod-driven provisioning request that
//! references a `NodeClass`. Reconciled in `controller::nodepool`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Taint;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::conditions::Condition;

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeClassRef {
    #[serde(default = "default_nodeclass_kind")]
    pub kind: String,
    pub name: String,
    #[serde(default = "default_nodeclass_group")]
    pub group: String,
}

fn default_nodeclass_kind() -> String {
    "NodeClass".to_string()
}

fn default_nodeclass_group() -> String {
    "tgp.io".to_string()
}

/// A single node-selector-style requirement (key/operator/values), mirroring
/// the shape Kubernetes itself uses for node affinity so the template reads
/// familiarly to anyone who has written a `NodeSelectorRequirement`.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct Requirement {
    pub key: String,
    pub operator: String,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct NodeTemplateMetadata {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct NodeTemplateSpec {
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    #[serde(default)]
    pub startup_taints: Vec<Taint>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct NodeTemplate {
    #[serde(default)]
    pub metadata: NodeTemplateMetadata,
    #[serde(default)]
    pub spec: NodeTemplateSpec,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConsolidationPolicy {
    WhenEmpty,
    WhenUnderutilized,
    Never,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Disruption {
    #[serde(default = "default_consolidation_policy")]
    pub consolidation_policy: ConsolidationPolicy,
    /// Seconds of observed idleness before a node becomes eligible for
    /// consolidation.
    #[serde(default)]
    pub consolidate_after_secs: Option<u64>,
    /// Maximum node lifetime in seconds before forced recycling.
    #[serde(default)]
    pub expire_after_secs: Option<u64>,
}

fn default_consolidation_policy() -> ConsolidationPolicy {
    ConsolidationPolicy::WhenEmpty
}

impl Default for Disruption {
    fn default() -> Self {
        Self {
            consolidation_policy: default_consolidation_policy(),
            consolidate_after_secs: None,
            expire_after_secs: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolLimits {
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "tgp.io",
    version = "v1",
    kind = "NodePool",
    namespaced
)]
#[kube(status = "NodePoolStatus")]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    pub node_class_ref: NodeClassRef,
    #[serde(default)]
    pub template: NodeTemplate,
    /// Parses as a decimal; validated at reconcile time since
    /// the CRD schema can't express "must parse as a decimal" beyond typing
    /// it `f64` to begin with.
    pub max_hourly_price: f64,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub disruption: Disruption,
    #[serde(default)]
    pub limits: NodePoolLimits,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub node_count: u32,
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn crd_generates_expected_names() {
        let crd = NodePool::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("nodepools.tgp.io"));
        assert_eq!(crd.spec.names.kind, "NodePool");
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn node_class_ref_defaults_kind_and_group() {
        let json = r#"{"name": "gpu-fleet"}"#;
        let parsed: NodeClassRef = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.kind, "NodeClass");
        assert_eq!(parsed.group, "tgp.io");
        assert_eq!(parsed.name, "gpu-fleet");
    }

    #[test]
    fn disruption_defaults_to_when_empty() {
        let disruption = Disruption::default();
        assert_eq!(disruption.consolidation_policy, ConsolidationPolicy::WhenEmpty);
    }

    #[test]
    fn spec_roundtrips_through_json() {
        let spec = NodePoolSpec {
            node_class_ref: NodeClassRef {
                kind: "NodeClass".into(),
                name: "gpu-fleet".into(),
                group: "tgp.io".into(),
            },
            template: NodeTemplate::default(),
            max_hourly_price: 2.5,
            weight: 10,
            disruption: Disruption::default(),
            limits: NodePoolLimits::default(),
        };
        let json = serde_json::to_string(&spec).unwrap();
        let back: NodePoolSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_hourly_price, 2.5);
        assert_eq!(back.weight, 10);
    }
}
