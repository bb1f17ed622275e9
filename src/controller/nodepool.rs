//! NodePool reconciler: pod-driven provisioning, at-most-one-launch
//! per reconcile, and drain/terminate cleanup on deletion.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{Node, NodeSpec, Pod, Secret, Taint};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::Controller;
use kube::{Resource, ResourceExt};
use tracing::{error, info, warn};

use crate::controller::Context;
use crate::crd::conditions::{set_condition, Condition, ConditionStatus};
use crate::crd::nodepool::{ConsolidationPolicy, Disruption, Requirement};
use crate::crd::{NodeClass, NodePool, NodePoolStatus, NODEPOOL_FINALIZER};
use crate::error::OperatorError;
use crate::offering::{has_gpu_request, GpuModel, PodResources, Region};
use crate::provider::factory::{build_provider, ProviderName};
use crate::provider::{LaunchRequest, Provider};
use crate::selector::{select_best, Candidate};
use crate::template::{render, TemplateVariables};

pub const INSTANCE_ID_ANNOTATION: &str = "tgp.io/instance-id";
pub const PROVIDER_ANNOTATION: &str = "tgp.io/provider";
pub const GPU_TYPE_ANNOTATION: &str = "tgp.io/gpu-type";
pub const HOURLY_PRICE_ANNOTATION: &str = "tgp.io/hourly-price";
pub const POOL_LABEL: &str = "tgp.io/pool";

pub async fn run(ctx: Arc<Context>) {
    let api: Api<NodePool> = Api::all(ctx.client.clone());
    Controller::new(api, Default::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => info!(object = ?o.0, "nodepool reconciled"),
                Err(e) => error!(error = %e, "nodepool reconcile failed"),
            }
        })
        .await;
}

async fn reconcile(obj: Arc<NodePool>, ctx: Arc<Context>) -> Result<Action, OperatorError> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<NodePool> = Api::namespaced(ctx.client.clone(), &namespace);
    let ctx_for_closure = ctx.clone();
    finalizer(&api, NODEPOOL_FINALIZER, obj, move |event| {
        let ctx = ctx_for_closure.clone();
        async move {
            match event {
                FinalizerEvent::Apply(obj) => apply(obj, &ctx).await,
                FinalizerEvent::Cleanup(obj) => cleanup(obj, &ctx).await,
            }
        }
    })
    .await
    .map_err(|e| OperatorError::Validation {
        field: "nodepool".to_string(),
        reason: e.to_string(),
    })
}

fn error_policy(_obj: Arc<NodePool>, _err: &OperatorError, ctx: Arc<Context>) -> Action {
    Action::requeue(ctx.config.missing_nodeclass_requeue())
}

async fn patch_status(api: &Api<NodePool>, name: &str, status: &NodePoolStatus) -> Result<(), OperatorError> {
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
        .await?;
    Ok(())
}

async fn resolve_credential(client: kube::Client, namespace: &str, secret_name: &str, key: &str) -> Option<String> {
    let secrets: Api<Secret> = Api::namespaced(client, namespace);
    let secret = secrets.get(secret_name).await.ok()?;
    let data = secret.data?;
    let bytes = data.get(key)?;
    String::from_utf8(bytes.0.clone()).ok()
}

/// Builds one [`Provider`] per enabled provider config on `class`, skipping
/// any whose credential can't be resolved (mirrors the NodeClass reconciler's
/// own skip-on-missing-credential behaviour).
async fn build_candidate_providers(ctx: &Context, class: &NodeClass) -> Vec<(Provider, u32)> {
    let mut providers = Vec::new();
    for provider_cfg in class.spec.enabled_providers() {
        let Ok(provider_name) = ProviderName::parse(&provider_cfg.name) else {
            continue;
        };
        let secret_namespace = provider_cfg
            .credentials_ref
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let Some(credential) = resolve_credential(
            ctx.client.clone(),
            &secret_namespace,
            &provider_cfg.credentials_ref.name,
            &provider_cfg.credentials_ref.key,
        )
        .await
        else {
            continue;
        };
        providers.push((build_provider(provider_name, &credential, ctx.adapter_handle()), provider_cfg.priority));
    }
    providers
}

fn node_selector_satisfied(pod: &Pod, template_labels: &BTreeMap<String, String>, requirements: &[Requirement]) -> bool {
    let selector = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_selector.clone())
        .unwrap_or_default();

    selector.iter().all(|(key, value)| {
        template_labels.get(key).map(|v| v == value).unwrap_or(false)
            || requirements
                .iter()
                .any(|r| &r.key == key && r.values.contains(value))
    })
}

fn tolerates_all_taints(pod: &Pod, taints: &[Taint]) -> bool {
    let tolerations = pod
        .spec
        .as_ref()
        .and_then(|s| s.tolerations.clone())
        .unwrap_or_default();

    taints.iter().all(|taint| {
        tolerations.iter().any(|t| {
            let key_matches = t.key.as_deref().map(|k| k == taint.key).unwrap_or(true);
            let effect_matches = t.effect.as_deref().map(|e| e == taint.effect).unwrap_or(true);
            let value_matches = match t.operator.as_deref() {
                Some("Exists") => true,
                _ => t.value.as_deref() == taint.value.as_deref(),
            };
            key_matches && effect_matches && value_matches
        })
    })
}

fn is_eligible(pod: &Pod, template_labels: &BTreeMap<String, String>, requirements: &[Requirement], taints: &[Taint]) -> bool {
    let unscheduled = pod.spec.as_ref().and_then(|s| s.node_name.as_ref()).is_none();
    let pending = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|p| p == "Pending")
        .unwrap_or(false);

    pending
        && unscheduled
        && has_gpu_request(pod)
        && node_selector_satisfied(pod, template_labels, requirements)
        && tolerates_all_taints(pod, taints)
}

/// VRAM-band lookup: ≤2 GiB → smallest, ≤8 GiB → mid-tier, else →
/// largest, among GPU types the NodeClass allows.
fn gpu_type_from_vram_band(class: &NodeClass, min_vram_gib: Option<u32>) -> GpuModel {
    let mut candidates: Vec<GpuModel> = [
        GpuModel::NvidiaT4,
        GpuModel::NvidiaL4,
        GpuModel::NvidiaA10G,
        GpuModel::NvidiaA100,
        GpuModel::NvidiaH100,
    ]
    .into_iter()
    .filter(|g| class.spec.allows_gpu_type(g))
    .collect();
    candidates.sort_by_key(|g| g.typical_vram_gib());

    if candidates.is_empty() {
        return GpuModel::NvidiaA100;
    }

    match min_vram_gib {
        Some(v) if v <= 2 => candidates.first().cloned().unwrap(),
        Some(v) if v <= 8 => candidates.get(candidates.len() / 2).cloned().unwrap_or_else(|| candidates[0].clone()),
        _ => candidates.last().cloned().unwrap(),
    }
}

async fn apply(obj: Arc<NodePool>, ctx: &Context) -> Result<Action, OperatorError> {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<NodePool> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut status = obj.status.clone().unwrap_or_default();

    let nodeclass_api: Api<NodeClass> = Api::all(ctx.client.clone());
    let Ok(class) = nodeclass_api.get(&obj.spec.node_class_ref.name).await else {
        set_condition(
            &mut status.conditions,
            Condition::new(
                "NodeClassReady",
                ConditionStatus::False,
                "NodeClassMissing",
                format!("referenced NodeClass `{}` not found", obj.spec.node_class_ref.name),
                Utc::now(),
            ),
        );
        patch_status(&api, &name, &status).await?;
        return Ok(Action::requeue(ctx.config.missing_nodeclass_requeue()));
    };
    set_condition(
        &mut status.conditions,
        Condition::new("NodeClassReady", ConditionStatus::True, "Resolved", "nodeclass resolved", Utc::now()),
    );

    let pods_api: Api<Pod> = Api::all(ctx.client.clone());
    let all_pods = pods_api.list(&ListParams::default()).await?;

    let template_labels = &obj.spec.template.metadata.labels;
    let requirements = &obj.spec.template.spec.requirements;
    let taints = &obj.spec.template.spec.taints;

    let eligible: Vec<&Pod> = all_pods
        .iter()
        .filter(|p| is_eligible(p, template_labels, requirements, taints))
        .collect();

    if let Some(pod) = eligible.first() {
        match provision_one(pod, &obj, &class, ctx).await {
            Ok(()) => {
                set_condition(
                    &mut status.conditions,
                    Condition::new("ProvisioningFailed", ConditionStatus::False, "Launched", "provisioned a node", Utc::now()),
                );
            }
            Err(e) => {
                warn!(nodepool = %name, error = %e, "provisioning failed");
                set_condition(
                    &mut status.conditions,
                    Condition::new("ProvisioningFailed", ConditionStatus::True, "ProvisioningFailed", e.to_string(), Utc::now()),
                );
            }
        }
    }

    let nodes_api: Api<Node> = Api::all(ctx.client.clone());
    let owned_nodes = nodes_api
        .list(&ListParams::default().labels(&format!("{POOL_LABEL}={name}")))
        .await?;

    let candidate_providers = build_candidate_providers(ctx, &class).await;
    sweep_disruptable_nodes(ctx, &obj, &owned_nodes.items, &all_pods.items, &candidate_providers).await;

    let owned_nodes = nodes_api
        .list(&ListParams::default().labels(&format!("{POOL_LABEL}={name}")))
        .await?;
    status.node_count = owned_nodes.items.len() as u32;
    refresh_instance_gauges(&owned_nodes.items);

    patch_status(&api, &name, &status).await?;
    Ok(Action::requeue(ctx.config.nodepool_requeue()))
}

/// Republishes the active-instance-count and per-instance hourly-cost
/// gauges from the annotations `create_node_record` stamped at launch.
fn refresh_instance_gauges(nodes: &[Node]) {
    let mut counts: BTreeMap<String, i64> = BTreeMap::new();
    for node in nodes {
        let annotations = node.metadata.annotations.as_ref();
        let Some(provider_name) = annotations.and_then(|a| a.get(PROVIDER_ANNOTATION)) else {
            continue;
        };
        *counts.entry(provider_name.clone()).or_insert(0) += 1;

        if let (Some(instance_id), Some(price)) = (
            annotations.and_then(|a| a.get(INSTANCE_ID_ANNOTATION)),
            annotations
                .and_then(|a| a.get(HOURLY_PRICE_ANNOTATION))
                .and_then(|p| p.parse::<f64>().ok()),
        ) {
            crate::metrics::set_instance_hourly_cost(provider_name, instance_id, price);
        }
    }
    for (provider_name, count) in &counts {
        crate::metrics::set_active_instances(provider_name, *count);
    }
}

fn node_is_occupied(node_name: &str, pods: &[Pod]) -> bool {
    pods.iter()
        .any(|p| p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node_name))
}

/// Why `plan_disruption_sweep` decided a node should be recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecycleReason {
    Expired,
    Consolidated,
}

/// The facts `plan_disruption_sweep` needs about one owned `Node`, stripped
/// of everything that requires a live cluster to compute — callers derive
/// this from a `Node` record plus the pod list already fetched for pod
/// eligibility.
pub struct NodeSweepFacts<'a> {
    pub name: &'a str,
    pub age_secs: i64,
    pub occupied: bool,
}

/// Pure disruption policy: given a pool's `Disruption` config and the
/// observed facts about its owned nodes, decides which nodes to recycle and
/// why. Contains no I/O so it can be exercised directly against constructed
/// `NodeSweepFacts` without a `kube::Client`.
pub fn plan_disruption_sweep(disruption: &Disruption, nodes: &[NodeSweepFacts]) -> Vec<(String, RecycleReason)> {
    if disruption.consolidation_policy == ConsolidationPolicy::Never && disruption.expire_after_secs.is_none() {
        return Vec::new();
    }

    nodes
        .iter()
        .filter_map(|node| {
            let expired = disruption
                .expire_after_secs
                .is_some_and(|limit| node.age_secs >= limit as i64);
            if expired {
                return Some((node.name.to_string(), RecycleReason::Expired));
            }

            let consolidatable = disruption.consolidation_policy != ConsolidationPolicy::Never
                && !node.occupied
                && disruption
                    .consolidate_after_secs
                    .is_some_and(|limit| node.age_secs >= limit as i64);
            consolidatable.then(|| (node.name.to_string(), RecycleReason::Consolidated))
        })
        .collect()
}

/// Computes [`NodeSweepFacts`] for `owned_nodes` against `all_pods`, plans
/// the sweep, then executes each recycle decision (cordon/drain/terminate/
/// delete) and emits `record_idle_timeout` for consolidation-driven recycles.
async fn sweep_disruptable_nodes(
    ctx: &Context,
    pool: &NodePool,
    owned_nodes: &[Node],
    all_pods: &[Pod],
    candidate_providers: &[(Provider, u32)],
) {
    let now = Utc::now();
    let facts: Vec<NodeSweepFacts> = owned_nodes
        .iter()
        .map(|node| NodeSweepFacts {
            name: node.metadata.name.as_deref().unwrap_or_default(),
            age_secs: node
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| (now - t.0).num_seconds().max(0))
                .unwrap_or(0),
            occupied: node_is_occupied(node.metadata.name.as_deref().unwrap_or_default(), all_pods),
        })
        .collect();

    let plan = plan_disruption_sweep(&pool.spec.disruption, &facts);
    for (node_name, reason) in plan {
        let Some(node) = owned_nodes.iter().find(|n| n.name_any() == node_name) else {
            continue;
        };
        info!(node = %node_name, pool = %pool.name_any(), ?reason, "recycling disrupted node");
        let (provider_name, gpu_type) = drain_terminate_and_delete(ctx, node, candidate_providers).await;
        if reason == RecycleReason::Consolidated {
            if let (Some(provider_name), Some(gpu_type)) = (provider_name, gpu_type) {
                crate::metrics::record_idle_timeout(&provider_name, &gpu_type);
            }
        }
    }
}

async fn provision_one(pod: &Pod, pool: &NodePool, class: &NodeClass, ctx: &Context) -> Result<(), OperatorError> {
    let demand = PodResources::from_pod(pod).map_err(|e| OperatorError::Validation {
        field: "pod".to_string(),
        reason: e.to_string(),
    })?;

    let gpu_type = gpu_type_from_vram_band(class, demand.min_vram_gib);
    // Region preference isn't modeled on the pod; provisioning leaves this to the
    // NodeClass's allowed regions, so the first configured region (if any)
    // is used as the selection target, falling back to a wildcard.
    let region = class
        .spec
        .instance_requirements
        .regions
        .first()
        .cloned()
        .map(Region)
        .unwrap_or_else(|| Region("any".to_string()));

    let candidate_providers = build_candidate_providers(ctx, class).await;
    let candidates: Vec<Candidate> = candidate_providers
        .iter()
        .map(|(provider, priority)| Candidate {
            provider,
            priority: *priority,
        })
        .collect();

    let winner = select_best(&ctx.pricing, &candidates, &gpu_type, &region)
        .await
        .ok_or_else(|| OperatorError::Validation {
            field: "provider".to_string(),
            reason: "every provider errored during selection".to_string(),
        })?;

    if winner.effective_price > pool.spec.max_hourly_price {
        return Err(OperatorError::Validation {
            field: "maxHourlyPrice".to_string(),
            reason: format!(
                "cheapest offer {:.4}/hr exceeds pool ceiling {:.4}/hr",
                winner.effective_price, pool.spec.max_hourly_price
            ),
        });
    }

    let node_name = format!("{}-{}", pool.name_any(), uuid::Uuid::new_v4());
    let variables = TemplateVariables {
        cluster_name: class.name_any(),
        cluster_endpoint: std::env::var("TGP_OPERATOR_CLUSTER_ENDPOINT").unwrap_or_default(),
        node_name: node_name.clone(),
        bootstrap_token: std::env::var("TGP_OPERATOR_BOOTSTRAP_TOKEN").unwrap_or_default(),
        extra: BTreeMap::new(),
    };
    let template_str = class
        .spec
        .talos_config
        .machine_config_template
        .clone()
        .ok_or_else(|| OperatorError::Template(crate::error::TemplateError::NoTemplate))?;
    let payload = render(&template_str, &variables)?;

    let request = LaunchRequest {
        gpu_type: gpu_type.clone(),
        region: region.clone(),
        node_init_payload: payload,
        labels: pool.spec.template.metadata.labels.clone(),
        spot_preference: class.spec.instance_requirements.spot_allowed,
        max_price: Some(pool.spec.max_hourly_price),
    };

    let launch_started = std::time::Instant::now();
    let instance = winner.provider.launch(&request).await?;
    crate::metrics::record_launch_duration(winner.provider.name(), launch_started.elapsed().as_secs_f64());
    crate::metrics::record_gpu_request(winner.provider.name(), &gpu_type.to_string(), "provisioning");

    match create_node_record(ctx, pool, &node_name, winner.provider, &instance.id, &gpu_type, winner.pricing.price_per_hour).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(instance_id = %instance.id.0, error = %e, "node record creation failed, terminating orphaned instance");
            let _ = winner.provider.terminate(&instance.id).await;
            Err(e)
        }
    }
}

async fn create_node_record(
    ctx: &Context,
    pool: &NodePool,
    node_name: &str,
    provider: &Provider,
    instance_id: &crate::provider::InstanceId,
    gpu_type: &GpuModel,
    hourly_price: f64,
) -> Result<(), OperatorError> {
    let mut labels = pool.spec.template.metadata.labels.clone();
    labels.insert(POOL_LABEL.to_string(), pool.name_any());

    let mut annotations = pool.spec.template.metadata.annotations.clone();
    annotations.insert(INSTANCE_ID_ANNOTATION.to_string(), instance_id.0.clone());
    annotations.insert(PROVIDER_ANNOTATION.to_string(), provider.name().to_string());
    annotations.insert(GPU_TYPE_ANNOTATION.to_string(), gpu_type.to_string());
    annotations.insert(HOURLY_PRICE_ANNOTATION.to_string(), hourly_price.to_string());

    let owner_ref = pool.controller_owner_ref(&()).ok_or_else(|| OperatorError::Validation {
        field: "nodepool".to_string(),
        reason: "nodepool has no uid to own a node record".to_string(),
    })?;

    let node = Node {
        metadata: ObjectMeta {
            name: Some(node_name.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            unschedulable: Some(true),
            taints: Some(pool.spec.template.spec.taints.clone()),
            ..Default::default()
        }),
        status: None,
    };

    let nodes_api: Api<Node> = Api::all(ctx.client.clone());
    nodes_api.create(&PostParams::default(), &node).await?;
    Ok(())
}

async fn cleanup(obj: Arc<NodePool>, ctx: &Context) -> Result<Action, OperatorError> {
    let name = obj.name_any();
    let nodes_api: Api<Node> = Api::all(ctx.client.clone());
    let owned = nodes_api
        .list(&ListParams::default().labels(&format!("{POOL_LABEL}={name}")))
        .await?;

    let nodeclass_api: Api<NodeClass> = Api::all(ctx.client.clone());
    let class = nodeclass_api.get(&obj.spec.node_class_ref.name).await.ok();
    let candidate_providers = match &class {
        Some(class) => build_candidate_providers(ctx, class).await,
        None => Vec::new(),
    };

    for node in &owned.items {
        drain_terminate_and_delete(ctx, node, &candidate_providers).await;
    }

    Ok(Action::await_change())
}

/// Cordons, drains, terminates the backing instance (if its provider is
/// still resolvable), and deletes the `Node` record. Returns the provider
/// name and GPU type recorded on the node's annotations, for callers that
/// want to emit a metric keyed on what was just recycled.
async fn drain_terminate_and_delete(
    ctx: &Context,
    node: &Node,
    candidate_providers: &[(Provider, u32)],
) -> (Option<String>, Option<String>) {
    let node_name = node.name_any();
    if let Err(e) = cordon_and_drain(ctx, &node_name).await {
        warn!(node = %node_name, error = %e, "drain failed, proceeding best-effort");
    }

    let annotations = node.metadata.annotations.as_ref();
    let instance_id = annotations.and_then(|a| a.get(INSTANCE_ID_ANNOTATION)).cloned();
    let provider_name = annotations.and_then(|a| a.get(PROVIDER_ANNOTATION)).cloned();
    let gpu_type = annotations.and_then(|a| a.get(GPU_TYPE_ANNOTATION)).cloned();

    if let (Some(instance_id), Some(provider_name)) = (&instance_id, &provider_name) {
        if let Some((provider, _)) = candidate_providers.iter().find(|(p, _)| p.name() == provider_name.as_str()) {
            if let Err(e) = provider
                .terminate(&crate::provider::InstanceId(instance_id.clone()))
                .await
            {
                warn!(node = %node_name, instance_id, error = %e, "terminate failed, proceeding best-effort");
            }
        }
    }

    let nodes_api: Api<Node> = Api::all(ctx.client.clone());
    if let Err(e) = nodes_api.delete(&node_name, &DeleteParams::default()).await {
        warn!(node = %node_name, error = %e, "node record deletion failed, proceeding best-effort");
    }

    (provider_name, gpu_type)
}

async fn cordon_and_drain(ctx: &Context, node_name: &str) -> Result<(), OperatorError> {
    let nodes_api: Api<Node> = Api::all(ctx.client.clone());
    let patch = serde_json::json!({ "spec": { "unschedulable": true } });
    nodes_api
        .patch(node_name, &PatchParams::default(), &Patch::Merge(patch))
        .await?;

    let pods_api: Api<Pod> = Api::all(ctx.client.clone());
    let field_selector = format!("spec.nodeName={node_name}");
    let pods = pods_api
        .list(&ListParams::default().fields(&field_selector))
        .await?;

    for pod in pods {
        let is_daemonset = pod
            .metadata
            .owner_references
            .as_ref()
            .map(|refs| refs.iter().any(|r| r.kind == "DaemonSet"))
            .unwrap_or(false);
        let is_static = pod
            .metadata
            .annotations
            .as_ref()
            .map(|a| a.contains_key("kubernetes.io/config.source"))
            .unwrap_or(false);
        if is_daemonset || is_static {
            continue;
        }
        if let Some(pod_name) = &pod.metadata.name {
            let namespace = pod.metadata.namespace.clone().unwrap_or_default();
            let namespaced: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
            let _ = namespaced.delete(pod_name, &DeleteParams::default()).await;
        }
    }

    Ok(())
}
