//! NodeClass reconciler: finalizer-gated deletion, per-provider
//! credential validation, and periodic inventory refresh.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::Controller;
use kube::ResourceExt;
use tracing::{error, info, warn};

use k8s_openapi::api::core::v1::Node;

use crate::controller::nodepool::{HOURLY_PRICE_ANNOTATION, POOL_LABEL};
use crate::controller::Context;
use crate::crd::conditions::{set_condition, Condition, ConditionStatus};
use crate::crd::nodeclass::ProviderInventoryStatus;
use crate::crd::{NodeClass, NodePool, NODECLASS_FINALIZER};
use crate::error::OperatorError;
use crate::provider::factory::{build_provider, ProviderName};
use crate::provider::OfferFilters;

pub async fn run(ctx: Arc<Context>) {
    let api: Api<NodeClass> = Api::all(ctx.client.clone());
    Controller::new(api, Default::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => info!(object = ?o.0, "nodeclass reconciled"),
                Err(e) => error!(error = %e, "nodeclass reconcile failed"),
            }
        })
        .await;
}

async fn reconcile(obj: Arc<NodeClass>, ctx: Arc<Context>) -> Result<Action, OperatorError> {
    let api: Api<NodeClass> = Api::all(ctx.client.clone());
    let ctx_for_closure = ctx.clone();
    finalizer(&api, NODECLASS_FINALIZER, obj, move |event| {
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
        field: "nodeclass".to_string(),
        reason: e.to_string(),
    })
}

fn error_policy(_obj: Arc<NodeClass>, _err: &OperatorError, ctx: Arc<Context>) -> Action {
    Action::requeue(ctx.config.auth_error_requeue())
}

/// Deletion blockers are NodePools referencing this class that
/// aren't themselves mid-deletion.
async fn referencing_nodepools(ctx: &Context, nodeclass_name: &str) -> Result<Vec<String>, OperatorError> {
    let api: Api<NodePool> = Api::all(ctx.client.clone());
    let pools = api.list(&ListParams::default()).await?;
    Ok(pools
        .into_iter()
        .filter(|p| p.spec.node_class_ref.name == nodeclass_name && p.metadata.deletion_timestamp.is_none())
        .map(|p| p.name_any())
        .collect())
}

async fn cleanup(obj: Arc<NodeClass>, ctx: &Context) -> Result<Action, OperatorError> {
    let name = obj.name_any();
    let blockers = referencing_nodepools(ctx, &name).await?;

    if !blockers.is_empty() {
        warn!(nodeclass = %name, blockers = ?blockers, "nodeclass deletion blocked by active nodepools");
        let api: Api<NodeClass> = Api::all(ctx.client.clone());
        let mut status = obj.status.clone().unwrap_or_default();
        set_condition(
            &mut status.conditions,
            Condition::new(
                "DeletionBlocked",
                ConditionStatus::True,
                "ActiveNodePools",
                format!("blocked by: {}", blockers.join(", ")),
                Utc::now(),
            ),
        );
        patch_status(&api, &name, &status).await?;
        return Ok(Action::requeue(ctx.config.deletion_blocked_requeue()));
    }

    info!(nodeclass = %name, "no referencing nodepools remain, allowing deletion");
    Ok(Action::await_change())
}

async fn apply(obj: Arc<NodeClass>, ctx: &Context) -> Result<Action, OperatorError> {
    let name = obj.name_any();
    let api: Api<NodeClass> = Api::all(ctx.client.clone());
    let mut status = obj.status.clone().unwrap_or_default();

    if !obj.spec.has_enabled_provider() {
        set_condition(
            &mut status.conditions,
            Condition::new(
                "Ready",
                ConditionStatus::False,
                "NoEnabledProvider",
                "at least one provider must be enabled",
                Utc::now(),
            ),
        );
        patch_status(&api, &name, &status).await?;
        return Ok(Action::requeue(ctx.config.nodeclass_requeue()));
    }

    // Rebuilt fresh every reconcile — a provider that errors out below simply
    // contributes nothing rather than leaving last run's offers stranded.
    status.available_gpus.clear();

    for provider_cfg in obj.spec.enabled_providers() {
        let secret_namespace = provider_cfg
            .credentials_ref
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let credential = resolve_credential(
            ctx.client.clone(),
            &secret_namespace,
            &provider_cfg.credentials_ref.name,
            &provider_cfg.credentials_ref.key,
        )
        .await;

        let (provider_name, credential) = match validate_provider_config(&provider_cfg.name, credential) {
            Ok(resolved) => resolved,
            Err(unready) => {
                status.providers.insert(provider_cfg.name.clone(), unready);
                continue;
            }
        };

        let provider = build_provider(provider_name, &credential, ctx.adapter_handle());

        // Liveness probe: GetProviderInfo is sync/local, so this
        // really just validates the adapter constructed; the wire check
        // happens in the inventory refresh below.
        let _info = provider.get_provider_info();
        status.providers.insert(
            provider_cfg.name.clone(),
            ProviderInventoryStatus {
                ready: true,
                reason: Some("Ready".to_string()),
                message: None,
            },
        );

        tokio::time::sleep(ctx.config.inventory_pacing()).await;

        match provider.list_available(&OfferFilters::default()).await {
            Err(e) => {
                warn!(provider = %provider_cfg.name, error = %e, "inventory refresh failed");
                status.providers.insert(
                    provider_cfg.name.clone(),
                    ProviderInventoryStatus {
                        ready: true,
                        reason: Some("APIError".to_string()),
                        message: Some(e.to_string()),
                    },
                );
            }
            Ok(offers) if offers.is_empty() => {
                // Empty is not necessarily an error — could genuinely be no
                // capacity. Leave the provider status as-is.
            }
            Ok(offers) => {
                let mut by_gpu_type: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for offer in offers {
                    by_gpu_type
                        .entry(offer.gpu_type.to_string())
                        .or_default()
                        .push(offer.region.0);
                }
                for (gpu_type, regions) in by_gpu_type {
                    status
                        .available_gpus
                        .entry(provider_cfg.name.clone())
                        .or_default()
                        .extend(regions.into_iter().map(|r| format!("{gpu_type}@{r}")));
                }
            }
        }
    }

    let (active_nodes, total_cost) = compute_inventory_totals(ctx, &name).await?;
    status.active_nodes = active_nodes;
    status.total_cost = total_cost;

    set_condition(
        &mut status.conditions,
        Condition::new("Ready", ConditionStatus::True, "Validated", "providers validated", Utc::now()),
    );
    status.last_inventory_update = Some(Utc::now());
    status.next_inventory_update = Some(Utc::now() + chrono::Duration::minutes(5));

    patch_status(&api, &name, &status).await?;
    Ok(Action::requeue(ctx.config.nodeclass_requeue()))
}

/// Sums active node count and hourly cost across every NodePool referencing
/// this class, reading the cost back off the `HOURLY_PRICE_ANNOTATION`
/// each node was stamped with at launch.
async fn compute_inventory_totals(ctx: &Context, nodeclass_name: &str) -> Result<(u32, f64), OperatorError> {
    let pools_api: Api<NodePool> = Api::all(ctx.client.clone());
    let pools = pools_api.list(&ListParams::default()).await?;
    let nodes_api: Api<Node> = Api::all(ctx.client.clone());

    let mut active_nodes = 0u32;
    let mut total_cost = 0.0;
    for pool in pools.into_iter().filter(|p| p.spec.node_class_ref.name == nodeclass_name) {
        let pool_name = pool.name_any();
        let owned = nodes_api
            .list(&ListParams::default().labels(&format!("{POOL_LABEL}={pool_name}")))
            .await?;
        active_nodes += owned.items.len() as u32;
        for node in &owned.items {
            if let Some(price) = node
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(HOURLY_PRICE_ANNOTATION))
                .and_then(|p| p.parse::<f64>().ok())
            {
                total_cost += price;
            }
        }
    }
    Ok((active_nodes, total_cost))
}

/// Pure validation step between credential resolution and provider
/// construction: classifies an unresolved provider name or a missing
/// credential into the status the NodeClass should report, so this
/// decision is exercisable without a `kube::Client`.
fn validate_provider_config(
    raw_name: &str,
    credential: Option<String>,
) -> Result<(ProviderName, String), ProviderInventoryStatus> {
    let provider_name = ProviderName::parse(raw_name).map_err(|_| ProviderInventoryStatus {
        ready: false,
        reason: Some("UnknownProvider".to_string()),
        message: Some(format!("`{raw_name}` is not a recognized provider backend")),
    })?;

    let credential = credential.ok_or_else(|| ProviderInventoryStatus {
        ready: false,
        reason: Some("CredentialError".to_string()),
        message: Some("referenced secret or key is missing".to_string()),
    })?;

    Ok((provider_name, credential))
}

async fn resolve_credential(client: kube::Client, namespace: &str, secret_name: &str, key: &str) -> Option<String> {
    let secrets: Api<Secret> = Api::namespaced(client, namespace);
    let secret = secrets.get(secret_name).await.ok()?;
    let data = secret.data?;
    let bytes = data.get(key)?;
    String::from_utf8(bytes.0.clone()).ok()
}

async fn patch_status(api: &Api<NodeClass>, name: &str, status: &crate::crd::NodeClassStatus) -> Result<(), OperatorError> {
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
        .await?;
    Ok(())
}
