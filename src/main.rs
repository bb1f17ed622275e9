use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use kube::Client;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tgp_operator::config::OperatorConfig;
use tgp_operator::controller::{nodeclass, nodepool, Context};
use tgp_operator::metrics;

#[derive(Clone)]
struct HealthState {
    prometheus: PrometheusHandle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::load()?;
    init_tracing(&config.log_format);

    let prometheus = metrics::install();
    info!(?config, "starting tgp-operator");

    let client = Client::try_default().await?;
    let ctx = Context::new(client, config.clone());

    let health_state = HealthState { prometheus };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .with_state(health_state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.metrics_port)).await?;
    let http_server = axum::serve(listener, app);

    let nodeclass_ctx = ctx.clone();
    let nodeclass_task = tokio::spawn(async move { nodeclass::run(nodeclass_ctx).await });
    let nodepool_ctx = ctx.clone();
    let nodepool_task = tokio::spawn(async move { nodepool::run(nodepool_ctx).await });

    tokio::select! {
        res = http_server => { res?; }
        _ = nodeclass_task => { info!("nodeclass controller exited"); }
        _ = nodepool_task => { info!("nodepool controller exited"); }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, cancelling in-flight provider calls");
            ctx.shutdown.cancel();
        }
    }

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn render_metrics(State(state): State<HealthState>) -> String {
    state.prometheus.render()
}

fn init_tracing(log_format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
