use crate::gauges::{Derivation, FallbackReason};
use crate::metrics::Metrics;
use crate::sampler::{CycleOutcome, MetricsSampler, NodeExporterSource, SystemClock};
use crate::state::State;
use crate::upstream::Upstream;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub type NodeSampler = MetricsSampler<NodeExporterSource, SystemClock>;

#[derive(Clone)]
pub struct AppContext {
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<State>>,
    pub upstream: Upstream,
    pub sampler: Arc<NodeSampler>,
}

pub async fn sample_node(ctx: &AppContext) -> CycleOutcome {
    let outcome = ctx.sampler.cycle().await;
    let derivation = match &outcome {
        CycleOutcome::Skipped => {
            ctx.metrics.inc_sampler_cycle("skipped");
            return outcome;
        }
        CycleOutcome::Completed(derivation) => derivation,
    };

    match derivation {
        Derivation::Derived(gauges) => {
            ctx.metrics.inc_sampler_cycle("derived");
            debug!(
                cpu = ?gauges.cpu_usage_percent,
                memory = ?gauges.memory_usage_percent,
                "node gauges updated"
            );
        }
        Derivation::Fallback(FallbackReason::Seeding) => {
            ctx.metrics.inc_sampler_cycle("seeding");
        }
        Derivation::Fallback(reason) => {
            ctx.metrics.inc_sampler_cycle("fallback");
            if *reason != FallbackReason::NoUsableSeries {
                ctx.metrics.inc_upstream_error("node_exporter");
            }
        }
    }

    let snapshot = {
        let mut guard = ctx.state.write().await;
        guard.apply_derivation(derivation, now_unix());
        guard.clone()
    };
    ctx.metrics.update_from_state(&snapshot);
    outcome
}

pub async fn check_model(ctx: &AppContext) {
    let result = ctx.upstream.check_model_health().await;
    match &result {
        Ok(status) => info!(service_status = status, "model service reachable"),
        Err(err) => {
            ctx.metrics.inc_upstream_error("model_service");
            warn!(error = %err, "model service unreachable");
        }
    }

    let snapshot = {
        let mut guard = ctx.state.write().await;
        guard.record_health(result.map_err(|err| err.to_string()), now_unix());
        guard.clone()
    };
    ctx.metrics.update_from_state(&snapshot);
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
