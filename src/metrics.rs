use crate::state::{GaugeSource, State};
use crate::tasks::now_unix;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub edgewell_node_cpu_usage_percent: Gauge,
    pub edgewell_node_memory_usage_percent: Gauge,
    pub edgewell_node_online: Gauge,
    pub edgewell_model_ready: Gauge,
    pub edgewell_inference_count: Gauge,
    pub edgewell_uptime_seconds: Gauge,
    pub edgewell_sampler_cycles_total: CounterVec,
    pub edgewell_upstream_errors_total: CounterVec,
    pub edgewell_proxy_requests_total: CounterVec,
    pub edgewell_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let edgewell_node_cpu_usage_percent = Gauge::with_opts(opts!(
            "edgewell_node_cpu_usage_percent",
            "Node CPU usage derived from the exporter counters (0..100)"
        ))?;
        let edgewell_node_memory_usage_percent = Gauge::with_opts(opts!(
            "edgewell_node_memory_usage_percent",
            "Node memory usage derived from MemTotal and MemAvailable (0..100)"
        ))?;
        let edgewell_node_online = Gauge::with_opts(opts!(
            "edgewell_node_online",
            "1 when the last sampling cycle derived at least one gauge"
        ))?;
        let edgewell_model_ready = Gauge::with_opts(opts!(
            "edgewell_model_ready",
            "1 when the model service answered the last health check"
        ))?;
        let edgewell_inference_count = Gauge::with_opts(opts!(
            "edgewell_inference_count",
            "Predictions completed since start"
        ))?;
        let edgewell_uptime_seconds =
            Gauge::with_opts(opts!("edgewell_uptime_seconds", "Gateway uptime in seconds"))?;
        let edgewell_sampler_cycles_total = CounterVec::new(
            opts!(
                "edgewell_sampler_cycles_total",
                "Metrics sampler cycles by outcome (derived, seeding, fallback, skipped)"
            ),
            &["outcome"],
        )?;
        let edgewell_upstream_errors_total = CounterVec::new(
            opts!(
                "edgewell_upstream_errors_total",
                "Failed calls to upstream services"
            ),
            &["upstream"],
        )?;
        let edgewell_proxy_requests_total = CounterVec::new(
            opts!(
                "edgewell_proxy_requests_total",
                "Requests served by the proxy routes"
            ),
            &["route"],
        )?;
        let edgewell_scrape_count_total = Counter::with_opts(opts!(
            "edgewell_scrape_count_total",
            "Number of scrapes of this endpoint"
        ))?;

        register(&registry, &edgewell_node_cpu_usage_percent)?;
        register(&registry, &edgewell_node_memory_usage_percent)?;
        register(&registry, &edgewell_node_online)?;
        register(&registry, &edgewell_model_ready)?;
        register(&registry, &edgewell_inference_count)?;
        register(&registry, &edgewell_uptime_seconds)?;
        register(&registry, &edgewell_sampler_cycles_total)?;
        register(&registry, &edgewell_upstream_errors_total)?;
        register(&registry, &edgewell_proxy_requests_total)?;
        register(&registry, &edgewell_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            edgewell_node_cpu_usage_percent,
            edgewell_node_memory_usage_percent,
            edgewell_node_online,
            edgewell_model_ready,
            edgewell_inference_count,
            edgewell_uptime_seconds,
            edgewell_sampler_cycles_total,
            edgewell_upstream_errors_total,
            edgewell_proxy_requests_total,
            edgewell_scrape_count_total,
        }))
    }

    pub fn update_from_state(&self, state: &State) {
        // mock gauges are for the dashboard only; export NaN instead
        let (cpu, memory) = match state.node.source {
            GaugeSource::Derived => (
                state.node.gauges.cpu_usage_percent,
                state.node.gauges.memory_usage_percent,
            ),
            GaugeSource::Mock | GaugeSource::Pending => (None, None),
        };
        self.edgewell_node_cpu_usage_percent
            .set(cpu.unwrap_or(f64::NAN));
        self.edgewell_node_memory_usage_percent
            .set(memory.unwrap_or(f64::NAN));
        self.edgewell_node_online
            .set(if state.node.online { 1.0 } else { 0.0 });
        self.edgewell_model_ready
            .set(if state.model.ready { 1.0 } else { 0.0 });
        self.edgewell_inference_count
            .set(state.inference_count as f64);

        let uptime = now_unix().saturating_sub(state.started_at_unix) as f64;
        self.edgewell_uptime_seconds.set(uptime);
    }

    pub fn inc_sampler_cycle(&self, outcome: &str) {
        self.edgewell_sampler_cycles_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_upstream_error(&self, upstream: &str) {
        self.edgewell_upstream_errors_total
            .with_label_values(&[upstream])
            .inc();
    }

    pub fn inc_proxy_request(&self, route: &str) {
        self.edgewell_proxy_requests_total
            .with_label_values(&[route])
            .inc();
    }

    pub fn inc_scrape_count(&self) {
        self.edgewell_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
