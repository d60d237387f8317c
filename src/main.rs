mod config;
mod exposition;
mod gauges;
mod http;
mod metrics;
mod sampler;
mod schedule;
mod settings;
mod state;
mod tasks;
mod upstream;

use axum::serve;
use clap::Parser;
use config::Config;
use metrics::Metrics;
use reqwest::Client;
use sampler::{MetricsSampler, NodeExporterSource, SystemClock};
use settings::SettingsStore;
use state::State;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tasks::AppContext;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use upstream::Upstream;

#[derive(Parser, Debug)]
#[command(name = "edgewell")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    info!(
        listen = %cfg.listen,
        model_service_url = %cfg.endpoints.model_service_url,
        node_exporter_url = %cfg.endpoints.node_exporter_url,
        node_name = %cfg.endpoints.node_name,
        "запуск edgewell"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let client = Client::builder()
        .user_agent("edgewell/0.1.0")
        .build()
        .unwrap_or_else(|_| Client::new());
    let settings = SettingsStore::new(cfg.endpoints.clone());
    let upstream = Upstream::new(
        client,
        settings,
        Duration::from_millis(cfg.health.timeout_ms),
        Duration::from_millis(cfg.proxy.timeout_ms),
    );
    let sampler = Arc::new(MetricsSampler::new(
        NodeExporterSource::new(upstream.clone()),
        SystemClock::new(),
        Duration::from_millis(cfg.sampler.fetch_timeout_ms),
    ));
    let ctx = AppContext {
        metrics,
        state: Arc::new(RwLock::new(State::new(tasks::now_unix()))),
        upstream,
        sampler,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let listen = cfg.listen.clone();
        let ctx = ctx.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(ctx);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    let sampler_task = {
        let ctx = ctx.clone();
        tokio::spawn(schedule::run_every(
            "sampler",
            Duration::from_secs(cfg.sampler.interval_secs),
            shutdown_rx.clone(),
            move || {
                let ctx = ctx.clone();
                async move {
                    tasks::sample_node(&ctx).await;
                }
            },
        ))
    };

    let health_task = {
        let ctx = ctx.clone();
        tokio::spawn(schedule::run_every(
            "health",
            Duration::from_secs(cfg.health.interval_secs),
            shutdown_rx.clone(),
            move || {
                let ctx = ctx.clone();
                async move {
                    tasks::check_model(&ctx).await;
                }
            },
        ))
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    let _ = sampler_task.await;
    let _ = health_task.await;
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
