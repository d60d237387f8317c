use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::info;

/// Runs `task` every `period` until `shutdown` flips. First run is immediate.
pub async fn run_every<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!(task = name, "получен сигнал остановки периодической задачи");
                break;
            }
            _ = ticker.tick() => {
                task().await;
            }
        }
    }
}
