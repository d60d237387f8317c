use crate::exposition;
use crate::gauges::{derive, DeltaState, Derivation, FallbackReason};
use crate::upstream::{TextResponse, Upstream, UpstreamError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, info, warn};

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

// wall-clock base plus monotonic offset; readings never go backwards
pub struct SystemClock {
    base_ms: i64,
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        let base_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self {
            base_ms,
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        self.base_ms + self.origin.elapsed().as_millis() as i64
    }
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn fetch(&self) -> Result<TextResponse, UpstreamError>;
}

pub struct NodeExporterSource {
    upstream: Upstream,
}

impl NodeExporterSource {
    pub fn new(upstream: Upstream) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl MetricsSource for NodeExporterSource {
    async fn fetch(&self) -> Result<TextResponse, UpstreamError> {
        self.upstream.fetch_node_metrics().await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed(Derivation),
    Skipped,
}

pub struct MetricsSampler<S, C> {
    source: S,
    clock: C,
    fetch_timeout: Duration,
    delta: Mutex<DeltaState>,
    in_flight: AtomicBool,
}

impl<S: MetricsSource, C: Clock> MetricsSampler<S, C> {
    pub fn new(source: S, clock: C, fetch_timeout: Duration) -> Self {
        Self {
            source,
            clock,
            fetch_timeout,
            delta: Mutex::new(DeltaState::default()),
            in_flight: AtomicBool::new(false),
        }
    }

    pub async fn cycle(&self) -> CycleOutcome {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!("metrics cycle already in flight, skipping");
            return CycleOutcome::Skipped;
        };

        let derivation = match time::timeout(self.fetch_timeout, self.source.fetch()).await {
            Err(_elapsed) => Derivation::Fallback(FallbackReason::Timeout),
            Ok(Err(err)) => Derivation::Fallback(FallbackReason::Transport(err.to_string())),
            Ok(Ok(resp)) if !(200..300).contains(&resp.status) => {
                Derivation::Fallback(FallbackReason::Status(resp.status))
            }
            Ok(Ok(resp)) => {
                let snapshot = exposition::parse(&resp.body);
                debug!(series = snapshot.len(), "parsed node metrics");
                let now_ms = self.clock.now_ms();
                let mut delta = self.delta.lock().await;
                derive(&snapshot, &mut delta, now_ms)
            }
        };

        match &derivation {
            Derivation::Fallback(FallbackReason::Seeding) => {
                info!("cpu counters seeded, using mock gauges until the next cycle");
            }
            Derivation::Fallback(reason) => {
                warn!(reason = %reason, "node metrics unavailable, using mock gauges");
            }
            Derivation::Derived(_) => {}
        }

        CycleOutcome::Completed(derivation)
    }

    #[cfg(test)]
    pub async fn delta_state(&self) -> DeltaState {
        *self.delta.lock().await
    }
}

struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gauges::DerivedGauges;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicI64;
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::sync::Notify;

    #[derive(Clone, Default)]
    struct ManualClock(Arc<AtomicI64>);

    impl ManualClock {
        fn set(&self, ms: i64) {
            self.0.store(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct ScriptedSource {
        replies: StdMutex<VecDeque<Result<TextResponse, UpstreamError>>>,
    }

    impl ScriptedSource {
        fn with(replies: Vec<Result<TextResponse, UpstreamError>>) -> Self {
            Self {
                replies: StdMutex::new(replies.into()),
            }
        }
    }

    #[async_trait]
    impl MetricsSource for ScriptedSource {
        async fn fetch(&self) -> Result<TextResponse, UpstreamError> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ok_text("")))
        }
    }

    struct GatedSource {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl MetricsSource for GatedSource {
        async fn fetch(&self) -> Result<TextResponse, UpstreamError> {
            self.gate.notified().await;
            Ok(ok_text("node_memory_MemTotal_bytes 10\nnode_memory_MemAvailable_bytes 5\n"))
        }
    }

    fn ok_text(body: &str) -> TextResponse {
        TextResponse {
            status: 200,
            body: body.to_string(),
        }
    }

    fn cpu_text(total_per_core: f64) -> String {
        format!(
            "node_cpu_seconds_total{{cpu=\"0\",mode=\"user\"}} {total_per_core}\n\
             node_cpu_seconds_total{{cpu=\"1\",mode=\"user\"}} {total_per_core}\n\
             node_memory_MemTotal_bytes 16000000000\n\
             node_memory_MemAvailable_bytes 4000000000\n"
        )
    }

    #[tokio::test]
    async fn derives_cpu_rate_across_simulated_steps() {
        let clock = ManualClock::default();
        let source = ScriptedSource::with(vec![
            Ok(ok_text(&cpu_text(100.0))),
            Ok(ok_text(&cpu_text(100.5))),
        ]);
        let sampler = MetricsSampler::new(source, clock.clone(), Duration::from_secs(5));

        clock.set(0);
        let first = sampler.cycle().await;
        assert_eq!(
            first,
            CycleOutcome::Completed(Derivation::Derived(DerivedGauges {
                cpu_usage_percent: None,
                memory_usage_percent: Some(75.0),
            }))
        );

        clock.set(5000);
        let second = sampler.cycle().await;
        // 1s of cpu time over 5s * 2 series
        assert_eq!(
            second,
            CycleOutcome::Completed(Derivation::Derived(DerivedGauges {
                cpu_usage_percent: Some(10.0),
                memory_usage_percent: Some(75.0),
            }))
        );
        let delta = sampler.delta_state().await;
        assert_eq!(delta.last_cpu_total, Some(201.0));
        assert_eq!(delta.last_sample_time_ms, Some(5000));
    }

    #[tokio::test]
    async fn non_success_status_falls_back() {
        let source = ScriptedSource::with(vec![Ok(TextResponse {
            status: 502,
            body: cpu_text(1.0),
        })]);
        let sampler = MetricsSampler::new(source, ManualClock::default(), Duration::from_secs(5));
        assert_eq!(
            sampler.cycle().await,
            CycleOutcome::Completed(Derivation::Fallback(FallbackReason::Status(502)))
        );
        // nothing was parsed, so nothing was seeded
        assert_eq!(sampler.delta_state().await, DeltaState::default());
    }

    #[tokio::test]
    async fn transport_error_falls_back() {
        let source = ScriptedSource::with(vec![Err(UpstreamError::Status {
            url: "http://node/metrics".to_string(),
            status: 0,
        })]);
        let sampler = MetricsSampler::new(source, ManualClock::default(), Duration::from_secs(5));
        match sampler.cycle().await {
            CycleOutcome::Completed(Derivation::Fallback(FallbackReason::Transport(msg))) => {
                assert!(msg.contains("http://node/metrics"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_body_reports_missing_series() {
        let sampler = MetricsSampler::new(
            ScriptedSource::default(),
            ManualClock::default(),
            Duration::from_secs(5),
        );
        assert_eq!(
            sampler.cycle().await,
            CycleOutcome::Completed(Derivation::Fallback(FallbackReason::NoUsableSeries))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_cycle_is_skipped() {
        let gate = Arc::new(Notify::new());
        let sampler = Arc::new(MetricsSampler::new(
            GatedSource { gate: gate.clone() },
            ManualClock::default(),
            Duration::from_secs(30),
        ));

        let running = {
            let sampler = sampler.clone();
            tokio::spawn(async move { sampler.cycle().await })
        };
        tokio::task::yield_now().await;

        assert_eq!(sampler.cycle().await, CycleOutcome::Skipped);

        gate.notify_one();
        let outcome = running.await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Completed(Derivation::Derived(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_fetch_times_out_and_releases_guard() {
        let gate = Arc::new(Notify::new());
        let sampler = MetricsSampler::new(
            GatedSource { gate: gate.clone() },
            ManualClock::default(),
            Duration::from_secs(8),
        );

        assert_eq!(
            sampler.cycle().await,
            CycleOutcome::Completed(Derivation::Fallback(FallbackReason::Timeout))
        );

        gate.notify_one();
        assert!(matches!(
            sampler.cycle().await,
            CycleOutcome::Completed(Derivation::Derived(_))
        ));
    }

    #[test]
    fn system_clock_does_not_go_backwards() {
        let clock = SystemClock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
        assert!(a > 0);
    }
}
