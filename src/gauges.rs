use crate::exposition::MetricsSnapshot;
use serde::Serialize;
use std::fmt;

pub const CPU_SECONDS_TOTAL: &str = "node_cpu_seconds_total";
pub const MEM_TOTAL_BYTES: &str = "node_memory_MemTotal_bytes";
pub const MEM_AVAILABLE_BYTES: &str = "node_memory_MemAvailable_bytes";

pub const MOCK_GAUGES: DerivedGauges = DerivedGauges {
    cpu_usage_percent: Some(25.0),
    memory_usage_percent: Some(45.0),
};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeltaState {
    pub last_cpu_total: Option<f64>,
    pub last_sample_time_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DerivedGauges {
    pub cpu_usage_percent: Option<f64>,
    pub memory_usage_percent: Option<f64>,
}

impl DerivedGauges {
    pub fn online(&self) -> bool {
        self.cpu_usage_percent.is_some() || self.memory_usage_percent.is_some()
    }

    pub fn display_cpu(&self) -> u8 {
        display_percent(self.cpu_usage_percent)
    }

    pub fn display_memory(&self) -> u8 {
        display_percent(self.memory_usage_percent)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    Transport(String),
    Status(u16),
    Timeout,
    NoUsableSeries,
    Seeding,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::Transport(err) => write!(f, "metrics fetch failed: {err}"),
            FallbackReason::Status(code) => write!(f, "metrics endpoint returned {code}"),
            FallbackReason::Timeout => f.write_str("metrics fetch timed out"),
            FallbackReason::NoUsableSeries => f.write_str("no cpu or memory series in scrape"),
            FallbackReason::Seeding => f.write_str("cpu counters seeded, rate available next cycle"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Derivation {
    Derived(DerivedGauges),
    Fallback(FallbackReason),
}

impl Derivation {
    pub fn gauges(&self) -> DerivedGauges {
        match self {
            Derivation::Derived(gauges) => *gauges,
            Derivation::Fallback(_) => MOCK_GAUGES,
        }
    }
}

pub fn derive(snapshot: &MetricsSnapshot, delta: &mut DeltaState, now_ms: i64) -> Derivation {
    if snapshot.is_empty() {
        return Derivation::Fallback(FallbackReason::NoUsableSeries);
    }

    let gauges = DerivedGauges {
        cpu_usage_percent: derive_cpu(snapshot, delta, now_ms),
        memory_usage_percent: derive_memory(snapshot),
    };

    if gauges.online() {
        Derivation::Derived(gauges)
    } else if !snapshot.values(CPU_SECONDS_TOTAL).is_empty() {
        // counters present, but no prior observation to diff against
        Derivation::Fallback(FallbackReason::Seeding)
    } else {
        Derivation::Fallback(FallbackReason::NoUsableSeries)
    }
}

pub fn derive_cpu(snapshot: &MetricsSnapshot, delta: &mut DeltaState, now_ms: i64) -> Option<f64> {
    let values = snapshot.values(CPU_SECONDS_TOTAL);
    if values.is_empty() {
        return None;
    }

    let current_total: f64 = values.iter().sum();
    let core_count = values.len() as f64;

    let usage = match (delta.last_cpu_total, delta.last_sample_time_ms) {
        (Some(last_total), Some(last_ms)) => {
            let time_delta_secs = (now_ms - last_ms) as f64 / 1000.0;
            if time_delta_secs > 0.0 {
                let cpu_delta = current_total - last_total;
                Some(clamp_percent(
                    cpu_delta / (time_delta_secs * core_count) * 100.0,
                ))
            } else {
                None
            }
        }
        _ => None,
    };

    delta.last_cpu_total = Some(current_total);
    delta.last_sample_time_ms = Some(now_ms);

    usage
}

pub fn derive_memory(snapshot: &MetricsSnapshot) -> Option<f64> {
    let total = snapshot.first(MEM_TOTAL_BYTES)?;
    let available = snapshot.first(MEM_AVAILABLE_BYTES)?;
    if total <= 0.0 {
        return None;
    }
    Some(clamp_percent((total - available) / total * 100.0))
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

fn display_percent(value: Option<f64>) -> u8 {
    value.map(|v| clamp_percent(v).round() as u8).unwrap_or(0)
}
