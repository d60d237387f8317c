use crate::gauges::{Derivation, DerivedGauges};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;

pub const HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct State {
    pub started_at_unix: i64,
    pub node: NodeStatus,
    pub model: ModelStatus,
    pub inference_count: u64,
    pub history: VecDeque<InferenceRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GaugeSource {
    #[default]
    Pending,
    Derived,
    Mock,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStatus {
    pub gauges: DerivedGauges,
    pub source: GaugeSource,
    pub online: bool,
    pub fallback_reason: Option<String>,
    pub updated_at_unix: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelStatus {
    pub ready: bool,
    pub service_status: Option<u16>,
    pub error: Option<String>,
    pub checked_at_unix: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRecord {
    pub id: u64,
    pub image_name: String,
    pub message: String,
    pub prediction: Option<i64>,
    pub probability: Option<f64>,
    pub latency_ms: u64,
    pub timestamp: String,
}

impl State {
    pub fn new(now_unix: i64) -> Self {
        Self {
            started_at_unix: now_unix,
            ..Self::default()
        }
    }

    pub fn apply_derivation(&mut self, derivation: &Derivation, now_unix: i64) {
        self.node = match derivation {
            Derivation::Derived(gauges) => NodeStatus {
                gauges: *gauges,
                source: GaugeSource::Derived,
                online: gauges.online(),
                fallback_reason: None,
                updated_at_unix: Some(now_unix),
            },
            Derivation::Fallback(reason) => NodeStatus {
                gauges: derivation.gauges(),
                source: GaugeSource::Mock,
                online: false,
                fallback_reason: Some(reason.to_string()),
                updated_at_unix: Some(now_unix),
            },
        };
    }

    pub fn record_health(&mut self, result: Result<u16, String>, now_unix: i64) {
        self.model = match result {
            Ok(status) => ModelStatus {
                ready: true,
                service_status: Some(status),
                error: None,
                checked_at_unix: Some(now_unix),
            },
            Err(error) => ModelStatus {
                ready: false,
                service_status: None,
                error: Some(error),
                checked_at_unix: Some(now_unix),
            },
        };
    }

    pub fn record_prediction(
        &mut self,
        image_name: String,
        body: &Value,
        fallback_latency_ms: u64,
        timestamp: String,
    ) -> u64 {
        self.inference_count += 1;
        let record = InferenceRecord {
            id: self.inference_count,
            image_name,
            message: body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            prediction: body.get("prediction").and_then(Value::as_i64),
            probability: body.get("probability").and_then(Value::as_f64),
            latency_ms: body
                .get("latency")
                .and_then(Value::as_u64)
                .unwrap_or(fallback_latency_ms),
            timestamp,
        };
        self.history.push_front(record);
        self.history.truncate(HISTORY_LIMIT);
        self.inference_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gauges::FallbackReason;
    use serde_json::json;

    #[test]
    fn derived_gauges_mark_node_online() {
        let mut state = State::new(0);
        state.apply_derivation(
            &Derivation::Derived(DerivedGauges {
                cpu_usage_percent: Some(12.0),
                memory_usage_percent: None,
            }),
            5,
        );
        assert!(state.node.online);
        assert_eq!(state.node.source, GaugeSource::Derived);
        assert_eq!(state.node.gauges.cpu_usage_percent, Some(12.0));
        assert_eq!(state.node.updated_at_unix, Some(5));
    }

    #[test]
    fn fallback_shows_mock_gauges_offline() {
        let mut state = State::new(0);
        state.apply_derivation(&Derivation::Fallback(FallbackReason::Status(500)), 9);
        assert!(!state.node.online);
        assert_eq!(state.node.source, GaugeSource::Mock);
        assert_eq!(state.node.gauges.display_cpu(), 25);
        assert_eq!(state.node.gauges.display_memory(), 45);
        assert_eq!(
            state.node.fallback_reason.as_deref(),
            Some("metrics endpoint returned 500")
        );
    }

    #[test]
    fn health_result_sets_model_ready() {
        let mut state = State::new(0);
        state.record_health(Ok(404), 1);
        assert!(state.model.ready);
        assert_eq!(state.model.service_status, Some(404));

        state.record_health(Err("connection refused".to_string()), 2);
        assert!(!state.model.ready);
        assert_eq!(state.model.service_status, None);
        assert_eq!(state.model.error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn history_keeps_latest_ten_newest_first() {
        let mut state = State::new(0);
        for i in 0..12 {
            let body = json!({
                "message": "lost circulation",
                "prediction": 1,
                "probability": 0.88,
                "latency": i,
            });
            state.record_prediction(format!("test_image_{i:03}.png"), &body, 999, "t".into());
        }
        assert_eq!(state.inference_count, 12);
        assert_eq!(state.history.len(), HISTORY_LIMIT);
        assert_eq!(state.history[0].id, 12);
        assert_eq!(state.history[0].image_name, "test_image_011.png");
        assert_eq!(state.history[0].latency_ms, 11);
        assert_eq!(state.history[9].id, 3);
    }

    #[test]
    fn prediction_without_latency_uses_measured_time() {
        let mut state = State::new(0);
        let id = state.record_prediction("a.png".into(), &json!({"message": "normal"}), 77, "t".into());
        assert_eq!(id, 1);
        let record = &state.history[0];
        assert_eq!(record.latency_ms, 77);
        assert_eq!(record.prediction, None);
        assert_eq!(record.message, "normal");
    }
}
