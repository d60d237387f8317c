use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::debug;

static LABELED_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-zA-Z_:][a-zA-Z0-9_:]*)\{.*?\}\s+([\d.eE+-]+)")
        .expect("labeled sample pattern")
});

static PLAIN_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-zA-Z_:][a-zA-Z0-9_:]*)\s+([\d.eE+-]+)")
        .expect("plain sample pattern")
});

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    samples: HashMap<String, Vec<f64>>,
}

impl MetricsSnapshot {
    pub fn values(&self, name: &str) -> &[f64] {
        self.samples.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn first(&self, name: &str) -> Option<f64> {
        self.values(name).first().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn push(&mut self, name: &str, value: f64) {
        self.samples.entry(name.to_string()).or_default().push(value);
    }
}

pub fn parse(text: &str) -> MetricsSnapshot {
    let mut snapshot = MetricsSnapshot::default();

    for line in text.lines() {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }

        // labeled form wins; the plain form is only a fallback
        let Some(caps) = LABELED_LINE
            .captures(line)
            .or_else(|| PLAIN_LINE.captures(line))
        else {
            continue;
        };

        let name = &caps[1];
        let raw = &caps[2];
        match raw.parse::<f64>() {
            Ok(value) if value.is_finite() => snapshot.push(name, value),
            _ => debug!(metric = name, value = raw, "dropping sample with malformed value"),
        }
    }

    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_every_labeled_series_in_order() {
        let text = "node_cpu_seconds_total{cpu=\"0\",mode=\"idle\"} 12345.67 1690000000\n\
                    node_cpu_seconds_total{cpu=\"1\",mode=\"idle\"} 12300.11\n";
        let snapshot = parse(text);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot.values("node_cpu_seconds_total"),
            &[12345.67, 12300.11]
        );
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let text = "# HELP node_load1 1m load average.\n\
                    # TYPE node_load1 gauge\n\
                    \n   \n\t\n";
        assert!(parse(text).is_empty());
    }

    #[test]
    fn reads_scientific_notation() {
        let snapshot = parse("foo_bar 1.5e+09\n");
        assert_eq!(snapshot.first("foo_bar"), Some(1_500_000_000.0));
    }

    #[test]
    fn labeled_line_is_counted_once() {
        let snapshot = parse("up{job=\"node\"} 1\n");
        assert_eq!(snapshot.values("up"), &[1.0]);
    }

    #[test]
    fn mixes_plain_and_labeled_lines() {
        let text = "node_memory_MemTotal_bytes 1.6e+10\n\
                    node_memory_MemAvailable_bytes 4e9\n\
                    node_filesystem_avail_bytes{mountpoint=\"/\"} 100\n";
        let snapshot = parse(text);
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.first("node_memory_MemTotal_bytes"), Some(16e9));
        assert_eq!(snapshot.first("node_memory_MemAvailable_bytes"), Some(4e9));
        assert_eq!(snapshot.first("node_filesystem_avail_bytes"), Some(100.0));
    }

    #[test]
    fn malformed_values_are_dropped_without_stopping() {
        let text = "a_metric 1.2.3\n\
                    b_metric{x=\"y\"} --\n\
                    c_metric NaN\n\
                    d_metric 1e999\n\
                    e_metric 7\n";
        let snapshot = parse(text);
        assert!(snapshot.values("a_metric").is_empty());
        assert!(snapshot.values("b_metric").is_empty());
        assert!(snapshot.values("c_metric").is_empty());
        assert!(snapshot.values("d_metric").is_empty());
        assert_eq!(snapshot.first("e_metric"), Some(7.0));
    }

    #[test]
    fn ignores_lines_in_neither_form() {
        let text = "9bad_name 1\n\
                    {cpu=\"0\"} 5\n\
                    just_a_name\n\
                    \x20leading_space 3\n";
        assert!(parse(text).is_empty());
    }

    #[test]
    fn handles_crlf_line_endings() {
        let snapshot = parse("x_total 3\r\ny_total{a=\"b\"} 4\r\n");
        assert_eq!(snapshot.first("x_total"), Some(3.0));
        assert_eq!(snapshot.first("y_total"), Some(4.0));
    }

    #[test]
    fn negative_and_signed_exponent_values() {
        let snapshot = parse("temp_delta -2.5\nratio 2.5E-3\n");
        assert_eq!(snapshot.first("temp_delta"), Some(-2.5));
        assert_eq!(snapshot.first("ratio"), Some(0.0025));
    }
}
