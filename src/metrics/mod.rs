use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};

use crate::wire::envelope::MessageKind;

const MAX_SAMPLES_PER_QUERY: usize = 1024;
const MAX_TIMED_QUERIES: usize = 256;
/// Timing key shared by every query seen after `MAX_TIMED_QUERIES` distinct ones.
const OVERFLOW_QUERY_KEY: &str = "<other>";

#[derive(Default)]
struct Recorded {
    requests: HashMap<MessageKind, u64>,
    timings_us: BTreeMap<String, Vec<u64>>,
}

/// Request counters and per-query timings. Shared by reference; nothing here
/// is global. Recording is a no-op while disabled.
pub struct Metrics {
    enabled: AtomicBool,
    recorded: Mutex<Recorded>,
}

impl Metrics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            recorded: Mutex::new(Recorded::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn record_request(&self, kind: MessageKind) {
        if !self.is_enabled() {
            return;
        }
        let mut recorded = self.recorded.lock().expect("metrics lock poisoned");
        *recorded.requests.entry(kind).or_insert(0) += 1;
    }

    pub fn record_timing(&self, query: &str, elapsed: Duration) {
        if !self.is_enabled() {
            return;
        }
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let mut recorded = self.recorded.lock().expect("metrics lock poisoned");
        let key = if recorded.timings_us.contains_key(query)
            || recorded.timings_us.len() < MAX_TIMED_QUERIES
        {
            query
        } else {
            OVERFLOW_QUERY_KEY
        };
        let samples = recorded.timings_us.entry(key.to_owned()).or_default();
        if samples.len() >= MAX_SAMPLES_PER_QUERY {
            samples.remove(0);
        }
        samples.push(micros);
    }

    #[cfg(test)]
    pub fn request_count(&self, kind: MessageKind) -> u64 {
        self.recorded
            .lock()
            .expect("metrics lock poisoned")
            .requests
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub fn timing_samples(&self, query: &str) -> Vec<u64> {
        self.recorded
            .lock()
            .expect("metrics lock poisoned")
            .timings_us
            .get(query)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Value {
        let recorded = self.recorded.lock().expect("metrics lock poisoned");

        let requests = MessageKind::ALL
            .iter()
            .filter_map(|kind| {
                recorded
                    .requests
                    .get(kind)
                    .map(|count| (kind.as_str().to_owned(), json!(count)))
            })
            .collect::<serde_json::Map<_, _>>();

        let queries = recorded
            .timings_us
            .iter()
            .map(|(query, samples)| {
                let total: u64 = samples.iter().sum();
                let avg = if samples.is_empty() {
                    0
                } else {
                    total / samples.len() as u64
                };
                let max = samples.iter().copied().max().unwrap_or(0);
                (
                    query.clone(),
                    json!({"count": samples.len(), "avg_us": avg, "max_us": max}),
                )
            })
            .collect::<serde_json::Map<_, _>>();

        json!({
            "enabled": self.is_enabled(),
            "requests": requests,
            "queries": queries,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Metrics, MAX_TIMED_QUERIES, OVERFLOW_QUERY_KEY};
    use crate::wire::envelope::MessageKind;

    #[test]
    fn disabled_metrics_record_nothing() {
        let metrics = Metrics::new(false);
        metrics.record_request(MessageKind::Ping);
        metrics.record_timing("people", Duration::from_millis(3));

        assert_eq!(metrics.request_count(MessageKind::Ping), 0);
        assert!(metrics.timing_samples("people").is_empty());
    }

    #[test]
    fn snapshot_reports_counts_and_timing_summary() {
        let metrics = Metrics::new(true);
        metrics.record_request(MessageKind::DirectQuery);
        metrics.record_request(MessageKind::DirectQuery);
        metrics.record_timing("people", Duration::from_micros(100));
        metrics.record_timing("people", Duration::from_micros(300));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["requests"]["DIRECT_QUERY"], 2);
        assert_eq!(snapshot["queries"]["people"]["count"], 2);
        assert_eq!(snapshot["queries"]["people"]["avg_us"], 200);
        assert_eq!(snapshot["queries"]["people"]["max_us"], 300);
    }

    #[test]
    fn distinct_query_keys_are_capped() {
        let metrics = Metrics::new(true);
        for n in 0..MAX_TIMED_QUERIES + 10 {
            metrics.record_timing(&format!("MATCH (n) RETURN {n}"), Duration::from_micros(5));
        }
        metrics.record_timing("MATCH (n) RETURN 0", Duration::from_micros(7));

        let queries = metrics.snapshot()["queries"]
            .as_object()
            .expect("queries should be an object")
            .len();
        assert_eq!(queries, MAX_TIMED_QUERIES + 1);
        assert_eq!(metrics.timing_samples(OVERFLOW_QUERY_KEY).len(), 10);
        assert_eq!(metrics.timing_samples("MATCH (n) RETURN 0"), vec![5, 7]);
        assert!(metrics
            .timing_samples(&format!("MATCH (n) RETURN {MAX_TIMED_QUERIES}"))
            .is_empty());
    }

    #[test]
    fn toggle_stops_and_resumes_recording() {
        let metrics = Metrics::new(true);
        metrics.record_request(MessageKind::Ping);
        metrics.set_enabled(false);
        metrics.record_request(MessageKind::Ping);
        metrics.set_enabled(true);
        metrics.record_request(MessageKind::Ping);

        assert_eq!(metrics.request_count(MessageKind::Ping), 2);
    }
}
