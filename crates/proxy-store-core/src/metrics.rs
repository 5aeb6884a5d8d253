//! Process-local labelled counters.
//!
//! A deliberately small sink: monotonic counters keyed by name plus a fixed
//! label set, cheap enough to increment from the applier's hot path. The
//! snapshot surface feeds the node's status logging.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;

/// Labelled monotonic counters.
#[derive(Debug, Default, Clone)]
pub struct MetricsSink {
    counters: Arc<DashMap<String, u64>>,
}

impl MetricsSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment `name{labels}` by one.
    pub fn incr(&self, name: &str, labels: &[(&str, &str)]) {
        self.incr_by(name, labels, 1);
    }

    /// Increment `name{labels}` by `delta`.
    pub fn incr_by(&self, name: &str, labels: &[(&str, &str)], delta: u64) {
        *self.counters.entry(Self::series_key(name, labels)).or_insert(0) += delta;
    }

    /// Current value of a series, zero when never incremented.
    pub fn get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .get(&Self::series_key(name, labels))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Sorted snapshot of every series.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
        if labels.is_empty() {
            return name.to_string();
        }
        let mut sorted: Vec<(&str, &str)> = labels.to_vec();
        sorted.sort_unstable();
        let rendered: Vec<String> = sorted
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect();
        format!("{name}{{{}}}", rendered.join(","))
    }
}
