//! Observability port.
//!
//! Components never touch process-wide metric registries. They receive an
//! `Arc<dyn Observer>` at construction and report through it.
//! [`CounterObserver`] keeps everything in memory and mirrors each event to
//! `tracing` at `trace` level; a real metrics exporter implements the same
//! trait.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::trace;

/// Metric names used by the engine.
pub mod names {
    pub const REGISTER: &str = "tunnel_register_total";
    pub const FRAME_DROPPED: &str = "tunnel_frame_dropped_total";
    pub const QUEUE_FUSE: &str = "tunnel_queue_fuse_total";
    pub const COMMAND: &str = "tunnel_command_total";
    pub const PUSH_FAILED: &str = "tunnel_push_failed_total";
    pub const WRITE_FAILED: &str = "tunnel_write_failed_total";
    pub const SESSION_COUNT: &str = "tunnel_session_count";
    pub const QUEUE_DEPTH: &str = "tunnel_queue_depth";
}

pub type Labels<'a> = &'a [(&'static str, &'a str)];

pub trait Observer: Send + Sync + 'static {
    fn inc_counter(&self, name: &'static str, labels: Labels<'_>);
    fn observe_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64);
}

/// In-memory counters and gauges keyed by `name{k=v,...}`.
#[derive(Debug, Default)]
pub struct CounterObserver {
    counters: Mutex<BTreeMap<String, u64>>,
    gauges: Mutex<BTreeMap<String, f64>>,
}

impl CounterObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current value of a counter, 0 if never incremented.
    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        let key = series_key(name, labels);
        self.counters
            .lock()
            .map(|c| c.get(&key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        let key = series_key(name, labels);
        self.gauges.lock().ok().and_then(|g| g.get(&key).copied())
    }

    /// All counters, sorted by series key.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        self.counters
            .lock()
            .map(|c| c.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default()
    }
}

impl Observer for CounterObserver {
    fn inc_counter(&self, name: &'static str, labels: Labels<'_>) {
        let key = series_key(name, labels);
        trace!(target: "metrics", series = %key, "inc");
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(key).or_insert(0) += 1;
        }
    }

    fn observe_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        let key = series_key(name, labels);
        trace!(target: "metrics", series = %key, value, "gauge");
        if let Ok(mut gauges) = self.gauges.lock() {
            gauges.insert(key, value);
        }
    }
}

fn series_key(name: &str, labels: Labels<'_>) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort_unstable_by_key(|(k, _)| *k);
    let inner: Vec<String> = sorted.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", inner.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_keyed_by_sorted_labels() {
        let obs = CounterObserver::new();
        obs.inc_counter(names::COMMAND, &[("result", "ok"), ("cmd", "pull_release")]);
        obs.inc_counter(names::COMMAND, &[("cmd", "pull_release"), ("result", "ok")]);
        assert_eq!(
            obs.counter(names::COMMAND, &[("cmd", "pull_release"), ("result", "ok")]),
            2
        );
        assert_eq!(
            obs.snapshot(),
            vec![("tunnel_command_total{cmd=pull_release,result=ok}".to_string(), 2)]
        );
    }

    #[test]
    fn test_gauge_keeps_last_value() {
        let obs = CounterObserver::new();
        obs.observe_gauge(names::SESSION_COUNT, &[], 3.0);
        obs.observe_gauge(names::SESSION_COUNT, &[], 5.0);
        assert_eq!(obs.gauge(names::SESSION_COUNT, &[]), Some(5.0));
        assert_eq!(obs.counter(names::REGISTER, &[]), 0);
    }
}
