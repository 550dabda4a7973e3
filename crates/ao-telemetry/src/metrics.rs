//! In-process Prometheus-compatible metrics: counters, gauges, and
//! histograms, with a process-wide singleton for the request middleware to
//! publish into and an operator-facing `/metrics` route to export from.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use dashmap::DashMap;
use serde_json::{json, Value};

/// Histogram bucket upper bounds, in seconds. Matches the default buckets
/// most Prometheus client libraries ship, which fit both HTTP request
/// latencies and hosted-API call latencies without retuning per metric.
const BUCKET_BOUNDS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// A sorted, deduplicated-by-key label set, rendered Prometheus-style.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut owned: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        owned.sort_by(|a, b| a.0.cmp(&b.0));
        Self(owned)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let body = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect::<Vec<_>>()
            .join(",");
        format!("{{{body}}}")
    }
}

struct Histogram {
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum_bits: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: BUCKET_BOUNDS.iter().map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum_bits: AtomicU64::new(0.0f64.to_bits()),
        }
    }

    fn observe(&self, value: f64) {
        for (bound, bucket) in BUCKET_BOUNDS.iter().zip(self.buckets.iter()) {
            if value <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        loop {
            let current = self.sum_bits.load(Ordering::Relaxed);
            let next = (f64::from_bits(current) + value).to_bits();
            if self
                .sum_bits
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn cumulative_buckets(&self) -> Vec<(f64, u64)> {
        let mut running = 0u64;
        let mut out = Vec::with_capacity(BUCKET_BOUNDS.len() + 1);
        for (bound, bucket) in BUCKET_BOUNDS.iter().zip(self.buckets.iter()) {
            running += bucket.load(Ordering::Relaxed);
            out.push((*bound, running));
        }
        out.push((f64::INFINITY, self.count()));
        out
    }
}

/// Thread-safe store of counters, gauges, and histograms, keyed by metric
/// name (plus label set for counters). One instance is enough for a whole
/// process; see [`global_metrics`].
pub struct MetricsCollector {
    counters: DashMap<(String, Labels), AtomicU64>,
    gauges: DashMap<String, AtomicI64>,
    histograms: DashMap<String, Histogram>,
    // Preserves first-seen label order for a counter name, so prometheus
    // export is stable across calls instead of DashMap's iteration order.
    counter_label_order: Mutex<Vec<(String, Labels)>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            gauges: DashMap::new(),
            histograms: DashMap::new(),
            counter_label_order: Mutex::new(Vec::new()),
        }
    }

    /// Registers the histograms this codebase's HTTP and agent layers
    /// publish into, so `/metrics` always shows them even before the first
    /// request or agent run completes.
    pub fn with_defaults(self) -> Self {
        self.histograms
            .entry("api_request_duration_seconds".to_string())
            .or_insert_with(Histogram::new);
        self.histograms
            .entry("llm_request_duration_seconds".to_string())
            .or_insert_with(Histogram::new);
        self
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], by: u64) {
        let key = (name.to_string(), Labels::new(labels));
        if !self.counters.contains_key(&key) {
            self.counter_label_order.lock().unwrap().push(key.clone());
        }
        self.counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(by, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        self.counters
            .get(&key)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn set_gauge(&self, name: &str, value: i64) {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        self.gauges
            .get(name)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn record_histogram(&self, name: &str, value: f64) {
        self.histograms
            .entry(name.to_string())
            .or_insert_with(Histogram::new)
            .observe(value);
    }

    /// Renders every metric in Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        let mut seen_counter_names = Vec::new();
        for (name, labels) in self.counter_label_order.lock().unwrap().iter() {
            if !seen_counter_names.contains(name) {
                seen_counter_names.push(name.clone());
            }
            if let Some(value) = self.counters.get(&(name.clone(), labels.clone())) {
                if !out.contains(&format!("# TYPE {name} counter")) {
                    out.push_str(&format!("# TYPE {name} counter\n"));
                }
                out.push_str(&format!(
                    "{name}{} {}\n",
                    labels.prometheus_str(),
                    value.load(Ordering::Relaxed)
                ));
            }
        }

        for entry in self.gauges.iter() {
            out.push_str(&format!("# TYPE {} gauge\n", entry.key()));
            out.push_str(&format!("{} {}\n", entry.key(), entry.value().load(Ordering::Relaxed)));
        }

        for entry in self.histograms.iter() {
            let name = entry.key();
            let hist = entry.value();
            out.push_str(&format!("# TYPE {name} histogram\n"));
            for (bound, cumulative) in hist.cumulative_buckets() {
                let le = if bound.is_infinite() {
                    "+Inf".to_string()
                } else {
                    bound.to_string()
                };
                out.push_str(&format!("{name}_bucket{{le=\"{le}\"}} {cumulative}\n"));
            }
            out.push_str(&format!("{name}_sum {}\n", hist.sum()));
            out.push_str(&format!("{name}_count {}\n", hist.count()));
        }

        out
    }

    /// Renders every metric as a JSON document, for the dashboard-facing
    /// `/metrics.json`-style route.
    pub fn export_json(&self) -> Value {
        let mut counters = serde_json::Map::new();
        for entry in self.counters.iter() {
            let (name, labels) = entry.key();
            let full_name = format!("{name}{}", labels.prometheus_str());
            counters.insert(full_name, json!(entry.value().load(Ordering::Relaxed)));
        }

        let mut gauges = serde_json::Map::new();
        for entry in self.gauges.iter() {
            gauges.insert(entry.key().clone(), json!(entry.value().load(Ordering::Relaxed)));
        }

        let mut histograms = serde_json::Map::new();
        for entry in self.histograms.iter() {
            let hist = entry.value();
            let buckets: Vec<Value> = hist
                .cumulative_buckets()
                .into_iter()
                .map(|(bound, count)| {
                    json!({
                        "le": if bound.is_infinite() { "+Inf".to_string() } else { bound.to_string() },
                        "count": count,
                    })
                })
                .collect();
            histograms.insert(
                entry.key().clone(),
                json!({
                    "count": hist.count(),
                    "sum": hist.sum(),
                    "buckets": buckets,
                }),
            );
        }

        json!({
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }
}

static GLOBAL_METRICS: OnceLock<MetricsCollector> = OnceLock::new();

/// The process-wide metrics singleton, used by the request middleware and
/// agent-run instrumentation so every component publishes into the same
/// `/metrics` surface without threading a handle through every call site.
pub fn global_metrics() -> &'static MetricsCollector {
    GLOBAL_METRICS.get_or_init(|| MetricsCollector::new().with_defaults())
}
