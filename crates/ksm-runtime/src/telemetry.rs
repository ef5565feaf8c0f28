// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Self metrics of the exporter, served by the telemetry server.
//!
//! The registry is shared by every actor of a lifecycle and written
//! concurrently: counters and gauges are atomics, labelled families sit behind
//! `parking_lot` locks. A fresh registry is created for every lifecycle, so
//! self metrics are reset on restart.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

pub const NAMESPACE: &str = "kube_state_metrics";

/// Default Prometheus histogram buckets, in seconds.
const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Reload status of one configuration source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReloadState {
    /// Fingerprint of the last successfully loaded content.
    pub hash: Option<f64>,
    /// Whether the last reload attempt succeeded.
    pub success: bool,
    /// Unix timestamp, in seconds, of the last successful reload.
    pub last_success_time: Option<f64>,
}

#[derive(Debug)]
struct Histogram {
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum_bits: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: DEFAULT_BUCKETS.iter().map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    fn observe(&self, value: f64) {
        if let Some(i) = DEFAULT_BUCKETS.iter().position(|bound| value <= *bound) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .sum_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
    }
}

/// Registry of the exporter's own metrics.
#[derive(Debug)]
pub struct SelfMetrics {
    version: String,
    reload_states: RwLock<BTreeMap<(String, String), ReloadState>>,
    crd_add_events: AtomicU64,
    crd_delete_events: AtomicU64,
    crd_cache: AtomicI64,
    request_durations: RwLock<BTreeMap<String, Histogram>>,
}

impl Default for SelfMetrics {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_VERSION"))
    }
}

impl SelfMetrics {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            reload_states: RwLock::new(BTreeMap::new()),
            crd_add_events: AtomicU64::new(0),
            crd_delete_events: AtomicU64::new(0),
            crd_cache: AtomicI64::new(0),
            request_durations: RwLock::new(BTreeMap::new()),
        }
    }

    /// Record a successful load of `filename` with the content fingerprint `hash`.
    pub fn record_reload_success(&self, config_type: &str, filename: &str, hash: f64) {
        let mut states = self.reload_states.write();
        let state = states
            .entry((config_type.to_string(), filename.to_string()))
            .or_default();
        state.hash = Some(hash);
        state.success = true;
        state.last_success_time = Some(unix_now());
    }

    /// Record a failed load. Hash and success time of earlier loads are kept.
    pub fn record_reload_failure(&self, config_type: &str, filename: &str) {
        let mut states = self.reload_states.write();
        states
            .entry((config_type.to_string(), filename.to_string()))
            .or_default()
            .success = false;
    }

    pub fn reload_state(&self, config_type: &str, filename: &str) -> Option<ReloadState> {
        self.reload_states
            .read()
            .get(&(config_type.to_string(), filename.to_string()))
            .cloned()
    }

    /// A custom resource definition started affecting the cache.
    pub fn record_crd_add(&self) {
        self.crd_add_events.fetch_add(1, Ordering::Relaxed);
        self.crd_cache.fetch_add(1, Ordering::Relaxed);
    }

    /// A custom resource definition stopped affecting the cache.
    pub fn record_crd_delete(&self) {
        self.crd_delete_events.fetch_add(1, Ordering::Relaxed);
        self.crd_cache.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn crd_cache_count(&self) -> i64 {
        self.crd_cache.load(Ordering::Relaxed)
    }

    /// Observe the duration of one request to the metrics handler.
    pub fn observe_request(&self, method: &str, elapsed: Duration) {
        let seconds = elapsed.as_secs_f64();
        if let Some(histogram) = self.request_durations.read().get(method) {
            histogram.observe(seconds);
            return;
        }
        self.request_durations
            .write()
            .entry(method.to_string())
            .or_insert_with(Histogram::new)
            .observe(seconds);
    }

    /// Render every family in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        write_header(
            &mut out,
            "build_info",
            "A metric with a constant '1' value labeled by version.",
            "gauge",
        );
        write_sample(
            &mut out,
            "build_info",
            &[("version", self.version.as_str())],
            1.0,
        );

        let states = self.reload_states.read();
        write_header(
            &mut out,
            "config_hash",
            "Hash of the currently loaded configuration.",
            "gauge",
        );
        for ((config_type, filename), state) in states.iter() {
            if let Some(hash) = state.hash {
                let labels = [("type", config_type.as_str()), ("filename", filename.as_str())];
                write_sample(&mut out, "config_hash", &labels, hash);
            }
        }
        write_header(
            &mut out,
            "last_config_reload_successful",
            "Whether the last configuration reload attempt was successful.",
            "gauge",
        );
        for ((config_type, filename), state) in states.iter() {
            let labels = [("type", config_type.as_str()), ("filename", filename.as_str())];
            let value = if state.success { 1.0 } else { 0.0 };
            write_sample(&mut out, "last_config_reload_successful", &labels, value);
        }
        write_header(
            &mut out,
            "last_config_reload_success_timestamp_seconds",
            "Timestamp of the last successful configuration reload.",
            "gauge",
        );
        for ((config_type, filename), state) in states.iter() {
            if let Some(timestamp) = state.last_success_time {
                let labels = [("type", config_type.as_str()), ("filename", filename.as_str())];
                write_sample(
                    &mut out,
                    "last_config_reload_success_timestamp_seconds",
                    &labels,
                    timestamp,
                );
            }
        }
        drop(states);

        write_header(
            &mut out,
            "custom_resource_state_add_events_total",
            "Number of times that the CRD informer triggered the add event.",
            "counter",
        );
        write_sample(
            &mut out,
            "custom_resource_state_add_events_total",
            &[],
            self.crd_add_events.load(Ordering::Relaxed) as f64,
        );
        write_header(
            &mut out,
            "custom_resource_state_delete_events_total",
            "Number of times that the CRD informer triggered the remove event.",
            "counter",
        );
        write_sample(
            &mut out,
            "custom_resource_state_delete_events_total",
            &[],
            self.crd_delete_events.load(Ordering::Relaxed) as f64,
        );
        write_header(
            &mut out,
            "custom_resource_state_cache",
            "Net amount of CRDs affecting the cache currently.",
            "gauge",
        );
        write_sample(
            &mut out,
            "custom_resource_state_cache",
            &[],
            self.crd_cache_count() as f64,
        );

        self.render_request_durations(&mut out);
        out
    }

    // Not namespaced, matching the handler instrumentation of the Go exporter.
    fn render_request_durations(&self, out: &mut String) {
        let name = "http_request_duration_seconds";
        let _ = writeln!(
            out,
            "# HELP {name} A histogram of requests for kube-state-metrics metrics handler."
        );
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (method, histogram) in self.request_durations.read().iter() {
            let mut cumulative = 0;
            for (bound, bucket) in DEFAULT_BUCKETS.iter().zip(&histogram.buckets) {
                cumulative += bucket.load(Ordering::Relaxed);
                let le = bound.to_string();
                let labels = [("handler", "metrics"), ("method", method.as_str()), ("le", le.as_str())];
                write_raw_sample(out, &format!("{name}_bucket"), &labels, cumulative as f64);
            }
            let count = histogram.count.load(Ordering::Relaxed) as f64;
            let labels = [("handler", "metrics"), ("method", method.as_str()), ("le", "+Inf")];
            write_raw_sample(out, &format!("{name}_bucket"), &labels, count);
            let labels = [("handler", "metrics"), ("method", method.as_str())];
            let sum = f64::from_bits(histogram.sum_bits.load(Ordering::Relaxed));
            write_raw_sample(out, &format!("{name}_sum"), &labels, sum);
            write_raw_sample(out, &format!("{name}_count"), &labels, count);
        }
    }
}

/// Content fingerprint usable as a gauge value: the first six bytes of the
/// MD5 digest read as a little-endian integer, so it fits a float64 mantissa.
pub fn md5_hash_as_metric_value(data: &[u8]) -> f64 {
    use md5::{Digest, Md5};

    let sum = Md5::digest(data);
    let mut bytes = [0u8; 8];
    bytes[..6].copy_from_slice(&sum[..6]);
    u64::from_le_bytes(bytes) as f64
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

fn write_header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {NAMESPACE}_{name} {help}");
    let _ = writeln!(out, "# TYPE {NAMESPACE}_{name} {kind}");
}

fn write_sample(out: &mut String, name: &str, labels: &[(&str, &str)], value: f64) {
    write_raw_sample(out, &format!("{NAMESPACE}_{name}"), labels, value);
}

fn write_raw_sample(out: &mut String, name: &str, labels: &[(&str, &str)], value: f64) {
    if labels.is_empty() {
        let _ = writeln!(out, "{name} {value}");
        return;
    }
    let labels = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect::<Vec<_>>()
        .join(",");
    let _ = writeln!(out, "{name}{{{labels}}} {value}");
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
