use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Latency samples kept per series; older ones are dropped
const LATENCY_WINDOW: usize = 1000;

/// Metrics collector shared by the controller, pool and cache.
///
/// Thread-safe and cheap to clone.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Recognition
    recognition_tests: AtomicUsize,
    recognition_cancelled: AtomicUsize,
    fallbacks_triggered: AtomicUsize,
    fallback_reasons: DashMap<String, AtomicUsize>,
    on_device_latency_ms: RwLock<Vec<u64>>,

    // Cloud API
    api_calls_success: AtomicUsize,
    api_calls_failed: AtomicUsize,
    api_latency_ms: RwLock<Vec<u64>>,
    credential_deactivations: AtomicUsize,

    // Translation cache
    cache_hits: AtomicUsize,
    cache_misses: AtomicUsize,
    cache_size: AtomicUsize,

    // Model switching
    model_switch_commits: AtomicUsize,
    model_switch_rollbacks: AtomicUsize,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                recognition_tests: AtomicUsize::new(0),
                recognition_cancelled: AtomicUsize::new(0),
                fallbacks_triggered: AtomicUsize::new(0),
                fallback_reasons: DashMap::new(),
                on_device_latency_ms: RwLock::new(Vec::new()),
                api_calls_success: AtomicUsize::new(0),
                api_calls_failed: AtomicUsize::new(0),
                api_latency_ms: RwLock::new(Vec::new()),
                credential_deactivations: AtomicUsize::new(0),
                cache_hits: AtomicUsize::new(0),
                cache_misses: AtomicUsize::new(0),
                cache_size: AtomicUsize::new(0),
                model_switch_commits: AtomicUsize::new(0),
                model_switch_rollbacks: AtomicUsize::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    // Recognition
    pub fn record_recognition_test(&self, on_device: Duration) {
        self.inner.recognition_tests.fetch_add(1, Ordering::Relaxed);
        push_sample(&self.inner.on_device_latency_ms, on_device);
    }

    pub fn record_recognition_cancelled(&self) {
        self.inner.recognition_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self, reason: &str) {
        self.inner.fallbacks_triggered.fetch_add(1, Ordering::Relaxed);
        self.inner
            .fallback_reasons
            .entry(reason.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    // Cloud API
    pub fn record_api_call(&self, success: bool, duration: Duration) {
        if success {
            self.inner.api_calls_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.api_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        push_sample(&self.inner.api_latency_ms, duration);
    }

    pub fn record_credential_deactivated(&self) {
        self.inner.credential_deactivations.fetch_add(1, Ordering::Relaxed);
    }

    // Cache
    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_cache_size(&self, size: usize) {
        self.inner.cache_size.store(size, Ordering::Relaxed);
    }

    // Model switching
    pub fn record_model_switch(&self, committed: bool) {
        if committed {
            self.inner.model_switch_commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.model_switch_rollbacks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn fallback_count(&self, reason: &str) -> usize {
        self.inner
            .fallback_reasons
            .get(reason)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let api_latency = self.inner.api_latency_ms.read();
        let api_latency_avg_ms = avg(&api_latency);
        let api_latency_p95_ms = percentile(&api_latency, 0.95);
        drop(api_latency);

        let on_device_latency_avg_ms = avg(&self.inner.on_device_latency_ms.read());

        let cache_hits = self.inner.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.inner.cache_misses.load(Ordering::Relaxed);
        let cache_total = cache_hits + cache_misses;
        let cache_hit_rate = if cache_total > 0 {
            cache_hits as f64 / cache_total as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            recognition_tests: self.inner.recognition_tests.load(Ordering::Relaxed),
            recognition_cancelled: self.inner.recognition_cancelled.load(Ordering::Relaxed),
            fallbacks_triggered: self.inner.fallbacks_triggered.load(Ordering::Relaxed),
            on_device_latency_avg_ms,
            api_calls_success: self.inner.api_calls_success.load(Ordering::Relaxed),
            api_calls_failed: self.inner.api_calls_failed.load(Ordering::Relaxed),
            api_latency_avg_ms,
            api_latency_p95_ms,
            credential_deactivations: self.inner.credential_deactivations.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            cache_hit_rate,
            cache_size: self.inner.cache_size.load(Ordering::Relaxed),
            model_switch_commits: self.inner.model_switch_commits.load(Ordering::Relaxed),
            model_switch_rollbacks: self.inner.model_switch_rollbacks.load(Ordering::Relaxed),
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = format!(
            r#"# HELP recognition_tests_total Recognition tests that finished their on-device pass
# TYPE recognition_tests_total counter
recognition_tests_total {{}} {}

# HELP recognition_cancelled_total Recognition tests cancelled or superseded
# TYPE recognition_cancelled_total counter
recognition_cancelled_total {{}} {}

# HELP on_device_latency_avg_ms Average on-device recognition latency
# TYPE on_device_latency_avg_ms gauge
on_device_latency_avg_ms {{}} {}

# HELP api_calls_total Cloud API calls by outcome
# TYPE api_calls_total counter
api_calls_total {{outcome="success"}} {}
api_calls_total {{outcome="failure"}} {}

# HELP api_latency_avg_ms Average cloud API latency in milliseconds
# TYPE api_latency_avg_ms gauge
api_latency_avg_ms {{}} {}

# HELP credential_deactivations_total Credentials removed from rotation after errors
# TYPE credential_deactivations_total counter
credential_deactivations_total {{}} {}

# HELP cache_hit_rate Translation cache hit rate (0.0 to 1.0)
# TYPE cache_hit_rate gauge
cache_hit_rate {{}} {}

# HELP cache_size Current translation cache entries
# TYPE cache_size gauge
cache_size {{}} {}

# HELP model_switches_total Debounced model switches by outcome
# TYPE model_switches_total counter
model_switches_total {{outcome="committed"}} {}
model_switches_total {{outcome="rolled_back"}} {}

# HELP uptime_seconds Uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}

# HELP fallbacks_total Cloud fallbacks by reason
# TYPE fallbacks_total counter
"#,
            s.recognition_tests,
            s.recognition_cancelled,
            s.on_device_latency_avg_ms,
            s.api_calls_success,
            s.api_calls_failed,
            s.api_latency_avg_ms,
            s.credential_deactivations,
            s.cache_hit_rate,
            s.cache_size,
            s.model_switch_commits,
            s.model_switch_rollbacks,
            s.uptime_seconds,
        );

        let mut reasons: Vec<(String, usize)> = self
            .inner
            .fallback_reasons
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        reasons.sort();
        for (reason, count) in reasons {
            out.push_str(&format!("fallbacks_total {{reason=\"{}\"}} {}\n", reason, count));
        }

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub recognition_tests: usize,
    pub recognition_cancelled: usize,
    pub fallbacks_triggered: usize,
    pub on_device_latency_avg_ms: u64,
    pub api_calls_success: usize,
    pub api_calls_failed: usize,
    pub api_latency_avg_ms: u64,
    pub api_latency_p95_ms: u64,
    pub credential_deactivations: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub cache_hit_rate: f64,
    pub cache_size: usize,
    pub model_switch_commits: usize,
    pub model_switch_rollbacks: usize,
    pub uptime_seconds: u64,
}

fn push_sample(samples: &RwLock<Vec<u64>>, duration: Duration) {
    let mut samples = samples.write();
    if samples.len() >= LATENCY_WINDOW {
        let excess = samples.len() + 1 - LATENCY_WINDOW;
        samples.drain(..excess);
    }
    samples.push(duration.as_millis() as u64);
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_recognition_test(Duration::from_millis(40));
        metrics.record_fallback("low_confidence");
        metrics.record_fallback("low_confidence");
        metrics.record_fallback("always_cloud");
        metrics.record_api_call(true, Duration::from_millis(100));
        metrics.record_api_call(false, Duration::from_millis(50));
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_model_switch(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.recognition_tests, 1);
        assert_eq!(snapshot.fallbacks_triggered, 3);
        assert_eq!(snapshot.api_calls_success, 1);
        assert_eq!(snapshot.api_calls_failed, 1);
        assert_eq!(snapshot.cache_hit_rate, 0.5);
        assert_eq!(snapshot.model_switch_commits, 1);
        assert_eq!(metrics.fallback_count("low_confidence"), 2);
        assert_eq!(metrics.fallback_count("forced_test"), 0);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let metrics = Metrics::new();
        for _ in 0..LATENCY_WINDOW {
            metrics.record_api_call(true, Duration::from_millis(1000));
        }
        for _ in 0..LATENCY_WINDOW {
            metrics.record_api_call(true, Duration::from_millis(10));
        }

        assert_eq!(metrics.inner.api_latency_ms.read().len(), LATENCY_WINDOW);
        assert_eq!(metrics.snapshot().api_latency_avg_ms, 10);
        assert_eq!(metrics.snapshot().api_calls_success, 2 * LATENCY_WINDOW);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_api_call(true, Duration::from_millis(100));
        metrics.record_fallback("always_cloud");

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("api_calls_total {outcome=\"success\"} 1"));
        assert!(prometheus.contains("fallbacks_total {reason=\"always_cloud\"} 1"));
    }
}
