//! Vendor circuit breaker and health signal.
//!
//! Samples live in the shared key-value store as sorted sets scored by wall
//! clock, trimmed with range deletes. The circuit document is a small JSON
//! value per vendor. A tiny in-process TTL cache absorbs the repeated
//! composed-health reads the router issues while ranking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::providers::ErrorKind;
use crate::storage::KvStore;

use super::metrics::HealthMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }

    fn gauge(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Sliding request-sample window.
    pub window: Duration,
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes required to close.
    pub half_open_requests: u32,
    /// First open duration; doubled per recent trip, capped at 10x.
    pub base_open_duration: Duration,
    pub delivery_series_max: usize,
    pub sms_series_max: usize,
    /// TTL of the composed-health read cache.
    pub health_cache_ttl: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            failure_threshold: 5,
            half_open_requests: 3,
            base_open_duration: Duration::from_secs(30),
            delivery_series_max: 50,
            sms_series_max: 100,
            health_cache_ttl: Duration::from_secs(5),
        }
    }
}

/// Composed health signal for one `(vendor, country)` pair.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub vendor: String,
    pub circuit: CircuitState,
    /// Decayed success rate; `None` when no samples exist yet.
    pub success_rate: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub avg_delivery_ms: Option<f64>,
    pub avg_sms_count: Option<f64>,
}

impl ProviderHealth {
    pub fn is_available(&self) -> bool {
        self.circuit != CircuitState::Open
    }

    /// Admission-oriented rate: optimistic 1.0 when unknown.
    pub fn success_rate_or_optimistic(&self) -> f64 {
        self.success_rate.unwrap_or(1.0)
    }
}

/// Circuit document persisted per vendor.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CircuitDoc {
    state: CircuitState,
    /// Epoch ms when an open circuit admits probes again.
    open_until_ms: i64,
    half_open_successes: u32,
    /// Set by operator overrides; automatic transitions leave it alone.
    forced: bool,
}

impl Default for CircuitDoc {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            open_until_ms: 0,
            half_open_successes: 0,
            forced: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    ts_ms: i64,
    success: bool,
    latency_ms: u64,
}

impl Sample {
    fn encode(&self) -> String {
        format!(
            "{}|{}|{}",
            self.ts_ms,
            if self.success { 1 } else { 0 },
            self.latency_ms
        )
    }

    fn decode(raw: &str) -> Option<Self> {
        let mut parts = raw.split('|');
        Some(Self {
            ts_ms: parts.next()?.parse().ok()?,
            success: parts.next()? == "1",
            latency_ms: parts.next()?.parse().ok()?,
        })
    }
}

/// Exponentially time-decayed success rate: each sample is weighted
/// `0.5^(age / (window/4))`, so a sample half a window old carries a quarter
/// of a fresh sample's weight.
fn decayed_success_rate(samples: &[Sample], now_ms: i64, window_ms: i64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let half_life = (window_ms as f64 / 4.0).max(1.0);
    let mut weighted_ok = 0.0;
    let mut weighted_total = 0.0;
    for sample in samples {
        let age = (now_ms - sample.ts_ms).max(0) as f64;
        let weight = 0.5_f64.powf(age / half_life);
        weighted_total += weight;
        if sample.success {
            weighted_ok += weight;
        }
    }
    if weighted_total <= 0.0 {
        return None;
    }
    Some(weighted_ok / weighted_total)
}

type HealthCacheKey = (String, Option<String>);

pub struct HealthMonitor {
    kv: Arc<dyn KvStore>,
    config: HealthConfig,
    metrics: Arc<HealthMetrics>,
    cache: RwLock<HashMap<HealthCacheKey, (Instant, ProviderHealth)>>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl HealthMonitor {
    pub fn new(kv: Arc<dyn KvStore>, config: HealthConfig, metrics: Arc<HealthMetrics>) -> Self {
        Self {
            kv,
            config,
            metrics,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn samples_key(vendor: &str, country: Option<&str>) -> String {
        match country {
            Some(country) => format!("health:samples:{}:{}", vendor, country),
            None => format!("health:samples:{}", vendor),
        }
    }

    fn circuit_key(vendor: &str) -> String {
        format!("health:circuit:{}", vendor)
    }

    fn consec_key(vendor: &str) -> String {
        format!("health:consec:{}", vendor)
    }

    fn trips_key(vendor: &str) -> String {
        format!("health:trips:{}", vendor)
    }

    fn load_circuit(&self, vendor: &str) -> CircuitDoc {
        self.kv
            .get(&Self::circuit_key(vendor))
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn store_circuit(&self, vendor: &str, doc: &CircuitDoc) {
        match serde_json::to_string(doc) {
            Ok(raw) => {
                if let Err(e) = self.kv.set(&Self::circuit_key(vendor), &raw, None) {
                    warn!(vendor, "failed storing circuit state: {}", e);
                }
            }
            Err(e) => warn!(vendor, "failed encoding circuit state: {}", e),
        }
        self.metrics.set_circuit_status(vendor, doc.state.gauge());
    }

    fn counter(&self, key: &str) -> u32 {
        self.kv
            .get(key)
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn set_counter(&self, key: &str, value: u32, ttl: Option<Duration>) {
        if let Err(e) = self.kv.set(key, &value.to_string(), ttl) {
            warn!(key, "failed storing health counter: {}", e);
        }
    }

    /// Current circuit state, resolving open-TTL expiry to half-open lazily.
    pub fn circuit_state(&self, vendor: &str) -> CircuitState {
        let mut doc = self.load_circuit(vendor);
        if doc.state == CircuitState::Open && !doc.forced && now_ms() >= doc.open_until_ms {
            doc.state = CircuitState::HalfOpen;
            doc.half_open_successes = 0;
            self.store_circuit(vendor, &doc);
            info!(vendor, "circuit open TTL expired, admitting probes");
        }
        doc.state
    }

    pub fn is_available(&self, vendor: &str) -> bool {
        self.circuit_state(vendor) != CircuitState::Open
    }

    fn open_circuit(&self, vendor: &str, doc: &mut CircuitDoc) {
        let trips = self.counter(&Self::trips_key(vendor)) + 1;
        // Recent-trip memory fades after ~an hour of good behavior.
        self.set_counter(
            &Self::trips_key(vendor),
            trips,
            Some(Duration::from_secs(3600)),
        );

        let factor = 2_u32.saturating_pow(trips.saturating_sub(1)).min(10);
        let open_for = self.config.base_open_duration * factor;
        doc.state = CircuitState::Open;
        doc.open_until_ms = now_ms() + open_for.as_millis() as i64;
        doc.half_open_successes = 0;
        doc.forced = false;
        self.store_circuit(vendor, doc);
        self.metrics.record_circuit_open(vendor);
        warn!(vendor, trips, "circuit opened for {:?}", open_for);
    }

    /// Record one request outcome. `LIFECYCLE_TERMINAL` arrives as an error
    /// upstream but is a success here.
    pub fn record_outcome(
        &self,
        vendor: &str,
        country: Option<&str>,
        mut success: bool,
        latency_ms: u64,
        error_kind: Option<ErrorKind>,
    ) {
        if let Some(kind) = error_kind {
            if kind.is_health_success() {
                success = true;
            }
        }
        let now = now_ms();
        let sample = Sample {
            ts_ms: now,
            success,
            latency_ms,
        };
        let window_ms = self.config.window.as_millis() as i64;

        for key in [
            Some(Self::samples_key(vendor, None)),
            country.map(|c| Self::samples_key(vendor, Some(c))),
        ]
        .into_iter()
        .flatten()
        {
            if let Err(e) = self.kv.zadd(&key, now as f64, &sample.encode()) {
                warn!(vendor, "failed recording health sample: {}", e);
            }
            let _ = self.kv.zremrange(&key, 0.0, (now - window_ms) as f64);
        }

        // Consecutive-failure counter and circuit transitions.
        let consec_key = Self::consec_key(vendor);
        let mut doc = self.load_circuit(vendor);
        // Resolve a stale open first so a probe outcome lands in half-open.
        if doc.state == CircuitState::Open && !doc.forced && now >= doc.open_until_ms {
            doc.state = CircuitState::HalfOpen;
            doc.half_open_successes = 0;
        }

        if success {
            self.set_counter(&consec_key, 0, None);
            match doc.state {
                CircuitState::HalfOpen => {
                    doc.half_open_successes += 1;
                    if doc.half_open_successes >= self.config.half_open_requests {
                        doc.state = CircuitState::Closed;
                        doc.half_open_successes = 0;
                        info!(vendor, "circuit closed after successful probes");
                    }
                    self.store_circuit(vendor, &doc);
                }
                _ => self.store_circuit(vendor, &doc),
            }
        } else {
            let consec = self.counter(&consec_key) + 1;
            self.set_counter(&consec_key, consec, None);
            let systemic = error_kind.map(|k| k.is_systemic()).unwrap_or(false);
            match doc.state {
                CircuitState::HalfOpen => self.open_circuit(vendor, &mut doc),
                CircuitState::Closed
                    if systemic || consec >= self.config.failure_threshold =>
                {
                    self.open_circuit(vendor, &mut doc)
                }
                _ => self.store_circuit(vendor, &doc),
            }
        }

        self.metrics.record_request(vendor, success);
        self.refresh_gauges(vendor);
        self.invalidate(vendor);
    }

    pub fn record_delivery_time(&self, vendor: &str, delivery_ms: u64) {
        let key = format!("health:delivery:{}", vendor);
        let now = now_ms();
        if let Err(e) = self.kv.zadd(&key, now as f64, &delivery_ms.to_string()) {
            warn!(vendor, "failed recording delivery time: {}", e);
        }
        let _ = self.kv.ztrim_to(&key, self.config.delivery_series_max);
        self.invalidate(vendor);
    }

    pub fn record_sms_count(&self, vendor: &str, count: u32) {
        let key = format!("health:sms:{}", vendor);
        let now = now_ms();
        if let Err(e) = self.kv.zadd(&key, now as f64, &count.to_string()) {
            warn!(vendor, "failed recording sms count: {}", e);
        }
        let _ = self.kv.ztrim_to(&key, self.config.sms_series_max);
        self.invalidate(vendor);
    }

    /// Operator override: refuse traffic until forced closed again.
    pub fn force_open(&self, vendor: &str) {
        let doc = CircuitDoc {
            state: CircuitState::Open,
            open_until_ms: i64::MAX,
            half_open_successes: 0,
            forced: true,
        };
        self.store_circuit(vendor, &doc);
        self.invalidate(vendor);
        info!(vendor, "circuit forced open by operator");
    }

    /// Operator override: close and clear counters.
    pub fn force_closed(&self, vendor: &str) {
        self.store_circuit(vendor, &CircuitDoc::default());
        self.set_counter(&Self::consec_key(vendor), 0, None);
        if let Err(e) = self.kv.delete(&Self::trips_key(vendor)) {
            warn!(vendor, "failed clearing trip counter: {}", e);
        }
        self.invalidate(vendor);
        info!(vendor, "circuit forced closed by operator");
    }

    fn window_samples(&self, vendor: &str, country: Option<&str>) -> Vec<Sample> {
        let key = Self::samples_key(vendor, country);
        let now = now_ms();
        let min = (now - self.config.window.as_millis() as i64) as f64;
        self.kv
            .zrange(&key, min, now as f64)
            .unwrap_or_default()
            .iter()
            .filter_map(|raw| Sample::decode(raw))
            .collect()
    }

    fn series_avg(&self, key: &str) -> Option<f64> {
        let values: Vec<f64> = self
            .kv
            .zrange(key, 0.0, f64::MAX)
            .unwrap_or_default()
            .iter()
            .filter_map(|v| v.parse().ok())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }

    /// Decayed success rate over the window; `None` when unknown.
    pub fn success_rate(&self, vendor: &str, country: Option<&str>) -> Option<f64> {
        let samples = self.window_samples(vendor, country);
        decayed_success_rate(&samples, now_ms(), self.config.window.as_millis() as i64)
    }

    /// Composed health for ranking, cached for a few seconds.
    pub fn provider_health(&self, vendor: &str, country: Option<&str>) -> ProviderHealth {
        let cache_key = (vendor.to_string(), country.map(String::from));
        if let Some((at, health)) = self.cache.read().get(&cache_key) {
            if at.elapsed() < self.config.health_cache_ttl {
                return health.clone();
            }
        }

        // A facet with no samples yet falls back to the vendor-level window.
        let mut samples = self.window_samples(vendor, country);
        if samples.is_empty() && country.is_some() {
            samples = self.window_samples(vendor, None);
        }
        let success_rate =
            decayed_success_rate(&samples, now_ms(), self.config.window.as_millis() as i64);
        let avg_latency_ms = if samples.is_empty() {
            None
        } else {
            Some(samples.iter().map(|s| s.latency_ms as f64).sum::<f64>() / samples.len() as f64)
        };

        let health = ProviderHealth {
            vendor: vendor.to_string(),
            circuit: self.circuit_state(vendor),
            success_rate,
            avg_latency_ms,
            avg_delivery_ms: self.series_avg(&format!("health:delivery:{}", vendor)),
            avg_sms_count: self.series_avg(&format!("health:sms:{}", vendor)),
        };

        if let Some(rate) = success_rate {
            self.metrics.set_success_rate(vendor, rate);
        }
        if let Some(latency) = avg_latency_ms {
            self.metrics.set_avg_latency(vendor, latency);
        }

        self.cache
            .write()
            .insert(cache_key, (Instant::now(), health.clone()));
        health
    }

    fn refresh_gauges(&self, vendor: &str) {
        if let Some(rate) = self.success_rate(vendor, None) {
            self.metrics.set_success_rate(vendor, rate);
        }
    }

    fn invalidate(&self, vendor: &str) {
        self.cache.write().retain(|(v, _), _| v != vendor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;

    fn monitor(config: HealthConfig) -> HealthMonitor {
        HealthMonitor::new(
            Arc::new(MemoryKv::new()),
            config,
            Arc::new(HealthMetrics::new()),
        )
    }

    #[test]
    fn decay_weights_younger_samples_4x_at_half_window() {
        let window = 60_000;
        let now = 1_000_000;
        // One failure now, one success half a window ago: young sample must
        // dominate by 4x.
        let samples = vec![
            Sample {
                ts_ms: now,
                success: false,
                latency_ms: 10,
            },
            Sample {
                ts_ms: now - window / 2,
                success: true,
                latency_ms: 10,
            },
        ];
        let rate = decayed_success_rate(&samples, now, window).unwrap();
        // weight(young)=1, weight(old)=0.25 -> rate = 0.25/1.25 = 0.2
        assert!((rate - 0.2).abs() < 1e-9);
    }

    #[test]
    fn unknown_rate_is_none() {
        let m = monitor(HealthConfig::default());
        assert!(m.success_rate("ghost", None).is_none());
        assert!(m.provider_health("ghost", None).is_available());
        assert_eq!(
            m.provider_health("ghost", None).success_rate_or_optimistic(),
            1.0
        );
    }

    #[test]
    fn consecutive_failures_open_the_circuit() {
        let m = monitor(HealthConfig {
            failure_threshold: 5,
            ..HealthConfig::default()
        });
        for _ in 0..4 {
            m.record_outcome("v", None, false, 100, Some(ErrorKind::ServerError));
            assert!(m.is_available("v"));
        }
        m.record_outcome("v", None, false, 100, Some(ErrorKind::ServerError));
        assert!(!m.is_available("v"));
        assert_eq!(m.circuit_state("v"), CircuitState::Open);
    }

    #[test]
    fn systemic_error_trips_immediately() {
        let m = monitor(HealthConfig::default());
        m.record_outcome("v", None, false, 50, Some(ErrorKind::BadCredentials));
        assert!(!m.is_available("v"));
    }

    #[test]
    fn open_expires_to_half_open_then_closes_after_probes() {
        let m = monitor(HealthConfig {
            base_open_duration: Duration::from_millis(20),
            half_open_requests: 3,
            ..HealthConfig::default()
        });
        m.record_outcome("v", None, false, 50, Some(ErrorKind::BadCredentials));
        assert_eq!(m.circuit_state("v"), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(m.circuit_state("v"), CircuitState::HalfOpen);

        m.record_outcome("v", None, true, 50, None);
        m.record_outcome("v", None, true, 50, None);
        assert_eq!(m.circuit_state("v"), CircuitState::HalfOpen);
        m.record_outcome("v", None, true, 50, None);
        assert_eq!(m.circuit_state("v"), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_with_backoff() {
        let m = monitor(HealthConfig {
            base_open_duration: Duration::from_millis(10),
            ..HealthConfig::default()
        });
        m.record_outcome("v", None, false, 50, Some(ErrorKind::BadCredentials));
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(m.circuit_state("v"), CircuitState::HalfOpen);
        m.record_outcome("v", None, false, 50, Some(ErrorKind::ServerError));
        assert_eq!(m.circuit_state("v"), CircuitState::Open);
    }

    #[test]
    fn exponential_backoff_caps_at_10x() {
        let base = Duration::from_millis(10);
        let m = monitor(HealthConfig {
            base_open_duration: base,
            ..HealthConfig::default()
        });
        // Trip three times in quick succession; the third open duration must
        // be >= 4x and <= 10x the base.
        for _ in 0..3 {
            m.record_outcome("v", None, false, 50, Some(ErrorKind::BadCredentials));
            let doc = m.load_circuit("v");
            if m.counter(&HealthMonitor::trips_key("v")) == 3 {
                let open_for = doc.open_until_ms - now_ms();
                assert!(open_for >= 4 * base.as_millis() as i64 - 5);
                assert!(open_for <= 10 * base.as_millis() as i64 + 5);
            }
            std::thread::sleep(Duration::from_millis(2));
            // Force the open TTL to lapse so the next failure lands half-open.
            let mut doc = m.load_circuit("v");
            doc.open_until_ms = now_ms() - 1;
            m.store_circuit("v", &doc);
        }
        assert_eq!(m.counter(&HealthMonitor::trips_key("v")), 3);
    }

    #[test]
    fn lifecycle_terminal_counts_as_success() {
        let m = monitor(HealthConfig::default());
        for _ in 0..10 {
            m.record_outcome("v", None, false, 50, Some(ErrorKind::LifecycleTerminal));
        }
        assert!(m.is_available("v"));
        assert_eq!(m.success_rate("v", None), Some(1.0));
    }

    #[test]
    fn forced_closed_clears_counters() {
        let m = monitor(HealthConfig::default());
        m.record_outcome("v", None, false, 50, Some(ErrorKind::BadCredentials));
        assert!(!m.is_available("v"));
        m.force_closed("v");
        assert!(m.is_available("v"));
        assert_eq!(m.counter(&HealthMonitor::consec_key("v")), 0);
        assert_eq!(m.counter(&HealthMonitor::trips_key("v")), 0);
    }

    #[test]
    fn forced_open_refuses_traffic_indefinitely() {
        let m = monitor(HealthConfig {
            base_open_duration: Duration::from_millis(1),
            ..HealthConfig::default()
        });
        m.force_open("v");
        std::thread::sleep(Duration::from_millis(5));
        assert!(!m.is_available("v"));
    }

    #[test]
    fn country_facet_is_tracked_separately() {
        let m = monitor(HealthConfig::default());
        m.record_outcome("v", Some("us"), false, 50, Some(ErrorKind::NoStock));
        m.record_outcome("v", Some("in"), true, 50, None);
        let us = m.success_rate("v", Some("us")).unwrap();
        let global = m.success_rate("v", None).unwrap();
        assert!(us < 0.5);
        assert!(global > 0.0 && global < 1.0);
    }
}
