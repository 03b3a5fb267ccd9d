//! Prometheus metrics for vendor health.
//!
//! Exposed in text exposition format via the operational HTTP endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Hand-rolled registry: gauges for success rate, circuit status and average
/// latency, counters for request outcomes.
#[derive(Debug, Default)]
pub struct HealthMetrics {
    /// Decayed success rate per vendor (0.0-1.0).
    success_rate: RwLock<HashMap<String, f64>>,
    /// Circuit status per vendor: 0 closed, 1 open, 2 half-open.
    circuit_status: RwLock<HashMap<String, u8>>,
    /// Rolling average request latency per vendor (ms).
    avg_latency_ms: RwLock<HashMap<String, f64>>,

    request_total: RwLock<HashMap<String, AtomicU64>>,
    request_success: RwLock<HashMap<String, AtomicU64>>,
    circuit_open_total: RwLock<HashMap<String, AtomicU64>>,
}

impl HealthMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_success_rate(&self, vendor: &str, rate: f64) {
        self.success_rate.write().insert(vendor.to_string(), rate);
    }

    pub fn set_circuit_status(&self, vendor: &str, status: u8) {
        self.circuit_status
            .write()
            .insert(vendor.to_string(), status);
    }

    pub fn set_avg_latency(&self, vendor: &str, latency_ms: f64) {
        self.avg_latency_ms
            .write()
            .insert(vendor.to_string(), latency_ms);
    }

    pub fn record_request(&self, vendor: &str, success: bool) {
        {
            let mut total = self.request_total.write();
            total
                .entry(vendor.to_string())
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(1, Ordering::Relaxed);
        }
        if success {
            let mut ok = self.request_success.write();
            ok.entry(vendor.to_string())
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_circuit_open(&self, vendor: &str) {
        let mut opens = self.circuit_open_total.write();
        opens
            .entry(vendor.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Export all metrics in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP provider_success_rate Decayed vendor success rate (0-1)\n");
        output.push_str("# TYPE provider_success_rate gauge\n");
        for (vendor, rate) in self.success_rate.read().iter() {
            output.push_str(&format!(
                "provider_success_rate{{vendor=\"{}\"}} {:.4}\n",
                vendor, rate
            ));
        }

        output.push_str("\n# HELP provider_circuit_status 0=closed 1=open 2=half-open\n");
        output.push_str("# TYPE provider_circuit_status gauge\n");
        for (vendor, status) in self.circuit_status.read().iter() {
            output.push_str(&format!(
                "provider_circuit_status{{vendor=\"{}\"}} {}\n",
                vendor, status
            ));
        }

        output.push_str("\n# HELP provider_avg_latency_ms Average request latency\n");
        output.push_str("# TYPE provider_avg_latency_ms gauge\n");
        for (vendor, latency) in self.avg_latency_ms.read().iter() {
            output.push_str(&format!(
                "provider_avg_latency_ms{{vendor=\"{}\"}} {:.1}\n",
                vendor, latency
            ));
        }

        output.push_str("\n# HELP provider_request_total Vendor requests attempted\n");
        output.push_str("# TYPE provider_request_total counter\n");
        for (vendor, count) in self.request_total.read().iter() {
            output.push_str(&format!(
                "provider_request_total{{vendor=\"{}\"}} {}\n",
                vendor,
                count.load(Ordering::Relaxed)
            ));
        }

        output.push_str("\n# HELP provider_request_success_total Vendor requests succeeded\n");
        output.push_str("# TYPE provider_request_success_total counter\n");
        for (vendor, count) in self.request_success.read().iter() {
            output.push_str(&format!(
                "provider_request_success_total{{vendor=\"{}\"}} {}\n",
                vendor,
                count.load(Ordering::Relaxed)
            ));
        }

        output.push_str("\n# HELP provider_circuit_open_total Circuit open transitions\n");
        output.push_str("# TYPE provider_circuit_open_total counter\n");
        for (vendor, count) in self.circuit_open_total.read().iter() {
            output.push_str(&format!(
                "provider_circuit_open_total{{vendor=\"{}\"}} {}\n",
                vendor,
                count.load(Ordering::Relaxed)
            ));
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_export_contains_series() {
        let m = HealthMetrics::new();
        m.set_success_rate("sms-hub", 0.93);
        m.set_circuit_status("sms-hub", 0);
        m.set_avg_latency("sms-hub", 412.5);
        m.record_request("sms-hub", true);
        m.record_request("sms-hub", false);
        m.record_circuit_open("sms-hub");

        let out = m.to_prometheus();
        assert!(out.contains("provider_success_rate{vendor=\"sms-hub\"} 0.9300"));
        assert!(out.contains("provider_circuit_status{vendor=\"sms-hub\"} 0"));
        assert!(out.contains("provider_request_total{vendor=\"sms-hub\"} 2"));
        assert!(out.contains("provider_request_success_total{vendor=\"sms-hub\"} 1"));
        assert!(out.contains("provider_circuit_open_total{vendor=\"sms-hub\"} 1"));
    }
}
