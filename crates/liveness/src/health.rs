use std::collections::HashMap;

/// Latency at or beyond which the latency component of the score is zero.
const LATENCY_FLOOR_MS: f64 = 5000.0;

/// Weight of the success-rate component.
const SUCCESS_WEIGHT: f64 = 0.7;

/// Weight of the latency component.
const LATENCY_WEIGHT: f64 = 0.3;

#[derive(Debug, Default)]
struct DeviceStats {
    attempts: u64,
    successes: u64,
    latency_sum_ms: u64,
    latency_count: u64,
}

impl DeviceStats {
    fn score(&self) -> f64 {
        if self.attempts == 0 {
            return 1.0;
        }
        let success_rate = self.successes as f64 / self.attempts as f64;
        let latency_component = if self.latency_count == 0 {
            1.0
        } else {
            let avg = self.latency_sum_ms as f64 / self.latency_count as f64;
            (1.0 - avg / LATENCY_FLOOR_MS).max(0.0)
        };
        SUCCESS_WEIGHT * success_rate + LATENCY_WEIGHT * latency_component
    }
}

/// Rolling success/failure/latency reputation per device.
///
/// Unbounded counters over all recorded attempts: this is a long-run
/// signal for operational tooling, distinct from the short-window latency
/// estimator that tunes timeouts. A low score never forces an offline
/// transition; it is surfaced through the unhealthy-devices query only.
#[derive(Debug, Default)]
pub struct HealthScorer {
    devices: HashMap<String, DeviceStats>,
}

impl HealthScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one heartbeat round-trip attempt. Latency is only counted
    /// for successful attempts that measured one.
    pub fn record(&mut self, device_id: &str, success: bool, latency_ms: Option<u64>) {
        let stats = self.devices.entry(device_id.to_owned()).or_default();
        stats.attempts += 1;
        if success {
            stats.successes += 1;
        }
        if let Some(ms) = latency_ms {
            stats.latency_sum_ms += ms;
            stats.latency_count += 1;
        }
    }

    /// Score in `[0, 1]`. Devices with no recorded attempts score 1.0.
    pub fn score(&self, device_id: &str) -> f64 {
        self.devices.get(device_id).map_or(1.0, DeviceStats::score)
    }

    /// Devices scoring strictly below the threshold, worst first.
    pub fn unhealthy(&self, threshold: f64) -> Vec<(String, f64)> {
        let mut out: Vec<(String, f64)> = self
            .devices
            .iter()
            .map(|(id, stats)| (id.clone(), stats.score()))
            .filter(|(_, score)| *score < threshold)
            .collect();
        out.sort_by(|a, b| a.1.total_cmp(&b.1));
        out
    }

    pub fn forget(&mut self, device_id: &str) {
        self.devices.remove(device_id);
    }
}
