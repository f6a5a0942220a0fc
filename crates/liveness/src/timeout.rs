use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Samples kept per device. Small on purpose: the estimator should track
/// the link's current behavior, not its whole history (the long-run signal
/// lives in the health scorer).
const WINDOW_SIZE: usize = 8;

/// Bounds for the adaptive timeout.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    pub base: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(90),
            min: Duration::from_secs(30),
            max: Duration::from_secs(300),
        }
    }
}

/// Per-device inactivity timeout computed from observed round-trip latency.
///
/// A device on a high-latency link should not be marked offline merely
/// because its heartbeats round-trip slowly, while a healthy low-latency
/// device should be detected as dead quickly. The timeout is
/// `base + 2 × avg(window)`, clamped to `[min, max]`.
#[derive(Debug)]
pub struct AdaptiveTimeout {
    config: TimeoutConfig,
    windows: HashMap<String, VecDeque<Duration>>,
}

impl AdaptiveTimeout {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    /// Records one observed heartbeat round trip. Oldest sample evicted
    /// once the window is full.
    pub fn record_round_trip(&mut self, device_id: &str, latency: Duration) {
        let window = self.windows.entry(device_id.to_owned()).or_default();
        if window.len() == WINDOW_SIZE {
            window.pop_front();
        }
        window.push_back(latency);
    }

    /// Inactivity timeout for the device. Devices with no samples use the
    /// unmodified base timeout (still clamped).
    pub fn timeout_for(&self, device_id: &str) -> Duration {
        let raw = match self.windows.get(device_id).filter(|w| !w.is_empty()) {
            Some(window) => {
                let avg = window.iter().sum::<Duration>() / window.len() as u32;
                self.config.base + 2 * avg
            }
            None => self.config.base,
        };
        raw.clamp(self.config.min, self.config.max)
    }

    pub fn forget(&mut self, device_id: &str) {
        self.windows.remove(device_id);
    }
}
