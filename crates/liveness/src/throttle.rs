use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Sliding window length for the probe rate limit.
const WINDOW: Duration = Duration::from_secs(60);

/// Per-device rate limiter bounding outbound liveness probes.
///
/// Keeps a sliding one-minute window of probe timestamps per device. When
/// many devices go marginal at once (a brief network blip), unthrottled
/// probing would amplify the blip into a self-inflicted overload; this
/// caps each device at a configured probes-per-minute.
#[derive(Debug)]
pub struct PingThrottle {
    max_per_minute: usize,
    windows: HashMap<String, VecDeque<Instant>>,
}

impl PingThrottle {
    pub fn new(max_per_minute: usize) -> Self {
        Self {
            max_per_minute,
            windows: HashMap::new(),
        }
    }

    /// Returns `true` and records the probe if the device is under its
    /// per-minute cap; returns `false` with no side effect otherwise.
    pub fn can_probe(&mut self, device_id: &str) -> bool {
        self.can_probe_at(device_id, Instant::now())
    }

    fn can_probe_at(&mut self, device_id: &str, now: Instant) -> bool {
        let window = self.windows.entry(device_id.to_owned()).or_default();
        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) >= WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= self.max_per_minute {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Drops the window for a device (e.g. when it is removed from the fleet).
    pub fn forget(&mut self, device_id: &str) {
        self.windows.remove(device_id);
    }
}
