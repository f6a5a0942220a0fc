//! Per-device liveness primitives for the FleetLink hub.
//!
//! Three independent, purely synchronous state machines: a probe rate
//! limiter, an adaptive inactivity-timeout estimator, and a long-run
//! health score. The hub owns one instance of each; none of them do I/O.

pub mod health;
pub mod throttle;
pub mod timeout;

pub use health::HealthScorer;
pub use throttle::PingThrottle;
pub use timeout::{AdaptiveTimeout, TimeoutConfig};
