//! Command dispatch with an offline queue.
//!
//! Operator commands targeting unreachable devices are parked in a
//! per-device priority queue and drained as devices reconnect. Delivery
//! is at-least-once: an acknowledgement lost in transit causes a
//! re-delivery, so agents must treat commands as idempotent or carry
//! their own dedup key.

pub mod dispatcher;
pub mod queue;

pub use dispatcher::{DeliveryPort, DispatchEvent, Dispatcher, DispatcherConfig};
pub use queue::{CommandQueue, QueuedCommand};
