//! Connection lifecycle shared by hub and agent.
//!
//! One finite-state-machine definition drives both sides of the link so
//! the two binaries cannot drift apart on protocol-level agreement: the
//! hub never marks a device online before its first application frame,
//! and the agent never considers itself connected before the hub's first
//! frame. Both sides agree on a single confirmed instant instead of
//! racing on local socket-open events.

pub mod backoff;
pub mod fsm;

pub use backoff::{BackoffConfig, ReconnectDelay, ReconnectSchedule};
pub use fsm::{LinkEvent, LinkState, transition};
