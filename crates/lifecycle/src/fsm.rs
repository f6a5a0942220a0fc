/// State of one side of a hub-agent link.
///
/// The hub's view of an inbound connection starts at `AwaitingConfirm`
/// (the transport is already open when it learns about it) and never
/// enters `Connecting` or `Backoff`. The agent walks the full cycle
/// `Idle -> Connecting -> AwaitingConfirm -> Active -> Closed -> Backoff
/// -> Connecting`. Everything in between is common to both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not started (agent only).
    Idle,
    /// Transport dial in progress (agent only).
    Connecting,
    /// Transport open, no application frame seen yet. Neither side treats
    /// the link as live in this state — confirmation before liveness.
    AwaitingConfirm,
    /// Confirmed and exchanging heartbeats.
    Active,
    /// Silent beyond the warning threshold; probing rather than closing.
    Degraded,
    /// Torn down. Terminal for the hub; the agent moves on to `Backoff`.
    Closed,
    /// Waiting out a reconnect delay (agent only).
    Backoff,
}

/// Inputs to the lifecycle machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Dial started (agent).
    DialStarted,
    /// Transport handshake completed.
    TransportOpened,
    /// Any application-level frame arrived. This is the confirmation
    /// signal and also what heals a degraded link.
    FrameReceived,
    /// Silence past the warning threshold (half the adaptive timeout).
    SilenceWarning,
    /// Silence past two heartbeat intervals: the link is dead.
    SilenceTimeout,
    /// Transport open but zero frames ever received within the confirm
    /// window. Distinct from ordinary silence: the handshake itself failed.
    ConfirmTimeout,
    /// Transport closed. `normal` is true for a clean close (code 1000).
    TransportClosed { normal: bool },
    /// Backoff delay elapsed (agent).
    BackoffElapsed,
}

/// The single transition function both binaries share.
///
/// Returns `None` when the event is not meaningful in the given state;
/// callers ignore such events rather than treating them as errors.
pub fn transition(state: LinkState, event: LinkEvent) -> Option<LinkState> {
    use LinkEvent::*;
    use LinkState::*;

    match (state, event) {
        (Idle, DialStarted) => Some(Connecting),
        (Connecting, TransportOpened) => Some(AwaitingConfirm),
        (Connecting, TransportClosed { .. }) => Some(Backoff),

        (AwaitingConfirm, FrameReceived) => Some(Active),
        (AwaitingConfirm, ConfirmTimeout) => Some(Closed),
        (AwaitingConfirm, TransportClosed { .. }) => Some(Closed),

        (Active, FrameReceived) => Some(Active),
        (Active, SilenceWarning) => Some(Degraded),
        (Active, SilenceTimeout) => Some(Closed),
        (Active, TransportClosed { .. }) => Some(Closed),

        (Degraded, FrameReceived) => Some(Active),
        (Degraded, SilenceTimeout) => Some(Closed),
        (Degraded, TransportClosed { .. }) => Some(Closed),

        (Closed, BackoffElapsed) => None,
        (Closed, DialStarted) => Some(Connecting),

        (Backoff, BackoffElapsed) => Some(Connecting),

        _ => None,
    }
}

impl LinkState {
    /// `true` once the link has been confirmed by an application frame and
    /// is not torn down. `Degraded` still counts: liveness demotion is the
    /// reconciler's call, not the transport's.
    pub fn is_confirmed(&self) -> bool {
        matches!(self, LinkState::Active | LinkState::Degraded)
    }
}
