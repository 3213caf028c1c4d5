use panewatch_core::PaneBatch;

/// Notifications broadcast by a `RemoteSession` to its subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    /// Decoded shell output, in arrival order.
    Output(String),
    /// The shell reader of `generation` lost its stream.
    Disconnected { generation: u64, reason: String },
    Reconnecting { attempt: u32, max_attempts: u32 },
    Reconnected,
    ReconnectFailed { message: String },
    /// Explicit disconnect finished tearing the session down.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Fresh(PaneBatch),
    /// Another batch poll was already in flight.
    Skipped,
}
