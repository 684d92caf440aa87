use serde::{Deserialize, Serialize};

use crate::consumption::{ConsumptionPhase, SubStream};

/// Connection lifecycle of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    /// The link dropped and the session is reconnecting.
    Reconnecting,
    Closed,
}

/// Session events fanned out to observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        state: SessionState,
    },
    /// A connect attempt failed. Recoverable failures are retried.
    ConnectAttemptFailed {
        attempt: u32,
        code: String,
        message: String,
    },
    ConsumptionChanged {
        sub_stream: SubStream,
        phase: ConsumptionPhase,
    },
    TokenPushed,
}
