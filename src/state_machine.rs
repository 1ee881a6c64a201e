//! Session lifecycle states and the legal transitions between them.
//!
//! The state is owned exclusively by the session controller; everything
//! else observes it read-only.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session; devices and transport are not held.
    Idle,
    /// Devices acquired, transport handshake in flight.
    Connecting,
    /// Full duplex audio is flowing.
    Open,
    /// Teardown in progress.
    Closing,
    /// Clean end of session. Terminal.
    Closed,
    /// Device acquisition or connect failed; resources already released.
    /// Terminal: restarting takes a brand-new controller.
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Whether moving to `next` is a legal lifecycle transition.
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Connecting) => true,
            (Connecting, Open) => true,
            (Connecting, Failed) => true,
            (Connecting, Closing) => true,
            (Open, Closing) => true,
            (Open, Failed) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }
}
