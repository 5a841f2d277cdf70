//! Connection state machine.
//!
//! ```text
//!   INIT ──connect──▶ BUSY ──ok──▶ READY ──submit──▶ BUSY
//!                      │  └─fail─▶ ERROR              │
//!                      └──close──▶ ABORT ──unwind──▶ CLOSED
//! ```
//!
//! `INIT`, `READY` and `ERROR` close immediately. `ERROR` and `CLOSED` accept
//! no further operations. The COPY flag ([`CopyMode`]) is orthogonal: a
//! connection is only [`ConnState::is_ready`] in `READY` with no COPY open.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Constructed, connect not yet submitted.
    Init,
    Ready,
    /// Exactly one request is in flight on the worker.
    Busy,
    /// Close requested mid-flight; teardown happens when the worker unwinds.
    Abort,
    Closed,
    /// Connect failed.
    Error,
}

impl ConnState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnState::Init => "INIT",
            ConnState::Ready => "READY",
            ConnState::Busy => "BUSY",
            ConnState::Abort => "ABORT",
            ConnState::Closed => "CLOSED",
            ConnState::Error => "ERROR",
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition(self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (Init, Busy)
                | (Init, Closed)
                | (Ready, Busy)
                | (Ready, Abort)
                | (Ready, Closed)
                | (Busy, Ready)
                | (Busy, Error)
                | (Busy, Abort)
                | (Abort, Closed)
                | (Error, Closed)
        )
    }

    /// No further operations will ever be accepted.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnState::Closed | ConnState::Error)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which COPY direction, if any, is open on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CopyMode {
    #[default]
    None,
    /// Client sends rows (`COPY ... FROM STDIN`).
    In,
    /// Client receives rows (`COPY ... TO STDOUT`).
    Out,
}

impl CopyMode {
    #[inline]
    pub fn in_progress(self) -> bool {
        self != CopyMode::None
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CopyMode::None => "NO_COPY",
            CopyMode::In => "COPY_IN",
            CopyMode::Out => "COPY_OUT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_only_reaches_closed() {
        for next in [
            ConnState::Init,
            ConnState::Ready,
            ConnState::Busy,
            ConnState::Abort,
            ConnState::Error,
        ] {
            assert!(!ConnState::Abort.can_transition(next), "ABORT -> {next}");
        }
        assert!(ConnState::Abort.can_transition(ConnState::Closed));
    }

    #[test]
    fn test_terminal_states_accept_nothing_but_close() {
        assert!(ConnState::Error.is_terminal());
        assert!(ConnState::Closed.is_terminal());
        assert!(!ConnState::Error.can_transition(ConnState::Busy));
        assert!(!ConnState::Closed.can_transition(ConnState::Busy));
        assert!(!ConnState::Closed.can_transition(ConnState::Closed));
    }

    #[test]
    fn test_busy_cannot_start_another_request() {
        assert!(!ConnState::Busy.can_transition(ConnState::Busy));
        assert!(ConnState::Ready.can_transition(ConnState::Busy));
    }

    #[test]
    fn test_copy_mode_flag() {
        assert!(!CopyMode::default().in_progress());
        assert!(CopyMode::In.in_progress());
        assert_eq!(CopyMode::Out.as_str(), "COPY_OUT");
    }
}
