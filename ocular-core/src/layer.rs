//! Transport-automata building blocks shared by every protocol layer.
//!
//! Each layer in the chain (framer, negotiator, MCS, security, channel
//! multiplexer) embeds a [`LayerState`] and drives it through validated
//! transitions. Out-of-order events are protocol violations, not panics.
//!
//! ```text
//!  Idle ──► Connecting ──► Connected ──► Closing ──► Closed
//!    │           │              │                       ▲
//!    └───────────┴──────────────┴───────────────────────┘
//!                    (fault: any state may close)
//! ```

use crate::error::OcularError;

// ── LayerState ───────────────────────────────────────────────────

/// The lifecycle state of one layer in the transport chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayerState {
    /// Created during stack assembly; no I/O yet. Initial state.
    #[default]
    Idle,

    /// This layer's own handshake is in flight.
    Connecting,

    /// Handshake complete; data flows through this layer.
    Connected,

    /// Orderly shutdown in progress.
    Closing,

    /// Terminal. Entered exactly once, from any state.
    Closed,
}

impl std::fmt::Display for LayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
        };
        write!(f, "{name}")
    }
}

impl LayerState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Begin this layer's handshake.
    ///
    /// Valid from: `Idle`.
    pub fn begin_connect(&mut self) -> Result<(), OcularError> {
        match self {
            Self::Idle => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(OcularError::ProtocolViolation(
                "cannot connect: layer not Idle",
            )),
        }
    }

    /// Mark the handshake complete.
    ///
    /// Valid from: `Connecting`.
    pub fn complete_connect(&mut self) -> Result<(), OcularError> {
        match self {
            Self::Connecting => {
                *self = Self::Connected;
                Ok(())
            }
            _ => Err(OcularError::ProtocolViolation(
                "cannot complete connect: layer not Connecting",
            )),
        }
    }

    /// Begin an orderly shutdown.
    ///
    /// Valid from: `Connecting`, `Connected`.
    pub fn begin_close(&mut self) -> Result<(), OcularError> {
        match self {
            Self::Connecting | Self::Connected => {
                *self = Self::Closing;
                Ok(())
            }
            _ => Err(OcularError::ProtocolViolation(
                "cannot close: layer not active",
            )),
        }
    }

    /// Force the terminal state from anywhere. Used on protocol
    /// violations and transport faults; always succeeds.
    pub fn force_close(&mut self) {
        *self = Self::Closed;
    }

    /// Require `Connected`, otherwise report a protocol violation.
    pub fn expect_connected(&self, what: &'static str) -> Result<(), OcularError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(OcularError::ProtocolViolation(what))
        }
    }
}

// ── CloseGuard ───────────────────────────────────────────────────

/// Ensures close-side effects run exactly once per connection.
///
/// Closure can be initiated from either end of the chain (a framing
/// error below, a user close above); whichever path reaches the guard
/// first wins and the other becomes a no-op.
#[derive(Debug, Default)]
pub struct CloseGuard {
    closed: bool,
}

impl CloseGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time it is called, `false` afterwards.
    pub fn enter(&mut self) -> bool {
        !std::mem::replace(&mut self.closed, true)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_lifecycle() {
        let mut state = LayerState::Idle;
        state.begin_connect().unwrap();
        assert_eq!(state, LayerState::Connecting);
        state.complete_connect().unwrap();
        assert!(state.is_connected());
        state.begin_close().unwrap();
        assert_eq!(state, LayerState::Closing);
        state.force_close();
        assert!(state.is_closed());
    }

    #[test]
    fn invalid_transitions_rejected() {
        let mut state = LayerState::Idle;
        assert!(state.complete_connect().is_err());
        assert!(state.begin_close().is_err());

        let mut state = LayerState::Connected;
        assert!(state.begin_connect().is_err());
    }

    #[test]
    fn force_close_from_any_state() {
        for mut state in [
            LayerState::Idle,
            LayerState::Connecting,
            LayerState::Connected,
            LayerState::Closing,
            LayerState::Closed,
        ] {
            state.force_close();
            assert!(state.is_closed());
        }
    }

    #[test]
    fn close_guard_fires_once() {
        let mut guard = CloseGuard::new();
        assert!(guard.enter());
        assert!(!guard.enter());
        assert!(!guard.enter());
        assert!(guard.is_closed());
    }

    #[test]
    fn display_format() {
        assert_eq!(LayerState::Idle.to_string(), "Idle");
        assert_eq!(LayerState::Closed.to_string(), "Closed");
    }
}
