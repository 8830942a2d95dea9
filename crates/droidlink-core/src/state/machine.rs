//! Connection state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Authoritative connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    WaitingPermission,
    Connected,
    PermissionDenied,
    Timeout,
    ConnectionLost,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Authenticating => write!(f, "authenticating"),
            ConnectionState::WaitingPermission => write!(f, "waiting_permission"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::PermissionDenied => write!(f, "permission_denied"),
            ConnectionState::Timeout => write!(f, "timeout"),
            ConnectionState::ConnectionLost => write!(f, "connection_lost"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

impl ConnectionState {
    /// The last attempt ended in failure.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ConnectionState::PermissionDenied
                | ConnectionState::Timeout
                | ConnectionState::ConnectionLost
                | ConnectionState::Error
        )
    }

    /// Whether moving to `to` is a legal transition.
    ///
    /// Failure states and `disconnected` are reachable from anywhere;
    /// progress only moves forward through an attempt.
    pub fn can_transition_to(&self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        if to.is_failure() || to == Disconnected {
            return true;
        }
        match (self, to) {
            (Disconnected | PermissionDenied | Timeout | ConnectionLost | Error, Connecting) => {
                true
            }
            (Connecting, Authenticating | WaitingPermission | Connected) => true,
            (WaitingPermission, Connecting | Authenticating | Connected) => true,
            (Authenticating, Connecting | Connected) => true,
            (Connected, Connecting) => true,
            (from, to) => *from == to,
        }
    }
}

/// State plus the message/details pair shown to the user.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub state: ConnectionState,
    /// Short, human-readable message for failure states.
    pub message: Option<String>,
    /// Longer remediation text.
    pub details: Option<String>,
}

impl ConnectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move to `to`, clearing messages. Returns the previous state.
    pub fn goto_state(&mut self, to: ConnectionState) -> ConnectionState {
        let from = self.state;
        if !from.can_transition_to(to) {
            tracing::warn!(from = %from, to = %to, "Unexpected state transition");
        }
        tracing::info!(from = %from, to = %to, "State transition");
        self.state = to;
        self.message = None;
        self.details = None;
        from
    }

    /// Move to a failure state carrying a message and details.
    pub fn fail(
        &mut self,
        to: ConnectionState,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> ConnectionState {
        let from = self.goto_state(to);
        self.message = Some(message.into());
        self.details = Some(details.into());
        from
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
