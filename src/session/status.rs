use std::fmt;

use crate::protocol::CloseCode;

/// Lifecycle status of a session.
///
/// Wire close codes and lifecycle states are deliberately separate types:
/// only the [`CloseCode`] inside [`SessionStatus::Closed`] ever appears on
/// the wire, the remaining variants are internal to the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// A client that has not dialed yet.
    ClientCreate,
    /// A client between reconnect attempts.
    ClientReconnect,
    /// The connection is live.
    Connected,
    /// A client dial attempt failed.
    ConnectFailed,
    /// The connection closed with the given wire close code.
    Closed(CloseCode),
    /// The keep-alive deadline passed without traffic.
    HeartbeatTimeout,
    /// Writing to the underlying stream failed.
    WriteFailed,
}

impl SessionStatus {
    /// Tell if the session can carry traffic.
    pub fn is_connected(self) -> bool {
        matches!(self, SessionStatus::Connected)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            SessionStatus::ClientCreate => write!(f, "client created"),
            SessionStatus::ClientReconnect => write!(f, "client reconnecting"),
            SessionStatus::Connected => write!(f, "connected"),
            SessionStatus::ConnectFailed => write!(f, "connect failed"),
            SessionStatus::Closed(code) => write!(f, "closed ({})", code),
            SessionStatus::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            SessionStatus::WriteFailed => write!(f, "write failed"),
        }
    }
}

/// Immutable snapshot of a session's counters, timestamps and status,
/// produced at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Session id; zero for client sessions.
    pub id: i64,
    /// Wall-clock nanoseconds at connection time.
    pub connected_nano: i64,
    /// Wall-clock nanoseconds at close time; zero while connected.
    pub closed_nano: i64,
    /// Wire bytes received, counted when statistics are enabled.
    pub bytes_read: u64,
    /// Wire bytes sent, counted when statistics are enabled.
    pub bytes_written: u64,
    /// Lifecycle status at snapshot time.
    pub status: SessionStatus,
    /// Whether the byte counters were being updated.
    pub statistics: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connected_carries_traffic() {
        assert!(SessionStatus::Connected.is_connected());
        assert!(!SessionStatus::ClientCreate.is_connected());
        assert!(!SessionStatus::Closed(CloseCode::Normal).is_connected());
        assert!(!SessionStatus::WriteFailed.is_connected());
    }

    #[test]
    fn display_names_the_code() {
        let status = SessionStatus::Closed(CloseCode::Policy);
        assert_eq!(status.to_string(), "closed (1008)");
    }
}
