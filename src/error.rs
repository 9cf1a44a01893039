//! Error handling.

mod capacity_error;
mod protocol_error;
mod url_error;

pub use self::capacity_error::CapacityError;
pub use self::protocol_error::ProtocolError;
pub use self::url_error::UrlError;

use std::io;
use std::str;

use thiserror::Error;

use crate::protocol::CloseCode;

/// Result type of all WebSocket library calls.
pub type Result<T> = std::result::Result<T, Error>;

/// Possible WebSocket errors.
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection closed normally. This informs you of the closure.
    /// It's not an error as such and nothing wrong happened.
    #[error("Connection closed normally")]
    ConnectionClosed,
    /// Input-output error. Apart from `WouldBlock`, these are generally
    /// errors with the underlying connection and you should probably
    /// consider them fatal.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Buffer capacity exhausted.
    #[error("Space limit exceeded: {0}")]
    Capacity(#[from] CapacityError),
    /// Protocol violation.
    #[error("WebSocket protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// UTF coding error.
    #[error("UTF-8 encoding error: {0}")]
    Utf8(#[from] str::Utf8Error),
    /// Invalid URL.
    #[error("URL error: {0}")]
    Url(#[from] UrlError),
    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(u16),
    /// HTTP format error.
    #[error("HTTP format error: {0}")]
    HttpFormat(#[from] http::Error),
    /// The handshake check hook rejected the upgrade request.
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),
    /// Writes only accept text, binary, ping and pong frames.
    #[error("Invalid frame type for write: {0}")]
    BadFrameType(u8),
    /// The session is not connected.
    #[error("Session is not connected")]
    NotConnected,
    /// The client has already dialed; dialing is only valid in the created state.
    #[error("Client has already dialed")]
    AlreadyDialed,
    /// No registered session under the given id.
    #[error("Not found session with id {0}")]
    SessionNotFound(i64),
}

impl Error {
    /// The close code a connection answers with when it fails on this error:
    /// I/O failures map to 1001 (the peer went away mid-frame), capacity
    /// overruns to 1009, bad payload data to 1007 and protocol violations
    /// to 1002.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Error::ConnectionClosed => CloseCode::Normal,
            Error::Io(_) => CloseCode::Away,
            Error::Capacity(_) => CloseCode::Size,
            Error::Protocol(_) => CloseCode::Protocol,
            Error::Utf8(_) => CloseCode::Invalid,
            _ => CloseCode::Error,
        }
    }
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Self {
        match err {
            httparse::Error::TooManyHeaders => Error::Capacity(CapacityError::TooManyHeaders),
            e => Error::Protocol(ProtocolError::HttparseError(e)),
        }
    }
}
