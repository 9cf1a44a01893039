//! WebSocket protocol types: frames, opcodes, close codes.

pub mod frame;

pub use self::frame::coding::{CloseCode, Control, Data, OpCode};
pub use self::frame::{Frame, FrameHeader, PAYLOAD_MAX};

/// Indicates a Client or Server role of the websocket.
///
/// The role decides the masking direction: a client masks every outgoing
/// frame, a server never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This socket is a server.
    Server,
    /// This socket is a client.
    Client,
}
