//! A WebSocket (RFC 6455) endpoint library over raw TCP.
//!
//! Three tightly coupled pieces make up the core:
//!
//! - the frame **codec** in [`protocol::frame`]: exact binary
//!   (de)serialization of frames, payload masking, stream-buffer parsing
//!   and automatic fragmentation of oversize messages;
//! - the [`Session`] state machine: one per connection, running the reader
//!   loop with ping/pong and close handling, fragment reassembly, optional
//!   keep-alive pings and traffic counters;
//! - the [`Server`] registry: the process-wide table of server sessions
//!   with HTTP upgrade validation, monotonic id allocation, idle timeouts
//!   and callback dispatch, plus a redialing [`Client`].
#![deny(
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_must_use,
    unused_mut,
    unused_imports,
    unused_import_braces
)]

pub mod client;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod server;
pub mod session;

mod dispatch;

pub use crate::client::{Client, ClientOptions};
pub use crate::error::{Error, Result};
pub use crate::protocol::{CloseCode, Control, Data, Frame, OpCode, Role, PAYLOAD_MAX};
pub use crate::server::{Server, ServerCallbacks};
pub use crate::session::{Session, SessionConfig, SessionStats, SessionStatus};
