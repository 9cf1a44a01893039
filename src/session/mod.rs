//! WebSocket session: a byte-stream-bound state machine.
//!
//! A session owns one live connection: it runs the reader loop, reassembles
//! fragmented messages, answers pings, keeps the connection alive with
//! periodic pings of its own, serializes concurrent writes and settles the
//! terminal status exactly once.

mod id;
mod status;

pub use self::id::IdAllocator;
pub use self::status::{SessionStats, SessionStatus};

use std::io::{Cursor, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};

use crate::dispatch::CallbackPool;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::frame::{self, Frame};
use crate::protocol::{CloseCode, Control, Data, OpCode, Role};

/// Callback invoked with every complete data message as `(id, opcode, payload)`.
pub type FrameHandler = Arc<dyn Fn(i64, OpCode, Bytes) + Send + Sync>;
/// Callback invoked once when a session leaves `Connected`. The snapshot is
/// present iff statistics were enabled.
pub type DisconnectHandler = Arc<dyn Fn(i64, SessionStatus, Option<SessionStats>) + Send + Sync>;

/// Payload of automatic keep-alive pings.
const KEEP_ALIVE_PAYLOAD: &[u8] = b"Hello";

/// Normalize a keep-alive interval given in seconds: zero disables the
/// timer, everything else is clamped into 25..=120 seconds.
pub fn normalize_ping_interval(seconds: u64) -> Option<Duration> {
    match seconds {
        0 => None,
        s => Some(Duration::from_secs(s.clamp(25, 120))),
    }
}

/// Session configuration, captured once at construction and immutable for
/// the session's lifetime.
#[derive(Default, Clone)]
pub struct SessionConfig {
    /// Update the byte counters and attach a snapshot to the disconnect
    /// callback.
    pub statistics: bool,
    /// Keep-alive ping interval in seconds, see [`normalize_ping_interval`].
    pub ping_interval: u64,
    /// Invoked with every complete data message.
    pub on_frame: Option<FrameHandler>,
    /// Invoked at most once when the session terminates.
    pub on_disconnect: Option<DisconnectHandler>,
    /// Invoked inline for every received frame, control frames included.
    /// The registry hangs its idle-timer reset here.
    pub(crate) on_receive: Option<Arc<dyn Fn(i64) + Send + Sync>>,
}

/// A live WebSocket connection. The handle is cheap to clone; all clones
/// refer to the same connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: i64,
    role: Role,
    config: SessionConfig,
    /// Read half plus any bytes the handshake read past the request head,
    /// taken once by the reader loop.
    reader: Mutex<Option<(Vec<u8>, TcpStream)>>,
    /// Write half. Writes hold this lock for a whole encoded message, so
    /// concurrent writers interleave only at frame boundaries.
    writer: Mutex<TcpStream>,
    state: Mutex<Lifecycle>,
    stop: Mutex<bool>,
    stop_signal: Condvar,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    connected_nano: i64,
    pool: Arc<CallbackPool>,
}

struct Lifecycle {
    status: SessionStatus,
    closed_nano: i64,
}

impl Session {
    /// Bind a session to an upgraded stream. `leftover` holds bytes the
    /// handshake read past the request head; the reader replays them ahead
    /// of the stream. Any handshake deadlines on the socket are cleared.
    pub(crate) fn attach(
        id: i64,
        role: Role,
        stream: TcpStream,
        leftover: Vec<u8>,
        config: SessionConfig,
        pool: Arc<CallbackPool>,
    ) -> Result<Session> {
        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;
        let writer = stream.try_clone()?;
        Ok(Session {
            inner: Arc::new(SessionInner {
                id,
                role,
                config,
                reader: Mutex::new(Some((leftover, stream))),
                writer: Mutex::new(writer),
                state: Mutex::new(Lifecycle {
                    status: SessionStatus::Connected,
                    closed_nano: 0,
                }),
                stop: Mutex::new(false),
                stop_signal: Condvar::new(),
                bytes_read: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
                connected_nano: now_nano(),
                pool,
            }),
        })
    }

    /// Session id; zero for client sessions.
    pub fn id(&self) -> i64 {
        self.inner.id
    }

    /// Whether this is the server or the client end.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Current lifecycle status.
    pub fn status(&self) -> SessionStatus {
        self.inner.state.lock().unwrap().status
    }

    /// Snapshot of counters, timestamps and status.
    pub fn stats(&self) -> SessionStats {
        let state = self.inner.state.lock().unwrap();
        SessionStats {
            id: self.inner.id,
            connected_nano: self.inner.connected_nano,
            closed_nano: state.closed_nano,
            bytes_read: self.inner.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.inner.bytes_written.load(Ordering::Relaxed),
            status: state.status,
            statistics: self.inner.config.statistics,
        }
    }

    /// Run the reader loop until the session terminates. Blocks the calling
    /// thread; the registry and the client run it via [`Session::spawn_reader`].
    pub fn run(&self) {
        let (leftover, stream) = match self.inner.reader.lock().unwrap().take() {
            Some(reader) => reader,
            None => return,
        };
        if !self.status().is_connected() {
            return;
        }

        let keepalive = normalize_ping_interval(self.inner.config.ping_interval)
            .and_then(|interval| self.spawn_keepalive(interval));

        let mut stream = Cursor::new(leftover).chain(stream);
        let mut assembly: Option<(Data, BytesMut)> = None;
        let status = loop {
            if self.stopped() {
                break SessionStatus::Closed(CloseCode::Normal);
            }
            let frame = match frame::read_frame(&mut stream) {
                Ok(frame) => frame,
                Err(err) => {
                    if self.stopped() {
                        break SessionStatus::Closed(CloseCode::Normal);
                    }
                    debug!("session {}: read failed: {}", self.inner.id, err);
                    break SessionStatus::Closed(err.close_code());
                }
            };
            if self.inner.config.statistics {
                self.inner
                    .bytes_read
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
            }
            if let Some(on_receive) = &self.inner.config.on_receive {
                on_receive(self.inner.id);
            }
            match self.accept_frame(frame, &mut assembly) {
                Ok(None) => {}
                Ok(Some(code)) => break SessionStatus::Closed(code),
                Err(err) => {
                    debug!("session {}: dropping connection: {}", self.inner.id, err);
                    break SessionStatus::Closed(err.close_code());
                }
            }
        };
        self.shutdown(status);
        if let Some(handle) = keepalive {
            let _ = handle.join();
        }
    }

    /// Run the reader loop on a dedicated thread.
    pub(crate) fn spawn_reader(&self) {
        let session = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("ws-session-{}", self.inner.id))
            .spawn(move || session.run());
        if let Err(err) = spawned {
            warn!("session {}: failed to spawn reader: {}", self.inner.id, err);
            self.shutdown(SessionStatus::Closed(CloseCode::Error));
        }
    }

    /// Process one received frame. Returns the close code when the peer
    /// closed, `None` to keep reading.
    fn accept_frame(
        &self,
        frame: Frame,
        assembly: &mut Option<(Data, BytesMut)>,
    ) -> Result<Option<CloseCode>> {
        let header = frame.header();
        // MUST be 0 unless an extension is negotiated that defines meanings
        // for non-zero values (RFC 6455 §5.2).
        if header.rsv1 || header.rsv2 || header.rsv3 {
            return Err(Error::Protocol(ProtocolError::NonZeroReservedBits));
        }
        match self.inner.role {
            // A server MUST close the connection upon receiving a frame that
            // is not masked; a client, upon receiving one that is (RFC 6455 §5.1).
            Role::Server if !frame.is_masked() => {
                return Err(Error::Protocol(ProtocolError::UnmaskedFrameFromClient));
            }
            Role::Client if frame.is_masked() => {
                return Err(Error::Protocol(ProtocolError::MaskedFrameFromServer));
            }
            _ => {}
        }

        match frame.opcode() {
            OpCode::Control(ctl) => {
                // Control frames MUST NOT be fragmented and carry at most
                // 125 payload bytes (RFC 6455 §5.5). They pass through an
                // in-progress reassembly untouched.
                if !frame.is_final() {
                    return Err(Error::Protocol(ProtocolError::FragmentedControlFrame));
                }
                if frame.payload().len() > 125 {
                    return Err(Error::Protocol(ProtocolError::ControlFrameTooBig));
                }
                match ctl {
                    Control::Close => Ok(Some(frame.into_close().unwrap_or(CloseCode::Normal))),
                    Control::Ping => {
                        trace!("session {}: ping, echoing pong", self.inner.id);
                        let _ = self.write(
                            OpCode::Control(Control::Pong),
                            frame.into_payload(),
                            None,
                        );
                        Ok(None)
                    }
                    Control::Pong => Ok(None),
                    Control::Reserved(i) => Err(Error::Protocol(ProtocolError::InvalidOpcode(i))),
                }
            }
            OpCode::Data(data) => {
                let is_final = frame.is_final();
                match data {
                    Data::Continue => {
                        match assembly.as_mut() {
                            Some((_, buffer)) => buffer.extend_from_slice(frame.payload()),
                            None => {
                                return Err(Error::Protocol(
                                    ProtocolError::UnexpectedContinueFrame,
                                ));
                            }
                        }
                        if is_final {
                            let (kind, buffer) =
                                assembly.take().expect("Bug: reassembly buffer vanished");
                            self.dispatch_message(OpCode::Data(kind), buffer.freeze());
                        }
                        Ok(None)
                    }
                    kind if assembly.is_some() => {
                        Err(Error::Protocol(ProtocolError::ExpectedFragment(kind)))
                    }
                    kind if is_final => {
                        self.dispatch_message(OpCode::Data(kind), frame.into_payload());
                        Ok(None)
                    }
                    kind => {
                        *assembly = Some((kind, BytesMut::from(frame.payload())));
                        Ok(None)
                    }
                }
            }
        }
    }

    fn dispatch_message(&self, opcode: OpCode, payload: Bytes) {
        if let Some(on_frame) = &self.inner.config.on_frame {
            let on_frame = Arc::clone(on_frame);
            let id = self.inner.id;
            self.inner.pool.execute(move || on_frame(id, opcode, payload));
        }
    }

    /// Write a message. Text and binary payloads fragment automatically at
    /// the frame payload cap; pings and pongs go out as single control
    /// frames with payloads truncated to 125 bytes. Server sessions ignore
    /// `key` and never mask; client sessions mask every frame with `key`
    /// (zero when absent). Returns the number of wire bytes written.
    pub fn write(&self, kind: OpCode, payload: impl Into<Bytes>, key: Option<u32>) -> Result<usize> {
        let payload = payload.into();
        let mask = match self.inner.role {
            Role::Server => None,
            Role::Client => Some(key.unwrap_or(0)),
        };
        let frames = match kind {
            OpCode::Data(kind @ (Data::Text | Data::Binary)) => {
                Frame::fragment(kind, payload, mask)?
            }
            OpCode::Control(Control::Ping) => {
                let mut frame = Frame::ping(payload);
                if let Some(key) = mask {
                    frame.set_mask(key);
                }
                vec![frame]
            }
            OpCode::Control(Control::Pong) => {
                let mut frame = Frame::pong(payload);
                if let Some(key) = mask {
                    frame.set_mask(key);
                }
                vec![frame]
            }
            other => return Err(Error::BadFrameType(other.into())),
        };

        if !self.status().is_connected() {
            return Err(Error::NotConnected);
        }

        let mut buf = Vec::new();
        for frame in &frames {
            frame.encode(&mut buf);
        }
        let written = {
            let mut writer = self.inner.writer.lock().unwrap();
            frame::write_bytes(&mut *writer, &buf)
        };
        match written {
            Ok(len) => {
                if self.inner.config.statistics {
                    self.inner
                        .bytes_written
                        .fetch_add(len as u64, Ordering::Relaxed);
                }
                Ok(len)
            }
            Err(err) => {
                warn!("session {}: write failed: {}", self.inner.id, err);
                self.shutdown(SessionStatus::WriteFailed);
                Err(err)
            }
        }
    }

    /// Close the session with a normal closure (1000).
    pub fn disconnect(&self) {
        self.close_with(CloseCode::Normal);
    }

    /// Write a close frame carrying `code`, then transition the session.
    /// A no-op once the session has left `Connected`.
    pub fn close_with(&self, code: CloseCode) {
        if !self.status().is_connected() {
            return;
        }
        let mut frame = Frame::close(Some(code));
        if self.inner.role == Role::Client {
            frame.set_mask(0);
        }
        let mut buf = Vec::with_capacity(frame.len());
        frame.encode(&mut buf);
        {
            let mut writer = self.inner.writer.lock().unwrap();
            if let Err(err) = frame::write_bytes(&mut *writer, &buf) {
                debug!("session {}: close frame write failed: {}", self.inner.id, err);
            }
        }
        self.shutdown(SessionStatus::Closed(code));
    }

    /// Settle the terminal status. The first caller wins; the disconnect
    /// callback fires at most once. Raises the stop signal so the keep-alive
    /// timer exits and a blocked reader is released by the socket shutdown.
    fn shutdown(&self, status: SessionStatus) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if !state.status.is_connected() {
                return;
            }
            state.status = status;
            state.closed_nano = now_nano();
        }
        {
            let mut stopped = self.inner.stop.lock().unwrap();
            *stopped = true;
        }
        self.inner.stop_signal.notify_all();
        {
            let writer = self.inner.writer.lock().unwrap();
            let _ = writer.shutdown(Shutdown::Both);
        }
        debug!("session {}: {}", self.inner.id, status);

        if let Some(on_disconnect) = &self.inner.config.on_disconnect {
            let on_disconnect = Arc::clone(on_disconnect);
            let id = self.inner.id;
            let stats = self.inner.config.statistics.then(|| self.stats());
            self.inner
                .pool
                .execute(move || on_disconnect(id, status, stats));
        }
    }

    fn stopped(&self) -> bool {
        *self.inner.stop.lock().unwrap()
    }

    fn spawn_keepalive(&self, interval: Duration) -> Option<thread::JoinHandle<()>> {
        let session = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("ws-keepalive-{}", self.inner.id))
            .spawn(move || {
                let inner = &session.inner;
                let mut stopped = inner.stop.lock().unwrap();
                while !*stopped {
                    let (guard, timeout) = inner
                        .stop_signal
                        .wait_timeout(stopped, interval)
                        .unwrap();
                    stopped = guard;
                    if *stopped {
                        break;
                    }
                    if timeout.timed_out() {
                        drop(stopped);
                        trace!("session {}: keep-alive ping", session.inner.id);
                        let _ = session.write(
                            OpCode::Control(Control::Ping),
                            Bytes::from_static(KEEP_ALIVE_PAYLOAD),
                            None,
                        );
                        stopped = inner.stop.lock().unwrap();
                    }
                }
            });
        match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(
                    "session {}: failed to spawn keep-alive timer: {}",
                    self.inner.id, err
                );
                None
            }
        }
    }
}

fn now_nano() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc::channel;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let near = TcpStream::connect(addr).unwrap();
        let (far, _) = listener.accept().unwrap();
        (near, far)
    }

    fn server_session(config: SessionConfig) -> (Session, TcpStream) {
        let (near, far) = socket_pair();
        let session = Session::attach(
            7,
            Role::Server,
            near,
            Vec::new(),
            config,
            CallbackPool::new(2, 64),
        )
        .unwrap();
        (session, far)
    }

    fn encode_masked(frame: &mut Frame, key: u32) -> Vec<u8> {
        frame.set_mask(key);
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        buf
    }

    #[test]
    fn ping_interval_normalization() {
        assert_eq!(normalize_ping_interval(0), None);
        assert_eq!(normalize_ping_interval(1), Some(Duration::from_secs(25)));
        assert_eq!(normalize_ping_interval(25), Some(Duration::from_secs(25)));
        assert_eq!(normalize_ping_interval(60), Some(Duration::from_secs(60)));
        assert_eq!(normalize_ping_interval(500), Some(Duration::from_secs(120)));
    }

    #[test]
    fn write_rejects_non_message_kinds() {
        let (session, _far) = server_session(SessionConfig::default());
        let err = session
            .write(OpCode::Control(Control::Close), Bytes::new(), None)
            .unwrap_err();
        assert!(matches!(err, Error::BadFrameType(8)));
        let err = session
            .write(OpCode::Data(Data::Continue), Bytes::new(), None)
            .unwrap_err();
        assert!(matches!(err, Error::BadFrameType(0)));
    }

    #[test]
    fn server_writes_are_unmasked() {
        let (session, mut far) = server_session(SessionConfig::default());
        // A provided key is discarded on the server side.
        session
            .write(OpCode::Data(Data::Binary), &b"abc"[..], Some(0xdeadbeef))
            .unwrap();
        let mut wire = [0u8; 5];
        far.read_exact(&mut wire).unwrap();
        assert_eq!(wire, [0x82, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn client_writes_are_masked() {
        let (near, mut far) = socket_pair();
        let session = Session::attach(
            0,
            Role::Client,
            near,
            Vec::new(),
            SessionConfig::default(),
            CallbackPool::new(1, 16),
        )
        .unwrap();
        session
            .write(OpCode::Data(Data::Binary), &b"abc"[..], Some(0x01020304))
            .unwrap();
        let mut wire = [0u8; 9];
        far.read_exact(&mut wire).unwrap();
        assert_eq!(&wire[..2], &[0x82, 0x83]);
        assert_eq!(&wire[2..6], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(
            [wire[6] ^ 0x01, wire[7] ^ 0x02, wire[8] ^ 0x03],
            [b'a', b'b', b'c']
        );
    }

    #[test]
    fn ping_is_echoed_as_pong() {
        let (session, mut far) = server_session(SessionConfig::default());
        session.spawn_reader();

        let wire = encode_masked(&mut Frame::ping(&b"Hello"[..]), 0x37fa213d);
        far.write_all(&wire).unwrap();

        let mut reply = [0u8; 7];
        far.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, &[0x8a, 0x05, b'H', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn fragmented_text_dispatches_once_with_initial_opcode() {
        let (dispatched, messages) = channel();
        let config = SessionConfig {
            on_frame: Some(Arc::new(move |id, opcode, payload| {
                dispatched.send((id, opcode, payload)).unwrap();
            })),
            ..SessionConfig::default()
        };
        let (session, mut far) = server_session(config);
        session.spawn_reader();

        for (chunk, opcode, fin) in [
            (&b"and a "[..], OpCode::Data(Data::Text), false),
            (&b"happy new "[..], OpCode::Data(Data::Continue), false),
            (&b"year!"[..], OpCode::Data(Data::Continue), true),
        ] {
            let mut frame = Frame::message(chunk, opcode, fin);
            far.write_all(&encode_masked(&mut frame, 0xfeedface)).unwrap();
        }

        let (id, opcode, payload) = messages.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(id, 7);
        assert_eq!(opcode, OpCode::Data(Data::Text));
        assert_eq!(payload, Bytes::from_static(b"and a happy new year!"));
    }

    #[test]
    fn close_frame_transitions_with_the_carried_code() {
        let (closed, statuses) = channel();
        let config = SessionConfig {
            on_disconnect: Some(Arc::new(move |_, status, _| {
                closed.send(status).unwrap();
            })),
            ..SessionConfig::default()
        };
        let (session, mut far) = server_session(config);
        session.spawn_reader();

        let wire = encode_masked(&mut Frame::close(Some(CloseCode::Normal)), 0x1);
        far.write_all(&wire).unwrap();

        let status = statuses.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status, SessionStatus::Closed(CloseCode::Normal));
        assert_eq!(session.status(), SessionStatus::Closed(CloseCode::Normal));
    }

    #[test]
    fn unmasked_client_frame_drops_the_connection() {
        let (closed, statuses) = channel();
        let config = SessionConfig {
            on_disconnect: Some(Arc::new(move |_, status, _| {
                closed.send(status).unwrap();
            })),
            ..SessionConfig::default()
        };
        let (session, mut far) = server_session(config);
        session.spawn_reader();

        let mut wire = Vec::new();
        Frame::message(&b"oops"[..], OpCode::Data(Data::Binary), true).encode(&mut wire);
        far.write_all(&wire).unwrap();

        let status = statuses.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status, SessionStatus::Closed(CloseCode::Protocol));
    }

    #[test]
    fn disconnect_fires_the_callback_once() {
        let (closed, statuses) = channel();
        let config = SessionConfig {
            statistics: true,
            on_disconnect: Some(Arc::new(move |_, status, stats| {
                closed.send((status, stats)).unwrap();
            })),
            ..SessionConfig::default()
        };
        let (session, _far) = server_session(config);
        session.spawn_reader();

        session.disconnect();
        session.disconnect();
        // Reader teardown racing the explicit disconnect must not re-fire.
        let (status, stats) = statuses.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status, SessionStatus::Closed(CloseCode::Normal));
        let stats = stats.expect("statistics were enabled");
        assert!(stats.closed_nano > 0);
        assert!(
            statuses.recv_timeout(Duration::from_millis(300)).is_err(),
            "disconnect callback fired twice"
        );
    }

    #[test]
    fn write_after_close_fails() {
        let (session, _far) = server_session(SessionConfig::default());
        session.disconnect();
        let err = session
            .write(OpCode::Data(Data::Text), &b"hi"[..], None)
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }
}
