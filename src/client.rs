//! Methods to connect to a WebSocket server as a client.
//!
//! A [`Client`] owns at most one session at a time. After an abnormal
//! disconnect it redials on an interval until it succeeds or runs out of
//! attempts; a normal closure returns it to the created state.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use log::{debug, warn};
use url::Url;

use crate::dispatch::CallbackPool;
use crate::error::{Error, Result, UrlError};
use crate::handshake::client as handshake;
use crate::protocol::{CloseCode, OpCode, Role};
use crate::session::{
    DisconnectHandler, FrameHandler, Session, SessionConfig, SessionStats, SessionStatus,
};

/// Callback invoked after a successful dial.
pub type ClientConnectedHandler = Arc<dyn Fn() + Send + Sync>;
/// Callback invoked when the client's session terminates. The snapshot is
/// present iff statistics were enabled.
pub type ClientDisconnectHandler = Arc<dyn Fn(SessionStatus, Option<SessionStats>) + Send + Sync>;
/// Callback invoked with every complete data message.
pub type MessageHandler = Arc<dyn Fn(OpCode, Bytes) + Send + Sync>;

/// Client configuration.
#[derive(Clone)]
pub struct ClientOptions {
    /// Redial attempts after an abnormal disconnect: negative disables
    /// reconnecting, zero retries without bound, positive bounds the number
    /// of attempts. Default 5.
    pub reconnect_max: i32,
    /// Seconds between redial attempts, at least 1. Default 5.
    pub reconnect_interval: u64,
    /// Seconds allowed for connecting and completing the handshake; values
    /// outside 3..=60 fall back to the default of 10.
    pub request_timeout: u64,
    /// Keep-alive ping interval in seconds, zero disables.
    /// See [`crate::session::normalize_ping_interval`].
    pub ping_interval: u64,
    /// Enable traffic statistics on the session.
    pub statistics: bool,
    /// Extra headers sent with the upgrade request.
    pub headers: HeaderMap,
    /// Invoked after each successful dial.
    pub on_connected: Option<ClientConnectedHandler>,
    /// Invoked when the session terminates.
    pub on_disconnect: Option<ClientDisconnectHandler>,
    /// Invoked with every complete data message.
    pub on_message: Option<MessageHandler>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            reconnect_max: 5,
            reconnect_interval: 5,
            request_timeout: 10,
            ping_interval: 0,
            statistics: false,
            headers: HeaderMap::new(),
            on_connected: None,
            on_disconnect: None,
            on_message: None,
        }
    }
}

impl ClientOptions {
    /// Set the reconnect policy, see [`ClientOptions::reconnect_max`] and
    /// [`ClientOptions::reconnect_interval`].
    pub fn reconnect(mut self, max_attempts: i32, interval_seconds: u64) -> Self {
        self.reconnect_max = max_attempts;
        self.reconnect_interval = interval_seconds;
        self
    }

    /// Set the dial/handshake timeout in seconds.
    pub fn request_timeout(mut self, seconds: u64) -> Self {
        self.request_timeout = seconds;
        self
    }

    /// Set the keep-alive ping interval in seconds.
    pub fn ping_interval(mut self, seconds: u64) -> Self {
        self.ping_interval = seconds;
        self
    }

    /// Enable traffic statistics.
    pub fn statistics(mut self, enabled: bool) -> Self {
        self.statistics = enabled;
        self
    }

    /// Add an extra upgrade request header.
    pub fn header(mut self, name: http::header::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the connected callback.
    pub fn on_connected(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(callback));
        self
    }

    /// Set the disconnect callback.
    pub fn on_disconnect(
        mut self,
        callback: impl Fn(SessionStatus, Option<SessionStats>) + Send + Sync + 'static,
    ) -> Self {
        self.on_disconnect = Some(Arc::new(callback));
        self
    }

    /// Set the message callback.
    pub fn on_message(
        mut self,
        callback: impl Fn(OpCode, Bytes) + Send + Sync + 'static,
    ) -> Self {
        self.on_message = Some(Arc::new(callback));
        self
    }

    fn normalized(mut self) -> Self {
        if self.reconnect_interval < 1 {
            self.reconnect_interval = 5;
        }
        if !(3..=60).contains(&self.request_timeout) {
            self.request_timeout = 10;
        }
        self
    }
}

/// A WebSocket client holding a single session, with automatic pong replies
/// and optional keep-alive pings and reconnecting.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    options: ClientOptions,
    state: Mutex<ClientState>,
    pool: Arc<CallbackPool>,
}

struct ClientState {
    status: SessionStatus,
    session: Option<Session>,
    url: Option<Url>,
}

impl Client {
    /// Build a client; intervals and timeouts outside their valid ranges
    /// fall back to defaults.
    pub fn new(options: ClientOptions) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                options: options.normalized(),
                state: Mutex::new(ClientState {
                    status: SessionStatus::ClientCreate,
                    session: None,
                    url: None,
                }),
                pool: CallbackPool::global(),
            }),
        }
    }

    /// Current lifecycle status.
    pub fn status(&self) -> SessionStatus {
        self.inner.state.lock().unwrap().status
    }

    /// Dial the given `ws://` URL and attach a session. Only valid while
    /// the client is in the created state.
    pub fn dial(&self, url: &str) -> Result<()> {
        {
            let state = self.inner.state.lock().unwrap();
            if state.status != SessionStatus::ClientCreate {
                return Err(Error::AlreadyDialed);
            }
        }
        let url = Url::parse(url).map_err(|err| Error::Url(UrlError::Invalid(err.to_string())))?;
        match url.scheme() {
            "ws" => {}
            // TLS terminates in front of the endpoint; the library itself
            // only speaks raw TCP.
            "wss" => return Err(Error::Url(UrlError::TlsFeatureNotEnabled)),
            _ => return Err(Error::Url(UrlError::UnsupportedUrlScheme)),
        }
        self.inner.state.lock().unwrap().url = Some(url);
        self.connect_once()
    }

    /// Write a message on the current session, see [`Session::write`].
    pub fn send(&self, kind: OpCode, payload: impl Into<Bytes>, key: Option<u32>) -> Result<usize> {
        let session = self
            .inner
            .state
            .lock()
            .unwrap()
            .session
            .clone()
            .ok_or(Error::NotConnected)?;
        session.write(kind, payload, key)
    }

    /// Close the current session with a normal closure.
    pub fn disconnect(&self) {
        let session = self.inner.state.lock().unwrap().session.clone();
        if let Some(session) = session {
            session.disconnect();
        }
    }

    /// One dial attempt against the stored URL. Transitions to `Connected`
    /// on success and `ConnectFailed` on failure.
    fn connect_once(&self) -> Result<()> {
        let url = self
            .inner
            .state
            .lock()
            .unwrap()
            .url
            .clone()
            .expect("Bug: dial stores the URL before connecting");
        match self.try_connect(&url) {
            Ok(session) => {
                {
                    let mut state = self.inner.state.lock().unwrap();
                    state.session = Some(session.clone());
                    state.status = SessionStatus::Connected;
                }
                if let Some(connected) = &self.inner.options.on_connected {
                    let connected = Arc::clone(connected);
                    self.inner.pool.execute(move || connected());
                }
                session.spawn_reader();
                Ok(())
            }
            Err(err) => {
                self.inner.state.lock().unwrap().status = SessionStatus::ConnectFailed;
                Err(err)
            }
        }
    }

    fn try_connect(&self, url: &Url) -> Result<Session> {
        let options = &self.inner.options;
        let timeout = Duration::from_secs(options.request_timeout);

        let host = url.host_str().ok_or(Error::Url(UrlError::NoHostName))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let addrs = (host, port).to_socket_addrs()?;
        let mut stream = connect_to_some(addrs, url, timeout)?;

        // The handshake runs under the request timeout; the deadlines are
        // cleared when the session attaches.
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let key = handshake::generate_key();
        let request = handshake::build_request(url, &key, &options.headers);
        crate::protocol::frame::write_bytes(&mut stream, &request)?;
        let (response, leftover) = handshake::read_response(&mut stream)?;
        handshake::verify_response(&response, &key)?;
        debug!("Client handshake done.");

        let client = self.clone();
        let on_disconnect: DisconnectHandler =
            Arc::new(move |_, status, stats| client.handle_disconnect(status, stats));
        let on_frame: Option<FrameHandler> = options.on_message.clone().map(|on_message| {
            let handler: FrameHandler =
                Arc::new(move |_, opcode, payload| on_message(opcode, payload));
            handler
        });
        let config = SessionConfig {
            statistics: options.statistics,
            ping_interval: options.ping_interval,
            on_frame,
            on_disconnect: Some(on_disconnect),
            on_receive: None,
        };
        Session::attach(
            0,
            Role::Client,
            stream,
            leftover,
            config,
            Arc::clone(&self.inner.pool),
        )
    }

    /// Session teardown: forward the callback, then decide between resting,
    /// returning to the created state and reconnecting.
    fn handle_disconnect(&self, status: SessionStatus, stats: Option<SessionStats>) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.session = None;
            state.status = status;
        }
        if let Some(on_disconnect) = &self.inner.options.on_disconnect {
            on_disconnect(status, stats);
        }
        if status == SessionStatus::Closed(CloseCode::Normal) {
            // A deliberate closure; ready for a fresh dial.
            self.inner.state.lock().unwrap().status = SessionStatus::ClientCreate;
            return;
        }
        if self.inner.options.reconnect_max < 0 {
            // Reconnecting disabled; rest in the failure status.
            return;
        }
        self.inner.state.lock().unwrap().status = SessionStatus::ClientReconnect;
        self.spawn_reconnect();
    }

    fn spawn_reconnect(&self) {
        let client = self.clone();
        let spawned = thread::Builder::new()
            .name("ws-reconnect".into())
            .spawn(move || {
                let max_attempts = client.inner.options.reconnect_max;
                let interval = Duration::from_secs(client.inner.options.reconnect_interval);
                let mut attempt: u32 = 0;
                loop {
                    if max_attempts > 0 && attempt >= max_attempts as u32 {
                        // Out of attempts; the status stays at the last failure.
                        debug!("reconnect attempts exhausted after {}", attempt);
                        return;
                    }
                    attempt += 1;
                    client.inner.state.lock().unwrap().status = SessionStatus::ClientReconnect;
                    thread::sleep(interval);
                    match client.connect_once() {
                        Ok(()) => {
                            debug!("reconnected on attempt {}", attempt);
                            return;
                        }
                        Err(err) => {
                            debug!("reconnect attempt {} failed: {}", attempt, err);
                        }
                    }
                }
            });
        if let Err(err) = spawned {
            warn!("failed to spawn reconnect thread: {}", err);
        }
    }
}

fn connect_to_some(
    addrs: impl Iterator<Item = SocketAddr>,
    url: &Url,
    timeout: Duration,
) -> Result<TcpStream> {
    for addr in addrs {
        debug!("Trying to contact {} at {}...", url, addr);
        if let Ok(stream) = TcpStream::connect_timeout(&addr, timeout) {
            return Ok(stream);
        }
    }
    Err(Error::Url(UrlError::UnableToConnect(url.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_normalize_out_of_range_values() {
        let options = ClientOptions::default()
            .reconnect(3, 0)
            .request_timeout(120)
            .normalized();
        assert_eq!(options.reconnect_interval, 5);
        assert_eq!(options.request_timeout, 10);

        let options = ClientOptions::default().request_timeout(2).normalized();
        assert_eq!(options.request_timeout, 10);

        let options = ClientOptions::default().request_timeout(60).normalized();
        assert_eq!(options.request_timeout, 60);
    }

    #[test]
    fn dial_rejects_unsupported_schemes() {
        let client = Client::new(ClientOptions::default());
        assert!(matches!(
            client.dial("http://localhost/"),
            Err(Error::Url(UrlError::UnsupportedUrlScheme))
        ));
        assert!(matches!(
            client.dial("wss://localhost/"),
            Err(Error::Url(UrlError::TlsFeatureNotEnabled))
        ));
        assert!(matches!(
            client.dial("not a url"),
            Err(Error::Url(UrlError::Invalid(_)))
        ));
    }

    #[test]
    fn send_before_dial_fails() {
        let client = Client::new(ClientOptions::default());
        let err = client
            .send(OpCode::Data(crate::protocol::Data::Text), &b"hi"[..], None)
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }
}
