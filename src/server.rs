//! Server-side session registry.
//!
//! One registry owns the table of live server sessions: it validates HTTP
//! upgrades, allocates session ids, arms per-session idle timers and fans
//! received frames out to the configured callbacks. [`Server::global`]
//! returns the process-wide instance; independent registries can be built
//! with [`Server::new`] for embedding and tests.

use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Request};
use log::{debug, warn};

use crate::dispatch::CallbackPool;
use crate::error::{Error, Result};
use crate::handshake::server as handshake;
use crate::protocol::{CloseCode, OpCode, Role};
use crate::session::{
    DisconnectHandler, FrameHandler, IdAllocator, Session, SessionConfig,
};

/// Deadline applied while writing the 101 response; cleared once it is sent.
const UPGRADE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Application-level handshake check, e.g. authentication. Rejections are
/// answered with a 404 naming the returned reason.
pub type HandshakeCheck =
    Arc<dyn Fn(&Request<()>) -> std::result::Result<(), String> + Send + Sync>;

/// Callback invoked after a session is registered, with the session id and
/// the headers of the upgrade request.
pub type ConnectedHandler = Arc<dyn Fn(i64, HeaderMap) + Send + Sync>;

/// The callback group fanned out to by the registry.
#[derive(Default, Clone)]
pub struct ServerCallbacks {
    /// A session was registered.
    pub connected: Option<ConnectedHandler>,
    /// A session terminated; fires at most once per session.
    pub disconnected: Option<DisconnectHandler>,
    /// A complete data message arrived on a session.
    pub frame: Option<FrameHandler>,
}

/// The server session registry. Cheap to clone; all clones share one table.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    sessions: RwLock<HashMap<i64, SessionEntry>>,
    config: RwLock<ServerConfig>,
    /// Set by the first served upgrade; configuration is frozen after that.
    served: AtomicBool,
    pool: Arc<CallbackPool>,
}

#[derive(Default)]
struct ServerConfig {
    timeout: u64,
    ping_time: u64,
    statistics: bool,
    handshake_check: Option<HandshakeCheck>,
    callbacks: ServerCallbacks,
}

struct SessionEntry {
    session: Session,
    idle: Option<Arc<IdleTimer>>,
}

impl Server {
    /// The process-wide registry.
    pub fn global() -> Server {
        static INSTANCE: OnceLock<Server> = OnceLock::new();
        INSTANCE.get_or_init(Server::new).clone()
    }

    /// Build an independent registry.
    pub fn new() -> Server {
        Server {
            inner: Arc::new(ServerInner {
                sessions: RwLock::new(HashMap::new()),
                config: RwLock::new(ServerConfig::default()),
                served: AtomicBool::new(false),
                pool: CallbackPool::global(),
            }),
        }
    }

    /// Configure the idle timeout in seconds; zero disables it. Honored
    /// only before the first upgrade has been served.
    pub fn set_timeout(&self, seconds: u64) {
        self.configure(|config| config.timeout = seconds);
    }

    /// Configure the keep-alive ping interval in seconds; zero disables it.
    /// Honored only before the first upgrade has been served.
    pub fn set_ping_time(&self, seconds: u64) {
        self.configure(|config| config.ping_time = seconds);
    }

    /// Enable traffic statistics on new sessions. Honored only before the
    /// first upgrade has been served.
    pub fn set_statistics(&self, enabled: bool) {
        self.configure(|config| config.statistics = enabled);
    }

    /// Install an application-level handshake check. Honored only before
    /// the first upgrade has been served.
    pub fn set_handshake_check(
        &self,
        check: impl Fn(&Request<()>) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) {
        self.configure(|config| config.handshake_check = Some(Arc::new(check)));
    }

    /// Install the callback group. Honored only before the first upgrade
    /// has been served.
    pub fn set_callbacks(&self, callbacks: ServerCallbacks) {
        self.configure(|config| config.callbacks = callbacks);
    }

    fn configure(&self, apply: impl FnOnce(&mut ServerConfig)) {
        if self.inner.served.load(Ordering::SeqCst) {
            // Configuration is frozen once traffic is flowing.
            return;
        }
        apply(&mut self.inner.config.write().unwrap());
    }

    /// Serve one upgrade request read from the stream: validate it, reply
    /// with 101 (or 404 naming the failed check), register the session and
    /// spawn its reader. Returns the new session id.
    pub fn serve(&self, mut stream: TcpStream) -> Result<i64> {
        self.inner.served.store(true, Ordering::SeqCst);
        let (request, leftover) = match handshake::read_request(&mut stream) {
            Ok(parsed) => parsed,
            Err(err) => {
                let _ = handshake::write_rejection(&mut stream, &err.to_string());
                return Err(err);
            }
        };
        self.upgrade(request, stream, leftover)
    }

    /// Entry point for upstream HTTP servers: takes an already-parsed
    /// request, the hijacked stream and any bytes read past the request
    /// head. Validates, replies and registers like [`Server::serve`].
    pub fn upgrade(
        &self,
        request: Request<()>,
        mut stream: TcpStream,
        leftover: Vec<u8>,
    ) -> Result<i64> {
        self.inner.served.store(true, Ordering::SeqCst);
        let check = self.inner.config.read().unwrap().handshake_check.clone();
        let checked = handshake::validate_upgrade(&request).and_then(|()| match &check {
            Some(check) => check(&request).map_err(Error::HandshakeRejected),
            None => Ok(()),
        });
        if let Err(err) = checked {
            let _ = handshake::write_rejection(&mut stream, &err.to_string());
            return Err(err);
        }

        let response = handshake::accept_response(&request)?;
        stream.set_write_timeout(Some(UPGRADE_WRITE_TIMEOUT))?;
        stream.write_all(&response)?;
        stream.set_write_timeout(None)?;

        self.register(request, stream, leftover)
    }

    fn register(
        &self,
        request: Request<()>,
        stream: TcpStream,
        leftover: Vec<u8>,
    ) -> Result<i64> {
        let id = IdAllocator::global().next();
        let (timeout, ping_time, statistics, callbacks) = {
            let config = self.inner.config.read().unwrap();
            (
                config.timeout,
                config.ping_time,
                config.statistics,
                config.callbacks.clone(),
            )
        };

        let registry = self.clone();
        let user_disconnected = callbacks.disconnected.clone();
        let on_disconnect: DisconnectHandler = Arc::new(move |sid, status, stats| {
            registry.unregister(sid);
            if let Some(disconnected) = &user_disconnected {
                disconnected(sid, status, stats);
            }
        });

        let registry = self.clone();
        let config = SessionConfig {
            statistics,
            ping_interval: ping_time,
            on_frame: callbacks.frame.clone(),
            on_disconnect: Some(on_disconnect),
            on_receive: Some(Arc::new(move |sid| registry.touch(sid))),
        };
        let session = Session::attach(
            id,
            Role::Server,
            stream,
            leftover,
            config,
            Arc::clone(&self.inner.pool),
        )?;

        let idle = (timeout >= 1).then(|| {
            let registry = self.clone();
            IdleTimer::spawn(Duration::from_secs(timeout), move || registry.expire(id))
        });
        self.inner
            .sessions
            .write()
            .unwrap()
            .insert(id, SessionEntry { session: session.clone(), idle });
        debug!("session {} registered", id);

        if let Some(connected) = &callbacks.connected {
            let connected = Arc::clone(connected);
            let headers = request.headers().clone();
            self.inner.pool.execute(move || connected(id, headers));
        }
        session.spawn_reader();
        Ok(id)
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.inner.sessions.read().unwrap().len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a session by id.
    pub fn session(&self, id: i64) -> Result<Session> {
        self.inner
            .sessions
            .read()
            .unwrap()
            .get(&id)
            .map(|entry| entry.session.clone())
            .ok_or(Error::SessionNotFound(id))
    }

    /// Sessions whose ids, sorted descending, fall into the half-open index
    /// range `[start, end)`. An empty range yields an empty list.
    pub fn session_range(&self, start: usize, end: usize) -> Vec<Session> {
        if end == 0 || start >= end {
            return Vec::new();
        }
        let sessions = self.inner.sessions.read().unwrap();
        let mut ids: Vec<i64> = sessions.keys().copied().collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids.into_iter()
            .skip(start)
            .take(end - start)
            .filter_map(|id| sessions.get(&id).map(|entry| entry.session.clone()))
            .collect()
    }

    /// Look up several sessions at once; absent ids are left out.
    pub fn sessions_by_ids(&self, ids: &[i64]) -> HashMap<i64, Session> {
        let sessions = self.inner.sessions.read().unwrap();
        ids.iter()
            .filter_map(|id| {
                sessions
                    .get(id)
                    .map(|entry| (*id, entry.session.clone()))
            })
            .collect()
    }

    /// Write a message on the named session, see [`Session::write`].
    pub fn send(
        &self,
        id: i64,
        kind: OpCode,
        payload: impl Into<Bytes>,
        key: Option<u32>,
    ) -> Result<usize> {
        self.session(id)?.write(kind, payload, key)
    }

    /// Close the named session with a normal closure.
    pub fn disconnect(&self, id: i64) -> Result<()> {
        let session = self.session(id)?;
        session.disconnect();
        Ok(())
    }

    /// Reset the idle timer of a session; invoked for every received frame.
    fn touch(&self, id: i64) {
        if let Some(entry) = self.inner.sessions.read().unwrap().get(&id) {
            if let Some(idle) = &entry.idle {
                idle.reset();
            }
        }
    }

    /// Idle deadline passed: drop the session with a policy violation (1008).
    fn expire(&self, id: i64) {
        debug!("session {} idle timeout", id);
        if let Some(entry) = self.remove_entry(id) {
            entry.session.close_with(CloseCode::Policy);
        }
    }

    /// Remove a terminated session from the table.
    fn unregister(&self, id: i64) {
        self.remove_entry(id);
    }

    fn remove_entry(&self, id: i64) -> Option<SessionEntry> {
        let entry = self.inner.sessions.write().unwrap().remove(&id);
        if let Some(entry) = &entry {
            if let Some(idle) = &entry.idle {
                idle.stop();
            }
        }
        entry
    }
}

impl Default for Server {
    fn default() -> Self {
        Server::new()
    }
}

/// One-shot timer that fires unless it keeps being reset. Used for the
/// per-session idle timeout; every received frame pushes the deadline out.
struct IdleTimer {
    timeout: Duration,
    state: Mutex<IdleState>,
    changed: Condvar,
}

struct IdleState {
    deadline: Instant,
    stopped: bool,
}

impl IdleTimer {
    fn spawn(timeout: Duration, on_expire: impl FnOnce() + Send + 'static) -> Arc<IdleTimer> {
        let timer = Arc::new(IdleTimer {
            timeout,
            state: Mutex::new(IdleState {
                deadline: Instant::now() + timeout,
                stopped: false,
            }),
            changed: Condvar::new(),
        });
        let watcher = Arc::clone(&timer);
        let spawned = thread::Builder::new()
            .name("ws-idle-timer".into())
            .spawn(move || {
                let mut state = watcher.state.lock().unwrap();
                loop {
                    if state.stopped {
                        return;
                    }
                    let now = Instant::now();
                    if now >= state.deadline {
                        break;
                    }
                    let wait = state.deadline - now;
                    state = watcher.changed.wait_timeout(state, wait).unwrap().0;
                }
                drop(state);
                on_expire();
            });
        if let Err(err) = spawned {
            warn!("failed to spawn idle timer: {}", err);
        }
        timer
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.deadline = Instant::now() + self.timeout;
        self.changed.notify_all();
    }

    fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        self.changed.notify_all();
    }
}
