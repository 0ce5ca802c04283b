//! Session registry, broadcast fan-out and lifecycle callbacks.
//!
//! Two locks guard the server. `lifecycle` orders session arrivals and
//! departures against callback registration: each side takes its snapshot
//! (callbacks to run, or sessions to notify) under it, so every callback
//! sees every session exactly once. Callbacks themselves run after the
//! lock is released and may call back into the server. `state` guards the
//! session table and the broadcast buffer; a new session's replay is
//! queued under the same lock that inserts it, so it can neither miss nor
//! duplicate a broadcast. Lock order is always `lifecycle` then `state`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use nerfhub_proto::{Envelope, MessageKind, SlotId, ViewerMessage};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::buffer::BroadcastBuffer;
use super::handlers::{Handler, HandlerRegistry};
use super::transport;
use super::types::{DispatchError, ServerConfig, ServerError, ServerStats, SessionId};

type SessionCallback = Arc<dyn Fn(&SessionHandle) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SessionEntry {
    outbound: mpsc::UnboundedSender<Envelope>,
    handlers: HandlerRegistry,
}

#[derive(Default)]
struct State {
    sessions: BTreeMap<SessionId, SessionEntry>,
    buffer: BroadcastBuffer,
    handlers: HandlerRegistry,
    total_connections: u64,
}

/// Listener state, checked and claimed in one critical section.
#[derive(Debug, Clone, Copy, Default)]
enum Listener {
    #[default]
    Idle,
    Binding,
    Bound(SocketAddr),
}

#[derive(Default)]
struct Lifecycle {
    on_connect: Vec<SessionCallback>,
    on_disconnect: Vec<SessionCallback>,
}

struct Inner {
    config: ServerConfig,
    next_id: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
    state: Mutex<State>,
    live: watch::Sender<usize>,
    shutdown: watch::Sender<bool>,
    listener: Mutex<Listener>,
}

impl Inner {
    fn handle(self: &Arc<Self>, id: SessionId) -> SessionHandle {
        SessionHandle {
            id,
            server: Arc::downgrade(self),
        }
    }

    fn broadcast(&self, envelope: Envelope) -> usize {
        let mut state = lock(&self.state);
        if envelope.slot.is_some() {
            state.buffer.update(envelope.clone());
        }
        for entry in state.sessions.values() {
            // A closed receiver means teardown is already under way.
            let _ = entry.outbound.send(envelope.clone());
        }
        state.sessions.len()
    }

    fn send(&self, id: SessionId, envelope: Envelope) -> bool {
        let state = lock(&self.state);
        state
            .sessions
            .get(&id)
            .is_some_and(|entry| entry.outbound.send(envelope).is_ok())
    }

    fn register_session_handler(&self, id: SessionId, kind: MessageKind, handler: Handler) -> bool {
        let mut state = lock(&self.state);
        match state.sessions.get_mut(&id) {
            Some(entry) => {
                entry.handlers.register(kind, handler);
                true
            }
            None => false,
        }
    }

    fn is_connected(&self, id: SessionId) -> bool {
        lock(&self.state).sessions.contains_key(&id)
    }
}

/// A connected client as seen by callbacks and handlers.
///
/// Holds only a weak reference to the server, so storing handles inside
/// callbacks does not keep the server alive.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    server: Weak<Inner>,
}

impl SessionHandle {
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Queue a message for this client only. No-op once disconnected.
    pub fn send(&self, envelope: impl Into<Envelope>) -> bool {
        self.server
            .upgrade()
            .is_some_and(|inner| inner.send(self.id, envelope.into()))
    }

    /// Register a handler that only sees messages from this client.
    pub fn register_handler<F>(&self, kind: MessageKind, handler: F) -> bool
    where
        F: Fn(SessionId, &ViewerMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.server
            .upgrade()
            .is_some_and(|inner| inner.register_session_handler(self.id, kind, Arc::new(handler)))
    }

    pub fn is_connected(&self) -> bool {
        self.server
            .upgrade()
            .is_some_and(|inner| inner.is_connected(self.id))
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish()
    }
}

/// Outbound queue of one session, drained by its writer.
#[derive(Debug)]
pub struct SessionStream {
    id: SessionId,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl SessionStream {
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Next queued envelope; `None` once the session is closed and drained.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

/// Multi-client viewer server.
#[derive(Clone)]
pub struct SessionServer {
    inner: Arc<Inner>,
}

impl SessionServer {
    pub fn new(config: ServerConfig) -> Self {
        let (live, _) = watch::channel(0usize);
        let (shutdown, _) = watch::channel(false);
        let mirror = config.mirror_gui_updates;
        let inner = Arc::new(Inner {
            config,
            next_id: AtomicU64::new(1),
            lifecycle: Mutex::new(Lifecycle::default()),
            state: Mutex::new(State::default()),
            live,
            shutdown,
            listener: Mutex::new(Listener::Idle),
        });

        if mirror {
            let weak = Arc::downgrade(&inner);
            let mirror_gui: Handler = Arc::new(move |_, message| {
                if let (Some(inner), ViewerMessage::GuiUpdate { id, .. }) = (weak.upgrade(), message)
                {
                    inner.broadcast(Envelope::persistent(format!("gui/{id}"), message.clone()));
                }
                Ok(())
            });
            lock(&inner.state)
                .handlers
                .register(MessageKind::GuiUpdate, mirror_gui);
        }

        Self { inner }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Bind the first free port from `port` upward and serve on a
    /// background task. Returns the bound address.
    pub async fn start(&self, host: &str, port: u16) -> Result<SocketAddr, ServerError> {
        let reservation = BindReservation::claim(&self.inner)?;
        let listener = bind_with_retry(host, port, self.inner.config.port_attempts).await?;
        let addr = listener.local_addr()?;
        reservation.bound(addr);

        let router = transport::router(self.clone());
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "Session server failed");
            }
            info!(%addr, "Session server stopped");
        });

        info!(%addr, "Session server listening");
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match *lock(&self.inner.listener) {
            Listener::Bound(addr) => Some(addr),
            Listener::Idle | Listener::Binding => None,
        }
    }

    /// WebSocket URL clients connect to, once started.
    pub fn endpoint(&self) -> Option<String> {
        self.local_addr().map(|addr| format!("ws://{addr}/ws"))
    }

    /// Register a new session, queue its replay, and notify connect callbacks.
    pub fn open_session(&self) -> (SessionHandle, SessionStream) {
        let id = SessionId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        let (callbacks, replayed, live) = {
            let lifecycle = lock(&self.inner.lifecycle);
            let mut state = lock(&self.inner.state);
            let snapshot = state.buffer.snapshot();
            let replayed = snapshot.len();
            for envelope in snapshot {
                let _ = tx.send(envelope);
            }
            state.sessions.insert(
                id,
                SessionEntry {
                    outbound: tx,
                    handlers: HandlerRegistry::new(),
                },
            );
            state.total_connections += 1;
            (lifecycle.on_connect.clone(), replayed, state.sessions.len())
        };
        self.inner.live.send_replace(live);
        info!(session_id = %id, live, replayed, "Session opened");

        let handle = self.inner.handle(id);
        for callback in &callbacks {
            callback(&handle);
        }

        (handle, SessionStream { id, rx })
    }

    /// Remove a session and notify disconnect callbacks. Idempotent.
    pub fn close_session(&self, id: SessionId) -> bool {
        let (callbacks, live) = {
            let lifecycle = lock(&self.inner.lifecycle);
            let mut state = lock(&self.inner.state);
            if state.sessions.remove(&id).is_none() {
                return false;
            }
            (lifecycle.on_disconnect.clone(), state.sessions.len())
        };
        self.inner.live.send_replace(live);
        info!(session_id = %id, live, "Session closed");

        let handle = self.inner.handle(id);
        for callback in &callbacks {
            callback(&handle);
        }
        if live == 0 {
            debug!("No sessions left, server idle");
        }
        true
    }

    /// Send a live-only message to every connected client.
    pub fn broadcast(&self, message: ViewerMessage) -> usize {
        self.inner.broadcast(Envelope::transient(message))
    }

    /// Send to every client and keep as the latest value of `slot`.
    pub fn broadcast_persistent(&self, slot: impl Into<SlotId>, message: ViewerMessage) -> usize {
        self.inner.broadcast(Envelope::persistent(slot, message))
    }

    pub fn broadcast_envelope(&self, envelope: Envelope) -> usize {
        self.inner.broadcast(envelope)
    }

    /// Send to one client. No-op if it is not connected.
    pub fn send(&self, id: SessionId, message: ViewerMessage) -> bool {
        self.inner.send(id, Envelope::transient(message))
    }

    /// Register a handler that sees messages of `kind` from every client.
    pub fn register_handler<F>(&self, kind: MessageKind, handler: F)
    where
        F: Fn(SessionId, &ViewerMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        lock(&self.inner.state)
            .handlers
            .register(kind, Arc::new(handler));
    }

    /// Register a connect callback. It also runs immediately for every
    /// session that is already connected.
    pub fn on_connect<F>(&self, callback: F)
    where
        F: Fn(&SessionHandle) + Send + Sync + 'static,
    {
        let callback: SessionCallback = Arc::new(callback);
        let existing: Vec<SessionId> = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            lifecycle.on_connect.push(Arc::clone(&callback));
            lock(&self.inner.state).sessions.keys().copied().collect()
        };
        for id in existing {
            callback(&self.inner.handle(id));
        }
    }

    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(&SessionHandle) + Send + Sync + 'static,
    {
        lock(&self.inner.lifecycle)
            .on_disconnect
            .push(Arc::new(callback));
    }

    /// Handles for every connected client.
    pub fn clients(&self) -> Vec<SessionHandle> {
        let ids: Vec<SessionId> = lock(&self.inner.state).sessions.keys().copied().collect();
        ids.into_iter().map(|id| self.inner.handle(id)).collect()
    }

    pub fn live_count(&self) -> usize {
        lock(&self.inner.state).sessions.len()
    }

    pub fn is_idle(&self) -> bool {
        self.live_count() == 0
    }

    /// Resolve once no client is connected.
    pub async fn wait_idle(&self) {
        let mut live = self.inner.live.subscribe();
        let _ = live.wait_for(|count| *count == 0).await;
    }

    pub fn stats(&self) -> ServerStats {
        let state = lock(&self.inner.state);
        ServerStats {
            live_sessions: state.sessions.len(),
            total_connections: state.total_connections,
            buffered_slots: state.buffer.len(),
        }
    }

    /// Run every handler registered for this message on the blocking pool.
    ///
    /// Server-wide handlers run before the session's own, in registration
    /// order. A failing or panicking handler is logged and does not stop
    /// the others. Returns `None` when nothing is registered for the kind.
    pub fn dispatch(
        &self,
        id: SessionId,
        message: ViewerMessage,
    ) -> Option<JoinHandle<Vec<DispatchError>>> {
        let kind = message.kind();
        let handlers = {
            let state = lock(&self.inner.state);
            let mut handlers = state.handlers.handlers_for(kind);
            if let Some(entry) = state.sessions.get(&id) {
                handlers.extend(entry.handlers.handlers_for(kind));
            }
            handlers
        };
        if handlers.is_empty() {
            debug!(session_id = %id, %kind, "No handler registered");
            return None;
        }
        Some(tokio::task::spawn_blocking(move || {
            run_handlers(id, &message, &handlers)
        }))
    }

    pub(super) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// Stop accepting connections and close every session.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let ids: Vec<SessionId> = lock(&self.inner.state).sessions.keys().copied().collect();
        for id in ids {
            self.close_session(id);
        }
    }
}

impl Default for SessionServer {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

/// Claim on the listener slot for one `start` call. Dropped unbound (bind
/// failure or a cancelled `start`), it returns the slot to idle.
struct BindReservation<'a> {
    inner: &'a Inner,
    bound: bool,
}

impl<'a> BindReservation<'a> {
    fn claim(inner: &'a Inner) -> Result<Self, ServerError> {
        let mut listener = lock(&inner.listener);
        match *listener {
            Listener::Bound(addr) => Err(ServerError::AlreadyStarted { addr }),
            Listener::Binding => Err(ServerError::Starting),
            Listener::Idle => {
                *listener = Listener::Binding;
                Ok(Self {
                    inner,
                    bound: false,
                })
            }
        }
    }

    fn bound(mut self, addr: SocketAddr) {
        *lock(&self.inner.listener) = Listener::Bound(addr);
        self.bound = true;
    }
}

impl Drop for BindReservation<'_> {
    fn drop(&mut self) {
        if !self.bound {
            *lock(&self.inner.listener) = Listener::Idle;
        }
    }
}

fn run_handlers(id: SessionId, message: &ViewerMessage, handlers: &[Handler]) -> Vec<DispatchError> {
    let kind = message.kind();
    let mut failures = Vec::new();
    for handler in handlers {
        let failure = match panic::catch_unwind(AssertUnwindSafe(|| handler(id, message))) {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => DispatchError::Failed {
                kind,
                session_id: id,
                reason: format!("{e:#}"),
            },
            Err(_) => DispatchError::Panicked {
                kind,
                session_id: id,
            },
        };
        warn!(error = %failure, "Message handler failed");
        failures.push(failure);
    }
    failures
}

async fn bind_with_retry(host: &str, port: u16, attempts: u16) -> Result<TcpListener, ServerError> {
    let attempts = attempts.max(1);
    let mut last_error = String::from("no port in range");

    for offset in 0..attempts {
        let Some(candidate) = port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                debug!(port = candidate, "Port in use, trying next");
                last_error = e.to_string();
            }
            Err(e) => {
                last_error = e.to_string();
                break;
            }
        }
        if port == 0 {
            break;
        }
    }

    Err(ServerError::Bind {
        host: host.to_string(),
        first_port: port,
        attempts,
        reason: last_error,
    })
}
