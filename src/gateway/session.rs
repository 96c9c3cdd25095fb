//! Client sessions and in-flight call tracking
//!
//! A session is created by `initialize` on Streamable HTTP or by opening the
//! legacy `GET /sse` stream. Each owns a [`CancellationToken`] that is a child
//! of the server's shutdown token; every tool call made through the session
//! runs under a child of that, so closing the session (or shutting down)
//! cancels its in-flight upstream requests.
//!
//! Streamable sessions have no connection to notice a client going away, so
//! they expire after an idle timeout. The store also caps how many sessions
//! may be live at once.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_stream::stream;
use axum::response::sse::{Event, KeepAlive, Sse};
use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{JsonRpcResponse, RequestId};

/// Outbound queue depth per SSE session
const SSE_BUFFER: usize = 64;

/// Which transport opened the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// `POST /mcp` with `Mcp-Session-Id`
    Streamable,
    /// `GET /sse` + `POST /messages`
    LegacySse,
}

/// One connected client
#[derive(Debug)]
pub struct Session {
    /// Session id
    pub id: String,
    /// Transport that opened it
    pub kind: SessionKind,
    /// Cancelled when the session ends
    pub cancel: CancellationToken,
    /// `Authorization` header seen when the SSE stream was opened
    pub authorization: Option<String>,
    outbound: Option<mpsc::Sender<JsonRpcResponse>>,
    last_seen: Mutex<Instant>,
}

impl Session {
    fn new(
        kind: SessionKind,
        cancel: CancellationToken,
        authorization: Option<String>,
        outbound: Option<mpsc::Sender<JsonRpcResponse>>,
    ) -> Self {
        Self {
            id: new_session_id(),
            kind,
            cancel,
            authorization,
            outbound,
            last_seen: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the session was created or last looked up
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Queue a response on the session's event stream
    ///
    /// Returns `false` when the session has no stream or the stream is gone.
    pub async fn deliver(&self, response: JsonRpcResponse) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(response).await.is_ok(),
            None => false,
        }
    }
}

/// All live sessions
pub struct SessionStore {
    sessions: DashMap<String, Arc<Session>>,
    shutdown: CancellationToken,
    idle_timeout: Duration,
    max_sessions: usize,
}

impl SessionStore {
    /// Default idle timeout for Streamable sessions
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

    /// Default cap on live sessions
    pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

    /// Create a store whose sessions end when `shutdown` fires
    #[must_use]
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            sessions: DashMap::new(),
            shutdown,
            idle_timeout: Self::DEFAULT_IDLE_TIMEOUT,
            max_sessions: Self::DEFAULT_MAX_SESSIONS,
        }
    }

    /// Override the idle timeout and session cap
    #[must_use]
    pub fn with_limits(mut self, idle_timeout: Duration, max_sessions: usize) -> Self {
        self.idle_timeout = idle_timeout;
        self.max_sessions = max_sessions.max(1);
        self
    }

    /// Open a Streamable HTTP session, or `None` when the store is full
    pub fn create_streamable(&self) -> Option<Arc<Session>> {
        if !self.has_room() {
            return None;
        }
        let session = Arc::new(Session::new(
            SessionKind::Streamable,
            self.shutdown.child_token(),
            None,
            None,
        ));
        self.sessions.insert(session.id.clone(), Arc::clone(&session));
        info!(session_id = %session.id, "Created streamable session");
        Some(session)
    }

    /// Open a legacy SSE session and the receiver its stream drains, or
    /// `None` when the store is full
    pub fn create_sse(
        &self,
        authorization: Option<String>,
    ) -> Option<(Arc<Session>, mpsc::Receiver<JsonRpcResponse>)> {
        if !self.has_room() {
            return None;
        }
        let (tx, rx) = mpsc::channel(SSE_BUFFER);
        let session = Arc::new(Session::new(
            SessionKind::LegacySse,
            self.shutdown.child_token(),
            authorization,
            Some(tx),
        ));
        self.sessions.insert(session.id.clone(), Arc::clone(&session));
        info!(session_id = %session.id, "Created SSE session");
        Some((session, rx))
    }

    /// Expired sessions are swept before a full store refuses a new one
    fn has_room(&self) -> bool {
        if self.sessions.len() < self.max_sessions {
            return true;
        }
        self.sweep_idle();
        if self.sessions.len() < self.max_sessions {
            return true;
        }
        warn!(max_sessions = self.max_sessions, "Session limit reached");
        false
    }

    /// Close Streamable sessions idle for longer than the timeout
    ///
    /// SSE sessions are left alone; they end with their stream.
    pub fn sweep_idle(&self) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.kind == SessionKind::Streamable && s.idle_for() > self.idle_timeout)
            .map(|s| s.id.clone())
            .collect();
        for id in &expired {
            self.remove(id);
        }
        if !expired.is_empty() {
            debug!(expired = expired.len(), live = self.sessions.len(), "Swept idle sessions");
        }
        expired.len()
    }

    /// Sweep idle sessions periodically until shutdown
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        let interval = (self.idle_timeout / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_idle();
                    }
                }
            }
        })
    }

    /// Look up a session and mark it active
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.get(id).map(|s| Arc::clone(s.value()))?;
        session.touch();
        Some(session)
    }

    /// End a session and cancel its in-flight calls
    pub fn remove(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                session.cancel.cancel();
                info!(session_id = %id, "Session closed");
                true
            }
            None => false,
        }
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Removes the SSE session when its stream is dropped
struct SessionGuard {
    store: Arc<SessionStore>,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.store.remove(&self.id);
    }
}

/// Build the `GET /sse` response for a freshly created session
///
/// The first event is `endpoint` carrying the URL to post messages to; every
/// later event is a `message` holding one JSON-RPC response. The stream ends
/// when the session is cancelled, and dropping it (client disconnect) closes
/// the session.
pub fn sse_response(
    store: Arc<SessionStore>,
    session: Arc<Session>,
    mut rx: mpsc::Receiver<JsonRpcResponse>,
    keep_alive: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let guard = SessionGuard {
        store,
        id: session.id.clone(),
    };
    let cancel = session.cancel.clone();
    let endpoint = format!("/messages?session_id={}", session.id);

    let stream = stream! {
        let _guard = guard;
        yield Ok(Event::default().event("endpoint").data(endpoint));

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(response) => match serde_json::to_string(&response) {
                        Ok(data) => yield Ok(Event::default().event("message").data(data)),
                        Err(e) => debug!(error = %e, "Dropping unserializable response"),
                    },
                    None => break,
                },
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(keep_alive).text("ping"))
}

type CallKey = (String, RequestId);

/// Tool calls currently running, addressable by `notifications/cancelled`
///
/// Calls are keyed by session and request id, so a client can only cancel
/// its own requests.
#[derive(Default)]
pub struct InflightRegistry {
    calls: DashMap<CallKey, (u64, CancellationToken)>,
    next: AtomicU64,
}

impl InflightRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a call; it is untracked when the guard drops
    pub fn register(
        self: &Arc<Self>,
        scope: &str,
        id: &RequestId,
        parent: &CancellationToken,
    ) -> InflightGuard {
        let generation = self.next.fetch_add(1, Ordering::Relaxed);
        let token = parent.child_token();
        let key = (scope.to_string(), id.clone());
        self.calls.insert(key.clone(), (generation, token.clone()));
        InflightGuard {
            registry: Arc::clone(self),
            key,
            generation,
            token,
        }
    }

    /// Cancel the call `id` in `scope`
    pub fn cancel(&self, scope: &str, id: &RequestId) -> bool {
        match self.calls.get(&(scope.to_string(), id.clone())) {
            Some(entry) => {
                entry.1.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of tracked calls
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether nothing is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Registration handle for one in-flight call
pub struct InflightGuard {
    registry: Arc<InflightRegistry>,
    key: CallKey,
    generation: u64,
    token: CancellationToken,
}

impl InflightGuard {
    /// Token cancelled by `notifications/cancelled` or the session ending
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        // A reused request id may have replaced our entry
        self.registry
            .calls
            .remove_if(&self.key, |_, (generation, _)| *generation == self.generation);
    }
}
