//! Session registry and the synchronous-over-asynchronous command
//! correlator.
//!
//! The hub owns every live extension session, keyed by token digest, and a
//! process-wide pending-request table keyed by correlation id. A REST caller
//! blocks in [`Hub::send_command`] while the command travels the duplex
//! socket; the session's read pump hands the eventual response back through
//! the pending table.
//!
//! # Invariants
//!
//! - At most one session per token digest; a new connection for a digest
//!   takes over and tears down the old session.
//! - Every pending entry is removed exactly once: by its response, its
//!   timeout, session death, or the caller going away. A drop guard covers
//!   all exit paths, including cancellation of the caller's future.
//! - Registry and pending table locks are never held across await points.
//! - Late responses (no pending entry) are dropped without side effects.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tabrelay_core::config::Config;
use tabrelay_core::protocol::{CommandAction, CommandResponse, ServerMessage, Tab};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod connection;

/// Errors surfaced by hub dispatch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    /// No live session for the token, or the session died mid-dispatch.
    #[error("extension is not connected")]
    Offline,

    /// The session's outbound queue is full; the caller may retry shortly.
    #[error("connection is backpressured, retry shortly")]
    Backpressured,

    /// The command deadline elapsed without a response.
    #[error("command timed out")]
    Timeout,

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// One live extension connection.
///
/// The hub owns sessions; everything else holds `Arc`s. A session carries
/// only what its users need (the outbound queue handle, the done signal,
/// and the tab/heartbeat state its read pump maintains), so there is no
/// ownership cycle back into the hub.
pub struct Session {
    /// Opaque session id, fresh per connection.
    pub id: String,
    /// Digest of the token this session authenticated with.
    pub token_digest: String,
    /// Display name of that token.
    pub token_name: String,
    /// Extension version reported at connect time, if any.
    pub extension_version: Option<String>,
    /// When the socket registered.
    pub connected_at: DateTime<Utc>,
    last_heartbeat: RwLock<DateTime<Utc>>,
    /// Tab map, written only by this session's read pump.
    tabs: RwLock<HashMap<String, Tab>>,
    outbound: mpsc::Sender<String>,
    done: CancellationToken,
}

impl Session {
    /// Timestamp of the most recent heartbeat.
    #[must_use]
    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        *self
            .last_heartbeat
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of attached tabs.
    #[must_use]
    pub fn tab_count(&self) -> usize {
        self.tabs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Snapshot of the attached tabs, oldest attachment first.
    #[must_use]
    pub fn tabs_snapshot(&self) -> Vec<Tab> {
        let mut tabs: Vec<Tab> = self
            .tabs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        tabs.sort_by(|a, b| a.attached_at.cmp(&b.attached_at).then(a.id.cmp(&b.id)));
        tabs
    }

    /// Whether this session has been torn down or marked for takeover.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    fn touch_heartbeat(&self) {
        *self
            .last_heartbeat
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    fn insert_tab(&self, tab: Tab) {
        self.tabs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tab.id.clone(), tab);
    }

    fn remove_tab(&self, tab_id: &str) {
        self.tabs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tab_id);
    }

    fn update_tab(&self, tab_id: &str, url: Option<String>, title: Option<String>) {
        let mut tabs = self.tabs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(tab) = tabs.get_mut(tab_id) {
            if let Some(url) = url {
                tab.url = url;
            }
            if let Some(title) = title {
                tab.title = title;
            }
        }
    }

    fn try_enqueue(&self, frame: String) -> Result<(), EnqueueError> {
        use tokio::sync::mpsc::error::TrySendError;
        self.outbound.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

enum EnqueueError {
    Full,
    Closed,
}

/// The relay hub: session registry plus pending-request table.
pub struct Hub {
    cfg: Config,
    version: String,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    pending: RwLock<HashMap<String, oneshot::Sender<CommandResponse>>>,
}

impl Hub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new(cfg: Config, version: impl Into<String>) -> Self {
        Self {
            cfg,
            version: version.into(),
            sessions: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// The configuration this hub runs with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Registers a new session for `digest`, taking over any existing one.
    ///
    /// The handshake ack is placed on the outbound queue as the session's
    /// first frame; the caller is expected to start the pumps immediately
    /// afterwards via [`connection::run`].
    pub fn register(
        &self,
        digest: &str,
        token_name: &str,
        extension_version: Option<String>,
        outbound: mpsc::Sender<String>,
    ) -> Arc<Session> {
        let now = Utc::now();
        let session = Arc::new(Session {
            id: Uuid::new_v4().to_string(),
            token_digest: digest.to_string(),
            token_name: token_name.to_string(),
            extension_version,
            connected_at: now,
            last_heartbeat: RwLock::new(now),
            tabs: RwLock::new(HashMap::new()),
            outbound,
            done: CancellationToken::new(),
        });

        let displaced = {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            sessions.insert(digest.to_string(), Arc::clone(&session))
        };

        if let Some(old) = displaced {
            info!(
                session_id = %old.id,
                replacement = %session.id,
                "taking over existing session"
            );
            old.done.cancel();
        }

        info!(
            session_id = %session.id,
            token_name = %session.token_name,
            "extension connected"
        );

        let ack = ServerMessage::ConnectAck {
            session_id: session.id.clone(),
            server_time: now.timestamp_millis(),
            server_version: self.version.clone(),
        };
        if let Ok(frame) = serde_json::to_string(&ack) {
            let _ = session.try_enqueue(frame);
        }

        session
    }

    /// Removes a session from the registry and cancels its done signal.
    ///
    /// Removal is identity-checked: a superseded session tearing itself down
    /// after a takeover must not evict its replacement.
    pub fn unregister(&self, session: &Arc<Session>) {
        let removed = {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            match sessions.get(&session.token_digest) {
                Some(current) if Arc::ptr_eq(current, session) => {
                    sessions.remove(&session.token_digest);
                    true
                }
                _ => false,
            }
        };

        session.done.cancel();

        if removed {
            info!(
                session_id = %session.id,
                token_name = %session.token_name,
                "extension disconnected"
            );
        }
    }

    /// Looks up the live session for a token digest.
    #[must_use]
    pub fn session(&self, digest: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(digest)
            .cloned()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of in-flight pending requests. Exposed for shutdown draining
    /// and tests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Dispatches a command to the session for `digest` and waits for its
    /// response.
    ///
    /// The wait resolves with the first of: the correlated response, the
    /// effective timeout (`timeout_ms`, or the configured default when
    /// absent), or session death. Dropping the returned future, which is how
    /// a caller cancels, removes the pending entry as well.
    ///
    /// # Errors
    ///
    /// - [`HubError::Offline`] if no session exists, or it dies mid-flight
    /// - [`HubError::Backpressured`] if the outbound queue is full
    /// - [`HubError::Timeout`] if the deadline elapses first
    pub async fn send_command(
        &self,
        digest: &str,
        tab_id: String,
        action: CommandAction,
        timeout_ms: Option<u64>,
    ) -> Result<CommandResponse, HubError> {
        let session = self.session(digest).ok_or(HubError::Offline)?;

        let id = Uuid::new_v4().to_string();
        let timeout_ms = timeout_ms
            .filter(|t| *t > 0)
            .unwrap_or(self.cfg.command_timeout_ms);
        let timeout = Duration::from_millis(timeout_ms);

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self
                .pending
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            pending.insert(id.clone(), tx);
        }
        // Removes the entry on every exit path, including the caller's
        // future being dropped mid-wait.
        let _guard = PendingGuard { hub: self, id: &id };

        let frame = ServerMessage::Command {
            id: id.clone(),
            tab_id,
            timeout_ms,
            action,
        };
        let frame = serde_json::to_string(&frame)
            .map_err(|err| HubError::Internal(format!("command serialization failed: {err}")))?;

        if session.is_closed() {
            return Err(HubError::Offline);
        }
        match session.try_enqueue(frame) {
            Ok(()) => {}
            Err(EnqueueError::Full) => {
                warn!(session_id = %session.id, "outbound queue full, rejecting dispatch");
                return Err(HubError::Backpressured);
            }
            Err(EnqueueError::Closed) => return Err(HubError::Offline),
        }

        tokio::select! {
            resp = rx => resp.map_err(|_| HubError::Offline),
            () = tokio::time::sleep(timeout) => {
                debug!(correlation_id = %id, timeout_ms, "command timed out");
                Err(HubError::Timeout)
            }
            () = session.done.cancelled() => Err(HubError::Offline),
        }
    }

    /// Hands a command response to whichever caller is waiting on its
    /// correlation id. Responses with no pending entry (arriving after a
    /// timeout or cancellation) are dropped.
    pub fn handle_response(&self, resp: CommandResponse) {
        let sender = {
            let mut pending = self
                .pending
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            pending.remove(&resp.id)
        };

        match sender {
            Some(tx) => {
                if tx.send(resp).is_err() {
                    debug!("response delivered after its caller went away");
                }
            }
            None => {
                debug!(correlation_id = %resp.id, "dropping response with no pending entry");
            }
        }
    }

    fn remove_pending(&self, id: &str) {
        self.pending
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Drains the hub for shutdown: signals every session, then waits up to
    /// `drain` for in-flight requests to resolve before force-clearing the
    /// rest.
    pub async fn shutdown(&self, drain: Duration) {
        let sessions: Vec<Arc<Session>> = {
            let map = self
                .sessions
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            map.values().cloned().collect()
        };
        info!(sessions = sessions.len(), "signalling sessions to drain");
        for session in &sessions {
            session.done.cancel();
        }
        {
            self.sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }

        let deadline = tokio::time::Instant::now() + drain;
        while self.pending_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let leftover = self.pending_count();
        if leftover > 0 {
            warn!(leftover, "force-clearing pending requests at shutdown");
            self.pending
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
        info!("hub drained");
    }
}

struct PendingGuard<'a> {
    hub: &'a Hub,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.hub.remove_pending(self.id);
    }
}
