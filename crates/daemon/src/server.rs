//! SSH transport wiring.
//!
//! [`ServerContext`] is the state every connection shares: the credential
//! gate, the subsystem registry, the table of live sessions and the task
//! tracker used to drain them on shutdown. [`SshServer`] hands each accepted
//! socket a fresh [`ConnectionHandler`].

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use hostkey::HostKeyPair;
use russh::server::Config;
use russh::{cipher, compression, MethodKind, MethodSet, Preferred};
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};
use uuid::Uuid;

use crate::auth::AuthenticationGate;
use crate::orchestrator::DaemonEvent;
use crate::session::ConnectionHandler;
use crate::subsystem::SubsystemRegistry;

/// Delay before answering a failed authentication attempt.
pub const AUTH_REJECTION_DELAY: Duration = Duration::from_secs(1);

/// Symmetric ciphers offered to clients, strongest first.
pub const CIPHERS: &[cipher::Name] = &[
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
    cipher::AES_128_GCM,
];

/// Compression methods offered to clients. Uncompressed transport is not offered.
pub const COMPRESSION: &[compression::Name] = &[compression::ZLIB_LEGACY, compression::ZLIB];

/// Authentication methods offered to clients, both initially and after a
/// rejected attempt.
pub fn auth_methods() -> MethodSet {
    MethodSet::from(&[MethodKind::Password][..])
}

/// Builds the transport configuration around the host key.
pub fn transport_config(host_key: &HostKeyPair) -> Config {
    let mut config = Config {
        methods: auth_methods(),
        auth_rejection_time: AUTH_REJECTION_DELAY,
        auth_rejection_time_initial: Some(Duration::ZERO),
        preferred: Preferred {
            cipher: Cow::Borrowed(CIPHERS),
            compression: Cow::Borrowed(COMPRESSION),
            ..Preferred::default()
        },
        ..Default::default()
    };
    config.keys.push(host_key.private_key().clone());
    config
}

/// A connection tracked by the server.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer: Option<SocketAddr>,
    pub user: Option<String>,
    pub connected_at: Instant,
}

/// State shared by all connections.
pub struct ServerContext {
    gate: AuthenticationGate,
    registry: SubsystemRegistry,
    sessions: DashMap<Uuid, SessionInfo>,
    tracker: TaskTracker,
    events: broadcast::Sender<DaemonEvent>,
}

impl ServerContext {
    pub fn new(
        gate: AuthenticationGate,
        registry: SubsystemRegistry,
        events: broadcast::Sender<DaemonEvent>,
    ) -> Self {
        Self {
            gate,
            registry,
            sessions: DashMap::new(),
            tracker: TaskTracker::new(),
            events,
        }
    }

    pub fn gate(&self) -> &AuthenticationGate {
        &self.gate
    }

    pub fn registry(&self) -> &SubsystemRegistry {
        &self.registry
    }

    /// Tracker for connection and channel tasks.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Number of open connections.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot of the open connections.
    pub fn sessions(&self) -> Vec<(Uuid, SessionInfo)> {
        self.sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub(crate) fn register_session(&self, id: Uuid, peer: Option<SocketAddr>) {
        self.sessions.insert(
            id,
            SessionInfo {
                peer,
                user: None,
                connected_at: Instant::now(),
            },
        );
        let _ = self.events.send(DaemonEvent::SessionOpened { id, peer });
    }

    pub(crate) fn mark_authenticated(&self, id: Uuid, user: &str) {
        if let Some(mut info) = self.sessions.get_mut(&id) {
            info.user = Some(user.to_string());
        }
    }

    pub(crate) fn remove_session(&self, id: Uuid) {
        if let Some((_, info)) = self.sessions.remove(&id) {
            debug!(
                session = %id,
                peer = ?info.peer,
                duration_ms = info.connected_at.elapsed().as_millis() as u64,
                "Session removed"
            );
            let _ = self.events.send(DaemonEvent::SessionClosed { id });
        }
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("gate", &self.gate)
            .field("sessions", &self.sessions.len())
            .field("tasks", &self.tracker.len())
            .finish()
    }
}

/// Creates one [`ConnectionHandler`] per accepted socket.
#[derive(Clone)]
pub struct SshServer {
    context: Arc<ServerContext>,
}

impl SshServer {
    pub fn new(context: Arc<ServerContext>) -> Self {
        Self { context }
    }
}

impl russh::server::Server for SshServer {
    type Handler = ConnectionHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        ConnectionHandler::new(Arc::clone(&self.context), peer_addr)
    }

    fn handle_session_error(&mut self, error: <Self::Handler as russh::server::Handler>::Error) {
        error!(error = %error, "Session error");
    }
}
