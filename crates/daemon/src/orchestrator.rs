//! Daemon lifecycle.
//!
//! [`Daemon`] wires the host key, the file scope, the worker pool and the SSH
//! listener together and walks the state machine
//! `Stopped → Initializing → Listening → Stopping → Stopped`.
//!
//! Shutdown closes the listener first, then gives open sessions up to the
//! configured drain timeout before their tasks are cancelled.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hostkey::{HostKeyPair, KeyError};
use russh::server::Server as _;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::AuthenticationGate;
use crate::config::{ConfigError, ServerConfiguration};
use crate::files::{AccessPolicy, AccessScopeError, FilesystemScope};
use crate::pool::WorkerPool;
use crate::server::{transport_config, ServerContext, SshServer};
use crate::session::ConnectionHandler;
use crate::subsystem::SubsystemRegistry;

/// Time cancelled sessions get to release their resources.
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not started, or fully stopped.
    Stopped,
    /// Loading the host key and binding the listener.
    Initializing,
    /// Accepting connections.
    Listening,
    /// Draining open sessions.
    Stopping,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Listening => "listening",
            LifecycleState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Events emitted by the daemon.
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    /// Lifecycle state changed.
    StateChanged(LifecycleState),
    /// A client connected.
    SessionOpened { id: Uuid, peer: Option<SocketAddr> },
    /// A client connection ended.
    SessionClosed { id: Uuid },
    /// Startup failed.
    Error { message: String },
}

/// Lifecycle errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("daemon is already running (state: {0})")]
    AlreadyRunning(LifecycleState),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("host key unavailable: {0}")]
    HostKey(#[from] KeyError),

    #[error("invalid root directory: {0}")]
    Root(#[from] AccessScopeError),

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("startup task failed: {0}")]
    Task(String),
}

/// Resources that exist only while listening.
struct Running {
    local_addr: SocketAddr,
    fingerprint: String,
    context: Arc<ServerContext>,
    pool: WorkerPool,
    accept_task: JoinHandle<()>,
    /// Stops the accept loop.
    shutdown: CancellationToken,
    /// Aborts sessions still open after the drain.
    abort: CancellationToken,
}

/// The SSH daemon.
pub struct Daemon {
    config: ServerConfiguration,
    state: Arc<RwLock<LifecycleState>>,
    running: Mutex<Option<Running>>,
    event_tx: broadcast::Sender<DaemonEvent>,
}

impl Daemon {
    /// Creates a stopped daemon that owns `config`.
    pub fn new(config: ServerConfiguration) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            state: Arc::new(RwLock::new(LifecycleState::Stopped)),
            running: Mutex::new(None),
            event_tx,
        }
    }

    pub fn config(&self) -> &ServerConfiguration {
        &self.config
    }

    /// Returns the current state.
    pub async fn state(&self) -> LifecycleState {
        *self.state.read().await
    }

    /// Returns a receiver for daemon events.
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.event_tx.subscribe()
    }

    /// Address the listener is bound to, while listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// SHA-256 fingerprint of the host key, while listening.
    pub async fn fingerprint(&self) -> Option<String> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.fingerprint.clone())
    }

    /// The shared worker pool, while listening.
    pub async fn pool(&self) -> Option<WorkerPool> {
        self.running.lock().await.as_ref().map(|r| r.pool.clone())
    }

    /// Number of open client connections.
    pub async fn session_count(&self) -> usize {
        self.running
            .lock()
            .await
            .as_ref()
            .map_or(0, |r| r.context.session_count())
    }

    /// Number of tracked connection and channel tasks still running.
    pub async fn active_tasks(&self) -> usize {
        self.running
            .lock()
            .await
            .as_ref()
            .map_or(0, |r| r.context.tracker().len())
    }

    /// Loads the host key, binds the listener and starts accepting.
    pub async fn start(&self) -> Result<SocketAddr, LifecycleError> {
        let mut running = self.running.lock().await;
        {
            let mut state = self.state.write().await;
            if *state != LifecycleState::Stopped {
                return Err(LifecycleError::AlreadyRunning(*state));
            }
            *state = LifecycleState::Initializing;
        }
        self.emit_event(DaemonEvent::StateChanged(LifecycleState::Initializing));

        info!("Starting sshdaemon...");

        match self.initialize().await {
            Ok(started) => {
                let addr = started.local_addr;
                *running = Some(started);
                self.set_state(LifecycleState::Listening).await;
                info!(address = %addr, "Listening for SSH connections");
                Ok(addr)
            }
            Err(e) => {
                error!(error = %e, "Failed to start");
                self.emit_event(DaemonEvent::Error {
                    message: e.to_string(),
                });
                self.set_state(LifecycleState::Stopped).await;
                Err(e)
            }
        }
    }

    async fn initialize(&self) -> Result<Running, LifecycleError> {
        self.config.validate_allow_ephemeral()?;

        hostkey::provider::bootstrap();

        let root: PathBuf = self.config.files.root_dir.clone();
        let bits = self.config.host_key.bits;
        let key_root = root.clone();
        let host_key =
            tokio::task::spawn_blocking(move || HostKeyPair::load_or_generate(&key_root, bits))
                .await
                .map_err(|e| LifecycleError::Task(e.to_string()))??;
        info!(
            fingerprint = host_key.fingerprint(),
            path = %host_key.path().display(),
            "Host key ready"
        );

        let scope = Arc::new(FilesystemScope::new(&root)?.with_reserved(hostkey::KEY_DIR));
        let policy = AccessPolicy::new(self.config.files.read_only);
        if policy.is_read_only() {
            info!("Serving files read-only");
        }
        let pool = WorkerPool::for_host();

        let registry = SubsystemRegistry::new(
            scope,
            policy,
            pool.clone(),
            self.config.shell.program.clone(),
        );
        let gate = AuthenticationGate::from_config(&self.config.auth);
        let context = Arc::new(ServerContext::new(gate, registry, self.event_tx.clone()));

        let addr = self.config.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| LifecycleError::Listen { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| LifecycleError::Listen { addr, source })?;

        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::new(transport_config(&host_key)),
            SshServer::new(Arc::clone(&context)),
            Arc::clone(&context),
            shutdown.clone(),
            abort.clone(),
        ));

        Ok(Running {
            local_addr,
            fingerprint: host_key.fingerprint().to_string(),
            context,
            pool,
            accept_task,
            shutdown,
            abort,
        })
    }

    /// Stops accepting, drains open sessions and releases resources.
    ///
    /// Does nothing when the daemon is already stopped.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let mut running = self.running.lock().await;
        {
            let mut state = self.state.write().await;
            if *state == LifecycleState::Stopped {
                return Ok(());
            }
            *state = LifecycleState::Stopping;
        }
        self.emit_event(DaemonEvent::StateChanged(LifecycleState::Stopping));

        info!("Stopping sshdaemon...");

        if let Some(running) = running.take() {
            running.shutdown.cancel();
            if let Err(e) = running.accept_task.await {
                warn!(error = %e, "Accept loop ended abnormally");
            }

            let tracker = running.context.tracker();
            tracker.close();

            let drain = self.config.drain_timeout();
            let open = running.context.session_count();
            if open > 0 {
                info!(sessions = open, timeout_secs = drain.as_secs(), "Draining sessions");
            }

            if tokio::time::timeout(drain, tracker.wait()).await.is_err() {
                warn!(
                    sessions = running.context.session_count(),
                    tasks = tracker.len(),
                    "Drain timeout elapsed, closing remaining sessions"
                );
                running.abort.cancel();
                if tokio::time::timeout(FORCE_CLOSE_GRACE, tracker.wait())
                    .await
                    .is_err()
                {
                    warn!(tasks = tracker.len(), "Tasks still running after abort");
                }
            }

            running.pool.close();
        }

        self.set_state(LifecycleState::Stopped).await;
        info!("sshdaemon stopped");
        Ok(())
    }

    async fn set_state(&self, new_state: LifecycleState) {
        *self.state.write().await = new_state;
        self.emit_event(DaemonEvent::StateChanged(new_state));
    }

    fn emit_event(&self, event: DaemonEvent) {
        let _ = self.event_tx.send(event);
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<russh::server::Config>,
    mut server: SshServer,
    context: Arc<ServerContext>,
    shutdown: CancellationToken,
    abort: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Accept loop received shutdown signal");
                break;
            }
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };

                if let Err(e) = socket.set_nodelay(true) {
                    debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                }

                let handler = server.new_client(Some(peer));
                let config = Arc::clone(&config);
                let abort = abort.clone();
                context.tracker().spawn(async move {
                    tokio::select! {
                        _ = serve_connection(config, socket, handler, peer) => {}
                        _ = abort.cancelled() => {
                            info!(peer = %peer, "Connection closed by shutdown");
                        }
                    }
                });
            }
        }
    }
}

/// Runs one connection from the banner exchange until it closes.
async fn serve_connection(
    config: Arc<russh::server::Config>,
    socket: TcpStream,
    handler: ConnectionHandler,
    peer: SocketAddr,
) {
    let session = match russh::server::run_stream(config, socket, handler).await {
        Ok(session) => session,
        Err(e) => {
            warn!(peer = %peer, error = %e, "SSH handshake failed");
            return;
        }
    };

    match session.await {
        Ok(()) => debug!(peer = %peer, "Connection closed cleanly"),
        Err(e) => debug!(peer = %peer, error = %e, "Connection ended with error"),
    }
}
