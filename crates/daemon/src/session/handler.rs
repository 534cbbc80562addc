//! Per-connection SSH event handling.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::shell::{ShellEvent, ShellProcess};
use crate::server::{auth_methods, ServerContext};
use crate::subsystem::{clamp_dimension, SubsystemKind, TerminalRequest};

/// Handles the SSH events of one client connection.
pub struct ConnectionHandler {
    id: Uuid,
    peer: Option<SocketAddr>,
    context: Arc<ServerContext>,
    user: Option<String>,
    /// Channels not yet bound to a subsystem.
    channels: HashMap<ChannelId, Channel<Msg>>,
    terminals: HashMap<ChannelId, TerminalRequest>,
    shells: HashMap<ChannelId, Arc<ShellProcess>>,
}

impl ConnectionHandler {
    pub fn new(context: Arc<ServerContext>, peer: Option<SocketAddr>) -> Self {
        let id = Uuid::new_v4();
        context.register_session(id, peer);
        debug!(session = %id, peer = ?peer, "Connection accepted");

        Self {
            id,
            peer,
            context,
            user: None,
            channels: HashMap::new(),
            terminals: HashMap::new(),
            shells: HashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    fn channel_label(&self, channel: ChannelId) -> String {
        format!("{}/{}", self.id, channel)
    }

    fn start_sftp(&mut self, channel_id: ChannelId, session: &mut Session) -> anyhow::Result<()> {
        let Some(channel) = self.channels.remove(&channel_id) else {
            warn!(session = %self.id, channel = %channel_id, "SFTP requested on a bound channel");
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        let label = self.channel_label(channel_id);
        let mut handler = self.context.registry().sftp_handler(label.clone());
        let closed = handler.on_close();
        session.channel_success(channel_id)?;
        info!(session = %self.id, channel = %channel_id, "SFTP channel started");

        // The request loop runs on its own task; this one lives until the loop drops the handler.
        self.context.tracker().spawn(async move {
            russh_sftp::server::run(channel.into_stream(), handler).await;
            let _ = closed.await;
            debug!(channel = %label, "SFTP channel finished");
        });
        Ok(())
    }

    fn start_shell(&mut self, channel_id: ChannelId, session: &mut Session) -> anyhow::Result<()> {
        if self.shells.contains_key(&channel_id) || self.channels.remove(&channel_id).is_none() {
            warn!(session = %self.id, channel = %channel_id, "Shell requested on a bound channel");
            session.channel_failure(channel_id)?;
            return Ok(());
        }

        let spec = self
            .context
            .registry()
            .shell_spec(self.terminals.get(&channel_id));
        let (shell, mut events) = match ShellProcess::spawn(spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(session = %self.id, channel = %channel_id, error = %e, "Failed to start shell");
                session.channel_failure(channel_id)?;
                return Ok(());
            }
        };
        session.channel_success(channel_id)?;
        info!(session = %self.id, channel = %channel_id, pid = ?shell.pid(), "Shell started");

        self.shells.insert(channel_id, Arc::new(shell));

        let handle = session.handle();
        self.context.tracker().spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ShellEvent::Output(data) => {
                        if handle
                            .data(channel_id, CryptoVec::from_slice(&data))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    ShellEvent::Exited(status) => {
                        let _ = handle.exit_status_request(channel_id, status).await;
                        let _ = handle.eof(channel_id).await;
                        let _ = handle.close(channel_id).await;
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    fn stop_shell(&mut self, channel_id: ChannelId) {
        if let Some(shell) = self.shells.remove(&channel_id) {
            if let Err(e) = shell.kill() {
                warn!(session = %self.id, channel = %channel_id, error = %e, "Failed to stop shell");
            }
        }
    }
}

impl russh::server::Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.context.gate().authenticate(user, password) {
            Ok(()) => {
                info!(session = %self.id, peer = ?self.peer, user, "Authenticated");
                self.context.mark_authenticated(self.id, user);
                self.user = Some(user.to_string());
                Ok(Auth::Accept)
            }
            // Keep offering password so the client may try again.
            Err(_) => Ok(Auth::Reject {
                proceed_with_methods: Some(auth_methods()),
                partial_success: false,
            }),
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.is_authenticated() {
            return Ok(false);
        }
        debug!(session = %self.id, channel = %channel.id(), "Session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match self.context.registry().bind(name) {
            Ok(SubsystemKind::Sftp) => self.start_sftp(channel_id, session),
            Ok(SubsystemKind::Shell) => self.start_shell(channel_id, session),
            Err(_) => {
                session.channel_failure(channel_id)?;
                Ok(())
            }
        }
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_shell(channel_id, session)
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(
            session = %self.id,
            channel = %channel_id,
            bytes = data.len(),
            "Refused exec request"
        );
        session.channel_failure(channel_id)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(session = %self.id, channel = %channel_id, term, col_width, row_height, "PTY request");
        self.terminals
            .insert(channel_id, TerminalRequest::new(term, col_width, row_height));
        session.channel_success(channel_id)?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(shell) = self.shells.get(&channel_id) {
            let cols = clamp_dimension(col_width, super::shell::DEFAULT_COLS);
            let rows = clamp_dimension(row_height, super::shell::DEFAULT_ROWS);
            if let Err(e) = shell.resize(cols, rows) {
                debug!(session = %self.id, channel = %channel_id, error = %e, "Resize ignored");
            }
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(shell) = self.shells.get(&channel_id) {
            if let Err(e) = shell.write(data).await {
                debug!(session = %self.id, channel = %channel_id, error = %e, "Dropped shell input");
            }
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(session = %self.id, channel = %channel_id, "Channel closed");
        self.channels.remove(&channel_id);
        self.terminals.remove(&channel_id);
        self.stop_shell(channel_id);
        Ok(())
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        let channels: Vec<ChannelId> = self.shells.keys().copied().collect();
        for channel_id in channels {
            self.stop_shell(channel_id);
        }
        self.context.remove_session(self.id);
        info!(session = %self.id, peer = ?self.peer, user = ?self.user, "Connection closed");
    }
}
