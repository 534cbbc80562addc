//! Channel subsystem dispatch.
//!
//! Each session channel asks for one subsystem by name. The registry knows
//! two: `sftp`, served by [`SftpHandler`], and `shell`, served by a PTY-backed
//! process. Anything else is refused for that channel only; the connection
//! and its other channels keep running.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::files::{AccessPolicy, FilesystemScope, SftpHandler};
use crate::pool::WorkerPool;
use crate::session::shell::{ShellSpec, DEFAULT_COLS, DEFAULT_ROWS};

/// Subsystems a channel can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubsystemKind {
    Sftp,
    Shell,
}

impl SubsystemKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sftp" => Some(SubsystemKind::Sftp),
            "shell" => Some(SubsystemKind::Shell),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SubsystemKind::Sftp => "sftp",
            SubsystemKind::Shell => "shell",
        }
    }
}

impl std::fmt::Display for SubsystemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A channel asked for a subsystem the server does not provide.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown subsystem: {0}")]
pub struct UnknownSubsystem(pub String);

/// Terminal parameters requested by the client before starting a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalRequest {
    pub term: String,
    pub cols: u16,
    pub rows: u16,
}

impl TerminalRequest {
    /// Builds a request from raw `pty-req` values, clamping zero or oversized
    /// dimensions to the defaults.
    pub fn new(term: &str, cols: u32, rows: u32) -> Self {
        Self {
            term: term.to_string(),
            cols: clamp_dimension(cols, DEFAULT_COLS),
            rows: clamp_dimension(rows, DEFAULT_ROWS),
        }
    }
}

pub(crate) fn clamp_dimension(value: u32, default: u16) -> u16 {
    match u16::try_from(value) {
        Ok(0) | Err(_) => default,
        Ok(v) => v,
    }
}

/// Resources shared by every channel of every connection.
#[derive(Debug, Clone)]
pub struct SubsystemRegistry {
    scope: Arc<FilesystemScope>,
    policy: AccessPolicy,
    pool: WorkerPool,
    shell_program: String,
}

impl SubsystemRegistry {
    pub fn new(
        scope: Arc<FilesystemScope>,
        policy: AccessPolicy,
        pool: WorkerPool,
        shell_program: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            policy,
            pool,
            shell_program: shell_program.into(),
        }
    }

    /// Looks up the subsystem a channel asked for.
    pub fn bind(&self, name: &str) -> Result<SubsystemKind, UnknownSubsystem> {
        match SubsystemKind::from_name(name) {
            Some(kind) => {
                debug!(subsystem = %kind, "Subsystem bound");
                Ok(kind)
            }
            None => {
                warn!(subsystem = name, "Rejected unknown subsystem");
                Err(UnknownSubsystem(name.to_string()))
            }
        }
    }

    /// Creates the request handler for a new SFTP channel.
    pub fn sftp_handler(&self, label: impl Into<String>) -> SftpHandler {
        SftpHandler::new(
            Arc::clone(&self.scope),
            self.policy,
            self.pool.clone(),
            label,
        )
    }

    /// Describes the process to start for a shell channel.
    pub fn shell_spec(&self, terminal: Option<&TerminalRequest>) -> ShellSpec {
        ShellSpec {
            program: self.shell_program.clone(),
            cwd: self.scope.root().to_path_buf(),
            term: terminal.map(|t| t.term.clone()),
            cols: terminal.map_or(DEFAULT_COLS, |t| t.cols),
            rows: terminal.map_or(DEFAULT_ROWS, |t| t.rows),
        }
    }

    pub fn root(&self) -> &Path {
        self.scope.root()
    }

    pub fn policy(&self) -> AccessPolicy {
        self.policy
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}
