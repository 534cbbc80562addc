//! Interactive shell processes behind a pseudo-terminal.
//!
//! A [`ShellProcess`] owns one child process spawned in a PTY. Input is fed
//! through an ordered queue to a dedicated writer thread; output and the
//! final exit status arrive on the [`ShellEvent`] receiver returned by
//! [`ShellProcess::spawn`].

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Queue depth between the channel and the PTY, in both directions.
const QUEUE_CAPACITY: usize = 64;

/// Terminal size used when the client sent no `pty-req`.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Errors that can occur while driving a shell.
#[derive(Error, Debug)]
pub enum ShellError {
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),

    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    #[error("failed to kill shell: {0}")]
    KillFailed(String),

    #[error("shell already terminated")]
    Terminated,
}

/// Output of a running shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// Bytes written by the process to its terminal.
    Output(Vec<u8>),
    /// The process exited with this status.
    Exited(u32),
}

/// What to run and how the terminal looks.
#[derive(Debug, Clone)]
pub struct ShellSpec {
    pub program: String,
    pub cwd: PathBuf,
    pub term: Option<String>,
    pub cols: u16,
    pub rows: u16,
}

/// A shell process attached to a PTY.
pub struct ShellProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    input_tx: mpsc::Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl ShellProcess {
    /// Spawns the shell and starts its I/O threads.
    pub fn spawn(spec: ShellSpec) -> Result<(Self, mpsc::Receiver<ShellEvent>), ShellError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ShellError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.cwd(&spec.cwd);
        if let Some(term) = &spec.term {
            cmd.env("TERM", term);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ShellError::SpawnFailed(e.to_string()))?;
        let pid = child.process_id();
        // The child holds its own copy of the slave side.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ShellError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ShellError::SpawnFailed(e.to_string()))?;

        let (input_tx, input_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(QUEUE_CAPACITY);

        let shell = ShellProcess {
            master: Mutex::new(pair.master),
            child: Arc::new(Mutex::new(child)),
            input_tx,
            running: Arc::new(AtomicBool::new(true)),
            pid,
        };

        tokio::task::spawn_blocking(move || write_loop(writer, input_rx));

        let child = Arc::clone(&shell.child);
        let running = Arc::clone(&shell.running);
        tokio::task::spawn_blocking(move || read_loop(reader, child, running, pid, event_tx));

        tracing::debug!(pid = ?pid, program = %spec.program, "Spawned shell");
        Ok((shell, event_rx))
    }

    /// Process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queues input for the shell's terminal.
    pub async fn write(&self, data: &[u8]) -> Result<(), ShellError> {
        if !self.is_running() {
            return Err(ShellError::Terminated);
        }
        self.input_tx
            .send(data.to_vec())
            .await
            .map_err(|_| ShellError::Terminated)
    }

    /// Resizes the terminal.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), ShellError> {
        if !self.is_running() {
            return Err(ShellError::Terminated);
        }

        let master = self.master.lock().map_err(|_| ShellError::Terminated)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ShellError::ResizeFailed(e.to_string()))?;

        tracing::debug!(pid = ?self.pid, cols, rows, "Resized PTY");
        Ok(())
    }

    /// Terminates the process if it is still running.
    pub fn kill(&self) -> Result<(), ShellError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut child = self.child.lock().map_err(|_| ShellError::Terminated)?;
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }
        child
            .kill()
            .map_err(|e| ShellError::KillFailed(e.to_string()))?;
        tracing::debug!(pid = ?self.pid, "Killed shell");
        Ok(())
    }
}

impl Drop for ShellProcess {
    fn drop(&mut self) {
        if let Err(e) = self.kill() {
            tracing::warn!(pid = ?self.pid, error = %e, "Failed to kill shell on drop");
        }
    }
}

fn write_loop(mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = input_rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            tracing::debug!(error = %e, "PTY write failed, stopping input");
            break;
        }
    }
}

fn read_loop(
    mut reader: Box<dyn Read + Send>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    running: Arc<AtomicBool>,
    pid: Option<u32>,
    event_tx: mpsc::Sender<ShellEvent>,
) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if event_tx
                    .blocking_send(ShellEvent::Output(buffer[..n].to_vec()))
                    .is_err()
                {
                    break;
                }
            }
            // Linux reports EIO once the slave side is closed.
            Err(e) => {
                tracing::trace!(pid = ?pid, error = %e, "PTY read ended");
                break;
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    let status = match child.lock() {
        Ok(mut child) => child.wait().map(|s| s.exit_code()).unwrap_or(1),
        Err(_) => 1,
    };
    tracing::debug!(pid = ?pid, status, "Shell exited");
    let _ = event_tx.blocking_send(ShellEvent::Exited(status));
}
