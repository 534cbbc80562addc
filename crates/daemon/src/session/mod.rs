//! Connection and channel handling.
//!
//! This module provides the per-connection SSH handler and the PTY-backed
//! shell processes it starts for interactive channels.

pub mod handler;
pub mod shell;

pub use handler::ConnectionHandler;
pub use shell::{ShellError, ShellEvent, ShellProcess, ShellSpec};
