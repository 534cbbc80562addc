//! # sshdaemon Library
//!
//! This crate provides a single-user SSH server that exposes one directory
//! tree over SFTP and offers an interactive shell.
//!
//! ## Overview
//!
//! - **Authentication**: exactly one configured username/password pair
//! - **File Access**: every SFTP path is confined to the configured root,
//!   with an optional global read-only mode
//! - **Bounded Work**: all SFTP filesystem calls share one fixed-size pool
//! - **Shell**: PTY-backed shell started in the root directory
//! - **Lifecycle**: start/stop state machine with a bounded drain
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Daemon                               │
//! │   host key (hostkey crate)      TcpListener + accept loop    │
//! ├──────────────────────────────────────────────────────────────┤
//! │                      ServerContext                           │
//! │  ┌────────────────────┐   ┌───────────────────────────────┐  │
//! │  │ AuthenticationGate │   │       SubsystemRegistry       │  │
//! │  └────────────────────┘   │  sftp ──► SftpHandler         │  │
//! │                           │  shell ─► ShellProcess (PTY)  │  │
//! │                           └───────────────────────────────┘  │
//! │  ┌─────────────────┐ ┌──────────────┐ ┌──────────────────┐   │
//! │  │ FilesystemScope │ │ AccessPolicy │ │    WorkerPool    │   │
//! │  └─────────────────┘ └──────────────┘ └──────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Daemon, ServerConfiguration};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = ServerConfiguration::default();
//!     config.files.root_dir = "/srv/files".into();
//!
//!     let daemon = Daemon::new(config);
//!     let addr = daemon.start().await?;
//!     println!("listening on {addr}");
//!
//!     // Wait for shutdown signal...
//!
//!     daemon.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`auth`]: Credential check
//! - [`files`]: Path confinement, read-only policy and the SFTP handler
//! - [`pool`]: Shared worker pool
//! - [`session`]: Per-connection handler and shell processes
//! - [`subsystem`]: Channel subsystem dispatch
//! - [`server`]: Transport configuration and shared server state
//! - [`orchestrator`]: Daemon lifecycle

pub mod auth;
pub mod config;
pub mod files;
pub mod orchestrator;
pub mod pool;
pub mod server;
pub mod session;
pub mod subsystem;

pub use auth::{AuthenticationError, AuthenticationGate};
pub use config::{ConfigError, ServerConfiguration, DEFAULT_PORT};
pub use orchestrator::{Daemon, DaemonEvent, LifecycleError, LifecycleState};
pub use pool::{PoolError, WorkerPool};
pub use subsystem::{SubsystemKind, SubsystemRegistry, UnknownSubsystem};
