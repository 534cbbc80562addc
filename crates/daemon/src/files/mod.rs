//! Sandboxed file access for SFTP channels.
//!
//! This module provides:
//! - Root-confined path resolution ([`scope`])
//! - The global read-only policy ([`policy`])
//! - The SFTP request handler built on both ([`sftp`])
//!
//! # Security
//!
//! Every path is normalized and canonicalized before it is checked against
//! the root, and every mutating request is vetted by the policy before any
//! filesystem call is made.

pub mod policy;
pub mod scope;
pub mod sftp;

pub use policy::{AccessPolicy, OperationKind, PermissionError};
pub use scope::{AccessScopeError, FilesystemScope};
pub use sftp::{SftpError, SftpHandler};
