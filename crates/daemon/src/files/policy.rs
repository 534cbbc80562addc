//! Read-only access policy.
//!
//! The policy is a single flag fixed at startup and shared by every channel.
//! When it is set, every operation kind other than [`OperationKind::Read`] is
//! refused with a [`PermissionError`], which the SFTP layer reports to the
//! client as `SSH_FX_PERMISSION_DENIED`.

use thiserror::Error;

/// Kinds of filesystem operation subject to the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Write,
    Create,
    Truncate,
    Delete,
    Rename,
    SetAttributes,
}

impl OperationKind {
    /// Every operation kind.
    pub const ALL: [OperationKind; 7] = [
        Self::Read,
        Self::Write,
        Self::Create,
        Self::Truncate,
        Self::Delete,
        Self::Rename,
        Self::SetAttributes,
    ];

    /// Whether the operation changes the filesystem.
    pub fn is_mutating(self) -> bool {
        !matches!(self, Self::Read)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Create => "create",
            Self::Truncate => "truncate",
            Self::Delete => "delete",
            Self::Rename => "rename",
            Self::SetAttributes => "set-attributes",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation refused by the read-only policy.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("{operation} not permitted: server is read-only")]
pub struct PermissionError {
    pub operation: OperationKind,
}

/// Global access policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessPolicy {
    read_only: bool,
}

impl AccessPolicy {
    pub fn new(read_only: bool) -> Self {
        Self { read_only }
    }

    pub fn read_only() -> Self {
        Self::new(true)
    }

    pub fn read_write() -> Self {
        Self::new(false)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Allows or denies a single operation.
    pub fn authorize(&self, operation: OperationKind) -> Result<(), PermissionError> {
        if self.read_only && operation.is_mutating() {
            return Err(PermissionError { operation });
        }
        Ok(())
    }

    /// Allows a compound request only if every part is allowed.
    ///
    /// The first denied kind is reported.
    pub fn authorize_all(&self, operations: &[OperationKind]) -> Result<(), PermissionError> {
        operations.iter().try_for_each(|&op| self.authorize(op))
    }
}
