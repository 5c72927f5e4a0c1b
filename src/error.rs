//! Error taxonomy shared by every storage backend.
//!
//! Backend-native failures (POSIX errnos, S3 error codes, Swift HTTP
//! statuses, RADOS return values) are translated at the backend boundary
//! into a [`HelperError`]: a cloneable value carrying a coarse
//! [`ErrorKind`], the underlying platform code when one exists, and a
//! short context string. Errors are values at the public API boundary;
//! nothing in this crate unwinds across it.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Coarse classification of a storage operation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    InvalidArgument,
    TimedOut,
    HostUnreachable,
    NetworkUnreachable,
    IoError,
    NotSupported,
    AlreadyExists,
    IsDirectory,
    NotDirectory,
    NoSpace,
    Cancelled,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::TimedOut => "timed out",
            ErrorKind::HostUnreachable => "host unreachable",
            ErrorKind::NetworkUnreachable => "network unreachable",
            ErrorKind::IoError => "I/O error",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::IsDirectory => "is a directory",
            ErrorKind::NotDirectory => "not a directory",
            ErrorKind::NoSpace => "no space left",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single terminal error returned by a storage operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{context}: {kind}{}", errno_suffix(.errno))]
pub struct HelperError {
    kind: ErrorKind,
    errno: Option<i32>,
    context: String,
}

fn errno_suffix(errno: &Option<i32>) -> String {
    match errno {
        Some(errno) => format!(" (os error {errno})"),
        None => String::new(),
    }
}

impl HelperError {
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            errno: None,
            context: context.into(),
        }
    }

    pub fn with_errno(kind: ErrorKind, errno: i32, context: impl Into<String>) -> Self {
        Self {
            kind,
            errno: Some(errno),
            context: context.into(),
        }
    }

    /// Classifies a raw errno into the common taxonomy.
    pub fn from_errno(errno: i32, context: impl Into<String>) -> Self {
        Self::with_errno(kind_for_errno(errno), errno, context)
    }

    /// Translates the failure recorded in a [`std::io::Error`].
    pub fn from_io(err: &std::io::Error, context: impl Into<String>) -> Self {
        match err.raw_os_error() {
            Some(errno) => Self::from_errno(errno, context),
            None => {
                let kind = match err.kind() {
                    std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                    std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                    std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
                    std::io::ErrorKind::InvalidInput => ErrorKind::InvalidArgument,
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                        ErrorKind::TimedOut
                    }
                    std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionReset => ErrorKind::HostUnreachable,
                    _ => ErrorKind::IoError,
                };
                Self::new(kind, context)
            }
        }
    }

    pub fn not_supported(operation: &str) -> Self {
        Self::new(ErrorKind::NotSupported, operation)
    }

    pub fn invalid_argument(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, context)
    }

    pub fn timed_out(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::TimedOut, context)
    }

    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, context)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn errno(&self) -> Option<i32> {
        self.errno
    }

    pub fn context(&self) -> &str {
        &self.context
    }
}

/// errno → taxonomy mapping applied at the POSIX and RADOS boundaries.
pub fn kind_for_errno(errno: i32) -> ErrorKind {
    match errno {
        libc::ENOENT => ErrorKind::NotFound,
        libc::EACCES | libc::EPERM => ErrorKind::PermissionDenied,
        libc::EINVAL => ErrorKind::InvalidArgument,
        libc::ETIMEDOUT => ErrorKind::TimedOut,
        libc::EHOSTUNREACH | libc::ECONNREFUSED => ErrorKind::HostUnreachable,
        libc::ENETUNREACH | libc::ENETDOWN => ErrorKind::NetworkUnreachable,
        libc::EEXIST => ErrorKind::AlreadyExists,
        libc::EISDIR => ErrorKind::IsDirectory,
        libc::ENOTDIR => ErrorKind::NotDirectory,
        libc::ENOSPC | libc::EDQUOT => ErrorKind::NoSpace,
        libc::ECANCELED => ErrorKind::Cancelled,
        libc::ENOTSUP => ErrorKind::NotSupported,
        _ => ErrorKind::IoError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_the_taxonomy() {
        assert_eq!(kind_for_errno(libc::ENOENT), ErrorKind::NotFound);
        assert_eq!(kind_for_errno(libc::EPERM), ErrorKind::PermissionDenied);
        assert_eq!(kind_for_errno(libc::EEXIST), ErrorKind::AlreadyExists);
        assert_eq!(kind_for_errno(libc::ENOSPC), ErrorKind::NoSpace);
        assert_eq!(kind_for_errno(libc::EISDIR), ErrorKind::IsDirectory);
        assert_eq!(kind_for_errno(libc::EBADF), ErrorKind::IoError);
    }

    #[test]
    fn display_includes_errno_when_present() {
        let err = HelperError::from_errno(libc::ENOENT, "getattr /a");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "getattr /a: not found (os error 2)");
        let plain = HelperError::not_supported("symlink");
        assert_eq!(plain.to_string(), "symlink: not supported");
    }

    #[test]
    fn io_error_without_errno_maps_by_io_kind() {
        let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(HelperError::from_io(&err, "read").kind(), ErrorKind::TimedOut);
    }
}
