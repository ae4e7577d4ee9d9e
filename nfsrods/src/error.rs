use thiserror::Error;

use crate::inode::Handle;
use crate::remote::RemoteError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by the handle table, sessions and the VFS adapter.
#[derive(Debug, Error)]
pub enum Error {
    /// Unmapped handle or path, or a target the remote store does not have.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate insert into a handle table.
    #[error("mapping conflict: handle {handle} or path {path} is already mapped")]
    Conflict { handle: Handle, path: String },

    /// The handle table disagrees with itself. Fails only the offending call.
    #[error("handle table invariant violated: {0}")]
    InvariantViolation(String),

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("invalid name {0:?}")]
    InvalidName(String),

    #[error("malformed file handle ({0} bytes)")]
    BadHandle(usize),

    #[error("remote operation failed: {0}")]
    Remote(#[source] RemoteError),
}

impl Error {
    /// POSIX errno handed back to the protocol engine.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::Conflict { .. } => libc::EEXIST,
            Error::InvariantViolation(_) => libc::EIO,
            Error::NotSupported(_) => libc::EOPNOTSUPP,
            Error::InvalidName(_) => libc::EINVAL,
            Error::BadHandle(_) => libc::EBADF,
            Error::Remote(e) => e.errno(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        // Negative lookups rely on this exact signal.
        match e {
            RemoteError::NotFound(path) => Error::NotFound(path),
            other => Error::Remote(other),
        }
    }
}
