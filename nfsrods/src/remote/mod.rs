//! Seam to the path-addressed data store.
//!
//! The store is addressed by absolute paths and holds two kinds of entries,
//! collections and data objects. Sessions reach it through a
//! [`RemoteConnection`] obtained from a [`RemoteConnector`].

pub mod local;
pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;

pub use local::LocalStore;
pub use memory::MemoryStore;

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{0}: no such collection or data object")]
    NotFound(String),
    #[error("{0}: already exists")]
    AlreadyExists(String),
    #[error("{0}: collection is not empty")]
    NotEmpty(String),
    #[error("{0}: permission denied")]
    PermissionDenied(String),
    #[error("{0}: not a collection")]
    NotACollection(String),
    #[error("{0}: is a collection")]
    IsACollection(String),
    #[error("cannot connect to {endpoint} as {user}: {reason}")]
    Connect {
        endpoint: String,
        user: String,
        reason: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub fn errno(&self) -> i32 {
        match self {
            RemoteError::NotFound(_) => libc::ENOENT,
            RemoteError::AlreadyExists(_) => libc::EEXIST,
            RemoteError::NotEmpty(_) => libc::ENOTEMPTY,
            RemoteError::PermissionDenied(_) => libc::EACCES,
            RemoteError::NotACollection(_) => libc::ENOTDIR,
            RemoteError::IsACollection(_) => libc::EISDIR,
            RemoteError::Connect { .. } | RemoteError::Io(_) => libc::EIO,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Collection,
    DataObject,
    /// Placeholder for a collection the caller cannot see into, typically
    /// an ancestor of the mount point.
    Standin,
}

impl EntityKind {
    pub fn is_collection(self) -> bool {
        !matches!(self, EntityKind::DataObject)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjStat {
    pub kind: EntityKind,
    pub size: u64,
    pub created_at: SystemTime,
    pub modified_at: SystemTime,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListingEntry {
    pub name: String,
    pub stat: ObjStat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    Null,
    Read,
    Write,
    Own,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrincipalScope {
    User,
    Group,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AclEntry {
    pub principal: String,
    pub scope: PrincipalScope,
    pub level: AccessLevel,
}

impl AclEntry {
    pub fn user(principal: impl Into<String>, level: AccessLevel) -> Self {
        Self { principal: principal.into(), scope: PrincipalScope::User, level }
    }

    pub fn group(principal: impl Into<String>, level: AccessLevel) -> Self {
        Self { principal: principal.into(), scope: PrincipalScope::Group, level }
    }
}

/// Credentials and placement for one connection. Sessions log in as the
/// proxy account and act on behalf of `user`.
#[derive(Clone)]
pub struct RemoteAccount {
    pub host: String,
    pub port: u16,
    pub zone: String,
    pub user: String,
    pub proxy_user: String,
    pub proxy_password: String,
    pub default_resource: Option<String>,
    pub home: String,
}

impl RemoteAccount {
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.zone)
    }
}

impl fmt::Debug for RemoteAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAccount")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("zone", &self.zone)
            .field("user", &self.user)
            .field("proxy_user", &self.proxy_user)
            .field("proxy_password", &"<redacted>")
            .field("default_resource", &self.default_resource)
            .field("home", &self.home)
            .finish()
    }
}

pub trait RemoteConnector: Send + Sync {
    fn connect(&self, account: &RemoteAccount) -> RemoteResult<Arc<dyn RemoteConnection>>;
}

/// Operations one session issues against the store. Paths are absolute
/// and normalized.
pub trait RemoteConnection: Send + Sync {
    fn stat(&self, path: &str) -> RemoteResult<ObjStat>;

    fn exists(&self, path: &str) -> RemoteResult<bool> {
        match self.stat(path) {
            Ok(_) => Ok(true),
            Err(RemoteError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Children of a collection, in the store's order.
    fn list(&self, path: &str) -> RemoteResult<Vec<ListingEntry>>;

    fn permissions(&self, path: &str, kind: EntityKind) -> RemoteResult<Vec<AclEntry>>;

    fn create_data_object(&self, path: &str) -> RemoteResult<()>;

    fn create_collection(&self, path: &str) -> RemoteResult<()>;

    fn delete(&self, path: &str) -> RemoteResult<()>;

    fn rename_data_object(&self, from: &str, to: &str) -> RemoteResult<()>;

    fn rename_collection(&self, from: &str, to: &str) -> RemoteResult<()>;

    /// Read into `buf` starting at `offset`. Short counts mean end of data.
    fn read_at(&self, path: &str, offset: u64, buf: &mut [u8]) -> RemoteResult<usize>;

    fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> RemoteResult<usize>;

    fn set_len(&self, path: &str, len: u64) -> RemoteResult<()>;
}
