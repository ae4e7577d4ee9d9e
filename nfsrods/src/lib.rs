//! nfsrods: a handle-based, NFSv4-style filesystem surface over a
//! path-addressed iRODS-style data store.
//!
//! The protocol engine talks to [`Vfs`]; each call carries the caller's uid,
//! which [`SessionRegistry`] turns into a [`Session`] holding the remote
//! connection and the handle table for that identity.

pub mod attr;
pub mod config;
pub mod error;
pub mod identity;
pub mod inode;
pub mod path;
pub mod remote;
pub mod session;
pub mod vfs;

pub use error::{Error, Result};
pub use inode::{Handle, HandleTable};
pub use session::{Session, SessionRegistry, SessionSettings};
pub use vfs::Vfs;
