//! Protocol-facing filesystem surface.
//!
//! Every call names the caller's numeric uid. The adapter resolves that
//! caller's session, turns handles into remote paths through the session's
//! handle table, issues the remote call and translates the result.
//!
//! Submodules:
//! - `fs`: the [`Vfs`] adapter itself

pub mod fs;

use std::time::SystemTime;

use crate::attr::FileAttr;
use crate::inode::Handle;

pub use fs::Vfs;

/// Largest transfer served by a single read or write.
pub const MAX_IO_SIZE: usize = 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub handle: Handle,
    pub attr: FileAttr,
    /// Position in the listing. Not a resumable verifier.
    pub cookie: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StableHow {
    Unstable,
    DataSync,
    FileSync,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteResult {
    pub written: usize,
    pub stable: StableHow,
}

/// Requested attribute changes. Only `size` reaches the store; permissions
/// and ownership are governed by remote ACLs.
#[derive(Clone, Debug, Default)]
pub struct SetAttr {
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}
