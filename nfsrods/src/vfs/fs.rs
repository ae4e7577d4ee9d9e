use std::sync::Arc;

use bytes::Bytes;
use log::{debug, error, warn};

use super::{DirEntry, MAX_IO_SIZE, SetAttr, StableHow, WriteResult};
use crate::attr::{self, FileAttr};
use crate::error::{Error, Result};
use crate::inode::Handle;
use crate::path;
use crate::remote::{AclEntry, EntityKind, ObjStat};
use crate::session::{Session, SessionRegistry};

pub struct Vfs {
    registry: Arc<SessionRegistry>,
}

impl Vfs {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn session(&self, uid: u32) -> Result<Arc<Session>> {
        self.registry.resolve(uid)
    }

    fn attributes(&self, session: &Session, handle: Handle, p: &str, stat: &ObjStat) -> Result<FileAttr> {
        let acl = match stat.kind {
            EntityKind::Standin => Vec::new(),
            kind => session.connection().permissions(p, kind)?,
        };
        Ok(attr::translate(handle, stat, &acl, session.identity()))
    }

    fn child_path(session: &Session, parent: Handle, name: &str) -> Result<String> {
        path::validate_name(name)?;
        let dir = session.path_of(parent)?;
        Ok(path::join(&dir, name))
    }

    pub fn root_handle(&self, uid: u32) -> Result<Handle> {
        Ok(self.session(uid)?.root())
    }

    /// Handle of `name` inside `parent`. Unmapped names are checked against
    /// a fresh listing of the parent before a handle is handed out.
    pub fn lookup(&self, uid: u32, parent: Handle, name: &str) -> Result<Handle> {
        debug!("lookup uid={uid} parent={parent} name={name}");
        let session = self.session(uid)?;
        let child = Self::child_path(&session, parent, name)?;
        if let Some(h) = session.table().get(&child) {
            return Ok(h);
        }
        let dir = session.path_of(parent)?;
        let listing = session.connection().list(&dir)?;
        if listing.iter().any(|e| e.name == name) {
            session.table().bind(&child)
        } else {
            Err(Error::NotFound(child))
        }
    }

    /// Resolve a slash-separated path relative to the root, one lookup per
    /// component.
    pub fn walk(&self, uid: u32, rel: &str) -> Result<Handle> {
        let mut h = self.root_handle(uid)?;
        for name in rel.split('/').filter(|s| !s.is_empty() && *s != ".") {
            h = if name == ".." {
                self.parent_of(uid, h).or_else(|e| if e.is_not_found() { Ok(h) } else { Err(e) })?
            } else {
                self.lookup(uid, h, name)?
            };
        }
        Ok(h)
    }

    pub fn list(&self, uid: u32, dir: Handle) -> Result<Vec<DirEntry>> {
        debug!("list uid={uid} dir={dir}");
        let session = self.session(uid)?;
        let dir_path = session.path_of(dir)?;
        let entries = session.connection().list(&dir_path)?;
        entries
            .into_iter()
            .enumerate()
            .map(|(pos, entry)| {
                let p = path::join(&dir_path, &entry.name);
                let handle = session.table().bind(&p)?;
                let attr = self.attributes(&session, handle, &p, &entry.stat)?;
                Ok(DirEntry { name: entry.name, handle, attr, cookie: pos as u64 })
            })
            .collect()
    }

    pub fn create(&self, uid: u32, parent: Handle, name: &str, mode: u32) -> Result<Handle> {
        debug!("create uid={uid} parent={parent} name={name} mode={mode:o}");
        let session = self.session(uid)?;
        let p = Self::child_path(&session, parent, name)?;
        session.connection().create_data_object(&p)?;
        session.table().bind(&p)
    }

    pub fn mkdir(&self, uid: u32, parent: Handle, name: &str, mode: u32) -> Result<Handle> {
        debug!("mkdir uid={uid} parent={parent} name={name} mode={mode:o}");
        let session = self.session(uid)?;
        let p = Self::child_path(&session, parent, name)?;
        session.connection().create_collection(&p)?;
        session.table().bind(&p)
    }

    pub fn remove(&self, uid: u32, parent: Handle, name: &str) -> Result<()> {
        debug!("remove uid={uid} parent={parent} name={name}");
        let session = self.session(uid)?;
        let p = Self::child_path(&session, parent, name)?;
        session.connection().delete(&p)?;

        let table = session.table();
        match table.get(&p) {
            Some(h) => table.unmap(h, &p)?,
            None => debug!("{p} was never handed out"),
        }
        table.forget_descendants(&p);
        Ok(())
    }

    pub fn rename(
        &self,
        uid: u32,
        src_parent: Handle,
        old_name: &str,
        dst_parent: Handle,
        new_name: &str,
    ) -> Result<()> {
        debug!("rename uid={uid} {src_parent}/{old_name} -> {dst_parent}/{new_name}");
        let session = self.session(uid)?;
        let old = Self::child_path(&session, src_parent, old_name)?;
        let new = Self::child_path(&session, dst_parent, new_name)?;
        let conn = session.connection();
        let kind = conn.stat(&old)?.kind;
        if old == new {
            return Ok(());
        }
        if path::is_strict_ancestor(&old, &new) {
            return Err(Error::InvalidName(format!("cannot move {old} below itself")));
        }

        match kind {
            EntityKind::DataObject => conn.rename_data_object(&old, &new)?,
            EntityKind::Collection | EntityKind::Standin => conn.rename_collection(&old, &new)?,
        }

        let table = session.table();
        if let Some(replaced) = table.forget_path(&new) {
            debug!("rename replaced {new}, dropped handle {replaced}");
        }
        let handle = match table.get(&old) {
            Some(h) => h,
            None => {
                error!("rename of {old}: no handle mapped");
                return Err(Error::InvariantViolation(format!("{old} has no handle to move")));
            }
        };
        table.remap(handle, &old, &new)?;
        if kind.is_collection() {
            table.forget_descendants(&new);
            let moved = table.remap_descendants(&old, &new);
            debug!("rename moved {moved} handles below {old}");
        }
        Ok(())
    }

    pub fn read(&self, uid: u32, handle: Handle, offset: u64, count: u32) -> Result<Bytes> {
        debug!("read uid={uid} handle={handle} offset={offset} count={count}");
        let session = self.session(uid)?;
        let p = session.path_of(handle)?;
        let mut buf = vec![0u8; (count as usize).min(MAX_IO_SIZE)];
        let n = session.connection().read_at(&p, offset, &mut buf)?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    /// Data reaches the store before this returns, so every write is
    /// reported as `FileSync`.
    pub fn write(&self, uid: u32, handle: Handle, offset: u64, data: &[u8]) -> Result<WriteResult> {
        debug!("write uid={uid} handle={handle} offset={offset} len={}", data.len());
        let session = self.session(uid)?;
        let p = session.path_of(handle)?;
        let chunk = &data[..data.len().min(MAX_IO_SIZE)];
        let written = session.connection().write_at(&p, offset, chunk)?;
        Ok(WriteResult { written, stable: StableHow::FileSync })
    }

    pub fn commit(&self, uid: u32, handle: Handle, offset: u64, count: u32) -> Result<()> {
        error!("commit uid={uid} handle={handle} offset={offset} count={count}: not supported");
        Err(Error::NotSupported("commit"))
    }

    pub fn getattr(&self, uid: u32, handle: Handle) -> Result<FileAttr> {
        debug!("getattr uid={uid} handle={handle}");
        let session = self.session(uid)?;
        let p = session.path_of(handle)?;
        let stat = session.connection().stat(&p)?;
        self.attributes(&session, handle, &p, &stat)
    }

    pub fn setattr(&self, uid: u32, handle: Handle, changes: &SetAttr) -> Result<FileAttr> {
        debug!("setattr uid={uid} handle={handle} changes={changes:?}");
        let session = self.session(uid)?;
        let p = session.path_of(handle)?;
        if let Some(size) = changes.size {
            session.connection().set_len(&p, size)?;
        }
        if changes.mode.is_some() || changes.uid.is_some() || changes.gid.is_some() {
            warn!("setattr on {p}: mode and ownership changes are ignored");
        }
        let stat = session.connection().stat(&p)?;
        self.attributes(&session, handle, &p, &stat)
    }

    /// Handle of the containing collection. Never allocates.
    pub fn parent_of(&self, uid: u32, handle: Handle) -> Result<Handle> {
        debug!("parent_of uid={uid} handle={handle}");
        let session = self.session(uid)?;
        let p = session.path_of(handle)?;
        let parent = path::parent(&p).ok_or_else(|| Error::NotFound(format!("parent of {p}")))?;
        session.table().handle_of(parent)
    }

    /// Grants whatever was asked; the store enforces access on each call.
    pub fn access(&self, uid: u32, handle: Handle, mask: u32) -> Result<u32> {
        debug!("access uid={uid} handle={handle} mask={mask:#o}");
        self.session(uid)?;
        Ok(mask)
    }

    pub fn get_acl(&self, uid: u32, handle: Handle) -> Result<Vec<AclEntry>> {
        debug!("get_acl uid={uid} handle={handle}");
        self.session(uid)?;
        Ok(Vec::new())
    }

    pub fn set_acl(&self, _uid: u32, _handle: Handle, _acl: &[AclEntry]) -> Result<()> {
        Err(Error::NotSupported("set_acl"))
    }

    pub fn link(&self, _uid: u32, _parent: Handle, _existing: Handle, _name: &str) -> Result<Handle> {
        Err(Error::NotSupported("link"))
    }

    pub fn symlink(&self, _uid: u32, _parent: Handle, _name: &str, _target: &str) -> Result<Handle> {
        Err(Error::NotSupported("symlink"))
    }

    pub fn readlink(&self, _uid: u32, _handle: Handle) -> Result<String> {
        Err(Error::NotSupported("readlink"))
    }

    pub fn fs_stat(&self, _uid: u32) -> Result<()> {
        Err(Error::NotSupported("fs_stat"))
    }
}
