//! In-process data store. Backs the test suite and quick experiments.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use log::debug;

use super::{
    AccessLevel, AclEntry, EntityKind, ListingEntry, ObjStat, PrincipalScope, RemoteAccount,
    RemoteConnection, RemoteConnector, RemoteError, RemoteResult,
};
use crate::path;

struct Node {
    kind: EntityKind,
    data: Vec<u8>,
    // Child names in creation order.
    children: Vec<String>,
    acl: Vec<AclEntry>,
    created_at: SystemTime,
    modified_at: SystemTime,
}

impl Node {
    fn new(kind: EntityKind) -> Self {
        let now = SystemTime::now();
        Self {
            kind,
            data: Vec::new(),
            children: Vec::new(),
            acl: Vec::new(),
            created_at: now,
            modified_at: now,
        }
    }

    fn stat(&self) -> ObjStat {
        ObjStat {
            kind: self.kind,
            size: self.data.len() as u64,
            created_at: self.created_at,
            modified_at: self.modified_at,
        }
    }
}

type Nodes = HashMap<String, Node>;

struct Inner {
    nodes: RwLock<Nodes>,
    list_calls: AtomicUsize,
    logins: Mutex<Vec<String>>,
    enforce: AtomicBool,
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, Nodes> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Nodes> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared in-memory tree of collections and data objects. Clones share
/// state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(path::ROOT.to_owned(), Node::new(EntityKind::Collection));
        Self {
            inner: Arc::new(Inner {
                nodes: RwLock::new(nodes),
                list_calls: AtomicUsize::new(0),
                logins: Mutex::new(Vec::new()),
                enforce: AtomicBool::new(false),
            }),
        }
    }

    /// Create `p` and any missing ancestors as collections.
    pub fn add_collection(&self, p: &str) -> &Self {
        let mut nodes = self.inner.write();
        ensure_collections(&mut nodes, &path::normalize(p));
        self
    }

    /// Create or overwrite a data object, creating ancestors as needed.
    pub fn add_data_object(&self, p: &str, data: &[u8]) -> &Self {
        let p = path::normalize(p);
        let mut nodes = self.inner.write();
        if let Some(parent) = path::parent(&p) {
            ensure_collections(&mut nodes, parent);
        }
        if !nodes.contains_key(&p) {
            attach(&mut nodes, &p, Node::new(EntityKind::DataObject));
        }
        if let Some(node) = nodes.get_mut(&p) {
            node.data = data.to_vec();
            node.modified_at = SystemTime::now();
        }
        self
    }

    pub fn set_kind(&self, p: &str, kind: EntityKind) -> &Self {
        if let Some(node) = self.inner.write().get_mut(&path::normalize(p)) {
            node.kind = kind;
        }
        self
    }

    pub fn grant(&self, p: &str, entry: AclEntry) -> &Self {
        if let Some(node) = self.inner.write().get_mut(&path::normalize(p)) {
            node.acl.push(entry);
        }
        self
    }

    /// Refuse mutations unless the connected user holds write or own.
    pub fn enforce_permissions(&self, on: bool) {
        self.inner.enforce.store(on, Ordering::Relaxed);
    }

    pub fn contains(&self, p: &str) -> bool {
        self.inner.read().contains_key(&path::normalize(p))
    }

    pub fn contents(&self, p: &str) -> Option<Vec<u8>> {
        self.inner.read().get(&path::normalize(p)).map(|n| n.data.clone())
    }

    /// Number of listing requests served so far.
    pub fn list_calls(&self) -> usize {
        self.inner.list_calls.load(Ordering::Relaxed)
    }

    /// Users that connected, in order.
    pub fn logins(&self) -> Vec<String> {
        self.inner.logins.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Largest data object the store will hold.
pub const MAX_OBJECT_SIZE: u64 = 1 << 30;

/// End offset of `count` bytes at `offset`, if it stays within
/// [`MAX_OBJECT_SIZE`].
fn bounded_len(p: &str, offset: u64, count: usize) -> RemoteResult<usize> {
    let end = offset.checked_add(count as u64).ok_or_else(|| {
        RemoteError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{p}: offset {offset} + {count} overflows"),
        ))
    })?;
    if end > MAX_OBJECT_SIZE {
        return Err(RemoteError::Io(io::Error::new(
            io::ErrorKind::FileTooLarge,
            format!("{p}: {end} bytes exceeds the {MAX_OBJECT_SIZE} byte object limit"),
        )));
    }
    usize::try_from(end).map_err(|_| RemoteError::Io(io::Error::from(io::ErrorKind::InvalidInput)))
}

fn ensure_collections(nodes: &mut Nodes, p: &str) {
    let mut cur = String::from(path::ROOT);
    for seg in p.split('/').filter(|s| !s.is_empty()) {
        cur = path::join(&cur, seg);
        if !nodes.contains_key(&cur) {
            attach(nodes, &cur, Node::new(EntityKind::Collection));
        }
    }
}

fn attach(nodes: &mut Nodes, p: &str, node: Node) {
    if let Some(parent) = path::parent(p).and_then(|pp| nodes.get_mut(pp)) {
        parent.children.push(path::file_name(p).to_owned());
    }
    nodes.insert(p.to_owned(), node);
}

fn detach(nodes: &mut Nodes, p: &str) -> Option<Node> {
    let node = nodes.remove(p)?;
    let name = path::file_name(p);
    if let Some(parent) = path::parent(p).and_then(|pp| nodes.get_mut(pp)) {
        parent.children.retain(|c| c != name);
    }
    Some(node)
}

fn parent_collection(nodes: &Nodes, p: &str) -> RemoteResult<()> {
    let parent = path::parent(p).ok_or_else(|| RemoteError::AlreadyExists(p.to_owned()))?;
    match nodes.get(parent) {
        None => Err(RemoteError::NotFound(parent.to_owned())),
        Some(n) if !n.kind.is_collection() => Err(RemoteError::NotACollection(parent.to_owned())),
        Some(_) => Ok(()),
    }
}

impl RemoteConnector for MemoryStore {
    fn connect(&self, account: &RemoteAccount) -> RemoteResult<Arc<dyn RemoteConnection>> {
        debug!("memory store login for {} via {}", account.user, account.proxy_user);
        self.inner
            .logins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(account.user.clone());
        Ok(Arc::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
            user: account.user.clone(),
        }))
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
    user: String,
}

impl MemoryConnection {
    fn require(&self, nodes: &Nodes, p: &str, needed: AccessLevel) -> RemoteResult<()> {
        if !self.inner.enforce.load(Ordering::Relaxed) {
            return Ok(());
        }
        let granted = nodes.get(p).is_some_and(|n| {
            n.acl.iter().any(|e| {
                e.scope == PrincipalScope::User && e.principal == self.user && e.level >= needed
            })
        });
        if granted {
            Ok(())
        } else {
            Err(RemoteError::PermissionDenied(p.to_owned()))
        }
    }

    fn require_parent(&self, nodes: &Nodes, p: &str) -> RemoteResult<()> {
        parent_collection(nodes, p)?;
        self.require(nodes, path::parent(p).unwrap_or(path::ROOT), AccessLevel::Write)
    }

    fn create(&self, p: &str, kind: EntityKind) -> RemoteResult<()> {
        let mut nodes = self.inner.write();
        if nodes.contains_key(p) {
            return Err(RemoteError::AlreadyExists(p.to_owned()));
        }
        self.require_parent(&nodes, p)?;
        let mut node = Node::new(kind);
        node.acl.push(AclEntry::user(self.user.clone(), AccessLevel::Own));
        attach(&mut nodes, p, node);
        Ok(())
    }
}

impl RemoteConnection for MemoryConnection {
    fn stat(&self, p: &str) -> RemoteResult<ObjStat> {
        self.inner
            .read()
            .get(p)
            .map(Node::stat)
            .ok_or_else(|| RemoteError::NotFound(p.to_owned()))
    }

    fn list(&self, p: &str) -> RemoteResult<Vec<ListingEntry>> {
        self.inner.list_calls.fetch_add(1, Ordering::Relaxed);
        let nodes = self.inner.read();
        let dir = nodes.get(p).ok_or_else(|| RemoteError::NotFound(p.to_owned()))?;
        if !dir.kind.is_collection() {
            return Err(RemoteError::NotACollection(p.to_owned()));
        }
        Ok(dir
            .children
            .iter()
            .filter_map(|name| {
                nodes.get(&path::join(p, name)).map(|child| ListingEntry {
                    name: name.clone(),
                    stat: child.stat(),
                })
            })
            .collect())
    }

    fn permissions(&self, p: &str, _kind: EntityKind) -> RemoteResult<Vec<AclEntry>> {
        self.inner
            .read()
            .get(p)
            .map(|n| n.acl.clone())
            .ok_or_else(|| RemoteError::NotFound(p.to_owned()))
    }

    fn create_data_object(&self, p: &str) -> RemoteResult<()> {
        self.create(p, EntityKind::DataObject)
    }

    fn create_collection(&self, p: &str) -> RemoteResult<()> {
        self.create(p, EntityKind::Collection)
    }

    fn delete(&self, p: &str) -> RemoteResult<()> {
        let mut nodes = self.inner.write();
        let node = nodes.get(p).ok_or_else(|| RemoteError::NotFound(p.to_owned()))?;
        if !node.children.is_empty() {
            return Err(RemoteError::NotEmpty(p.to_owned()));
        }
        self.require_parent(&nodes, p)?;
        detach(&mut nodes, p);
        Ok(())
    }

    fn rename_data_object(&self, from: &str, to: &str) -> RemoteResult<()> {
        let mut nodes = self.inner.write();
        match nodes.get(from) {
            None => return Err(RemoteError::NotFound(from.to_owned())),
            Some(n) if n.kind.is_collection() => {
                return Err(RemoteError::IsACollection(from.to_owned()));
            }
            Some(_) => {}
        }
        self.require_parent(&nodes, from)?;
        self.require_parent(&nodes, to)?;
        if let Some(existing) = nodes.get(to) {
            if existing.kind.is_collection() {
                return Err(RemoteError::IsACollection(to.to_owned()));
            }
            detach(&mut nodes, to);
        }
        if let Some(node) = detach(&mut nodes, from) {
            attach(&mut nodes, to, node);
        }
        Ok(())
    }

    fn rename_collection(&self, from: &str, to: &str) -> RemoteResult<()> {
        let mut nodes = self.inner.write();
        match nodes.get(from) {
            None => return Err(RemoteError::NotFound(from.to_owned())),
            Some(n) if !n.kind.is_collection() => {
                return Err(RemoteError::NotACollection(from.to_owned()));
            }
            Some(_) => {}
        }
        if path::is_strict_ancestor(from, to) {
            return Err(RemoteError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot move {from} below itself"),
            )));
        }
        self.require_parent(&nodes, from)?;
        self.require_parent(&nodes, to)?;
        if let Some(existing) = nodes.get(to) {
            if !existing.kind.is_collection() {
                return Err(RemoteError::NotACollection(to.to_owned()));
            }
            if !existing.children.is_empty() {
                return Err(RemoteError::NotEmpty(to.to_owned()));
            }
            detach(&mut nodes, to);
        }
        let below: Vec<String> = nodes
            .keys()
            .filter(|k| path::is_strict_ancestor(from, k))
            .cloned()
            .collect();
        for old in below {
            if let (Some(rest), Some(node)) = (path::strip_ancestor(&old, from), nodes.remove(&old)) {
                nodes.insert(path::join(to, rest), node);
            }
        }
        if let Some(node) = detach(&mut nodes, from) {
            attach(&mut nodes, to, node);
        }
        Ok(())
    }

    fn read_at(&self, p: &str, offset: u64, buf: &mut [u8]) -> RemoteResult<usize> {
        let nodes = self.inner.read();
        let node = nodes.get(p).ok_or_else(|| RemoteError::NotFound(p.to_owned()))?;
        if node.kind.is_collection() {
            return Err(RemoteError::IsACollection(p.to_owned()));
        }
        self.require(&nodes, p, AccessLevel::Read)?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(node.data.len());
        let n = buf.len().min(node.data.len() - start);
        buf[..n].copy_from_slice(&node.data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, p: &str, offset: u64, data: &[u8]) -> RemoteResult<usize> {
        let mut nodes = self.inner.write();
        match nodes.get(p) {
            None => return Err(RemoteError::NotFound(p.to_owned())),
            Some(n) if n.kind.is_collection() => {
                return Err(RemoteError::IsACollection(p.to_owned()));
            }
            Some(_) => {}
        }
        self.require(&nodes, p, AccessLevel::Write)?;
        let end = bounded_len(p, offset, data.len())?;
        let start = end - data.len();
        if let Some(node) = nodes.get_mut(p) {
            if node.data.len() < end {
                node.data.resize(end, 0);
            }
            node.data[start..end].copy_from_slice(data);
            node.modified_at = SystemTime::now();
        }
        Ok(data.len())
    }

    fn set_len(&self, p: &str, len: u64) -> RemoteResult<()> {
        let mut nodes = self.inner.write();
        self.require(&nodes, p, AccessLevel::Write)?;
        let node = nodes.get_mut(p).ok_or_else(|| RemoteError::NotFound(p.to_owned()))?;
        if node.kind.is_collection() {
            return Err(RemoteError::IsACollection(p.to_owned()));
        }
        let len = bounded_len(p, len, 0)?;
        node.data.resize(len, 0);
        node.modified_at = SystemTime::now();
        Ok(())
    }
}
