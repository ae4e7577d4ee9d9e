//! File handles and the per-session handle table.
//!
//! A [`HandleTable`] keeps two maps, handle -> path and path -> handle, that
//! are exact inverses of each other. Both live behind a single lock so no
//! reader ever observes a pair present in one direction only. Handle numbers
//! come from a monotonically increasing counter starting at 1; numbers given
//! back through [`HandleTable::release`] are reused oldest first.
//!
//! Recycled numbers carry no generation tag. A client still holding a
//! released handle may reach whatever path the number is bound to next.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, error};

use crate::error::{Error, Result};
use crate::path;

/// Opaque file identifier handed to NFS clients. Never zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Handle(NonZeroU64);

impl Handle {
    /// Width of the wire form.
    pub const ENCODED_LEN: usize = 8;

    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }

    /// Big-endian wire form.
    pub fn to_bytes(self) -> [u8; Self::ENCODED_LEN] {
        self.0.get().to_be_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; Self::ENCODED_LEN] = bytes
            .try_into()
            .map_err(|_| Error::BadHandle(bytes.len()))?;
        Self::new(u64::from_be_bytes(raw)).ok_or(Error::BadHandle(bytes.len()))
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
struct Maps {
    by_handle: HashMap<Handle, String>,
    by_path: HashMap<String, Handle>,
}

impl Maps {
    fn drop_pair(&mut self, handle: Handle) -> Option<String> {
        let path = self.by_handle.remove(&handle)?;
        self.by_path.remove(&path);
        Some(path)
    }
}

pub struct HandleTable {
    maps: RwLock<Maps>,
    next: AtomicU64,
    recycled: Mutex<VecDeque<Handle>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(Maps::default()),
            next: AtomicU64::new(0),
            recycled: Mutex::new(VecDeque::new()),
        }
    }

    // A panic in another thread cannot leave the maps half-updated: every
    // write path checks before it mutates.
    fn read(&self) -> RwLockReadGuard<'_, Maps> {
        self.maps.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Maps> {
        self.maps.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn pool(&self) -> MutexGuard<'_, VecDeque<Handle>> {
        self.recycled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand out a handle: the oldest released one, else a fresh number.
    pub fn allocate(&self) -> Handle {
        if let Some(h) = self.pool().pop_front() {
            return h;
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Handle(NonZeroU64::MIN.saturating_add(n))
    }

    /// Return an unmapped handle to the recycle pool.
    pub fn release(&self, handle: Handle) {
        self.pool().push_back(handle);
    }

    /// Insert the pair in both directions, or fail with no change.
    pub fn map(&self, handle: Handle, path: &str) -> Result<()> {
        let mut maps = self.write();
        if maps.by_handle.contains_key(&handle) {
            return Err(Error::Conflict { handle, path: path.to_owned() });
        }
        match maps.by_path.get(path) {
            Some(&other) if other == handle => {
                error!("path {path} maps to handle {handle} with no reverse entry");
                Err(Error::InvariantViolation(format!(
                    "path {path} is bound to handle {handle} in one direction only"
                )))
            }
            Some(_) => Err(Error::Conflict { handle, path: path.to_owned() }),
            None => {
                maps.by_handle.insert(handle, path.to_owned());
                maps.by_path.insert(path.to_owned(), handle);
                debug!("mapped handle {handle} -> {path}");
                Ok(())
            }
        }
    }

    fn unbind(&self, handle: Handle, path: &str) -> Result<()> {
        let mut maps = self.write();
        match maps.by_handle.get(&handle) {
            None => return Err(Error::NotFound(format!("handle {handle}"))),
            Some(stored) if stored != path => {
                error!("unmap of handle {handle}: expected {path}, table holds {stored}");
                return Err(Error::InvariantViolation(format!(
                    "handle {handle} is bound to {stored}, not {path}"
                )));
            }
            Some(_) => {}
        }
        match maps.by_path.get(path) {
            Some(&h) if h == handle => {}
            other => {
                error!("unmap of {path}: reverse entry is {other:?}, expected handle {handle}");
                return Err(Error::InvariantViolation(format!(
                    "path {path} does not map back to handle {handle}"
                )));
            }
        }
        maps.by_handle.remove(&handle);
        maps.by_path.remove(path);
        debug!("unmapped handle {handle} -> {path}");
        Ok(())
    }

    /// Remove the pair in both directions and recycle the handle.
    pub fn unmap(&self, handle: Handle, path: &str) -> Result<()> {
        self.unbind(handle, path)?;
        self.release(handle);
        Ok(())
    }

    /// Rebind `handle` from `old` to `new`, keeping its number.
    ///
    /// The two steps are separate critical sections; a concurrent reader can
    /// briefly see the handle bound to neither path.
    pub fn remap(&self, handle: Handle, old: &str, new: &str) -> Result<()> {
        self.unbind(handle, old)?;
        if let Err(e) = self.map(handle, new) {
            error!("remap of handle {handle} to {new} failed after unbinding {old}: {e}");
            self.release(handle);
            return Err(e);
        }
        Ok(())
    }

    pub fn path_of(&self, handle: Handle) -> Result<String> {
        self.read()
            .by_handle
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("handle {handle}")))
    }

    pub fn handle_of(&self, path: &str) -> Result<Handle> {
        self.get(path).ok_or_else(|| Error::NotFound(path.to_owned()))
    }

    pub fn get(&self, path: &str) -> Option<Handle> {
        self.read().by_path.get(path).copied()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.read().by_handle.contains_key(&handle)
    }

    /// Existing handle for `path`, or a freshly mapped one.
    ///
    /// Racing callers for the same path all get the winner's handle; the
    /// losers' numbers go back to the pool.
    pub fn bind(&self, path: &str) -> Result<Handle> {
        loop {
            if let Some(h) = self.get(path) {
                return Ok(h);
            }
            let h = self.allocate();
            match self.map(h, path) {
                Ok(()) => return Ok(h),
                Err(Error::Conflict { .. }) if self.contains(h) => {
                    error!("allocator handed out handle {h} while it was still mapped");
                    return Err(Error::InvariantViolation(format!(
                        "handle {h} was allocated while mapped"
                    )));
                }
                Err(Error::Conflict { .. }) => self.release(h),
                Err(e) => {
                    self.release(h);
                    return Err(e);
                }
            }
        }
    }

    /// Drop the mapping for `path`, if any, and recycle its handle.
    pub fn forget_path(&self, path: &str) -> Option<Handle> {
        let h = {
            let mut maps = self.write();
            let h = maps.by_path.remove(path)?;
            maps.by_handle.remove(&h);
            h
        };
        debug!("forgot handle {h} -> {path}");
        self.release(h);
        Some(h)
    }

    /// Drop every mapping strictly below `ancestor`.
    pub fn forget_descendants(&self, ancestor: &str) -> usize {
        let dropped: Vec<Handle> = {
            let mut maps = self.write();
            let doomed: Vec<Handle> = maps
                .by_handle
                .iter()
                .filter(|(_, p)| path::is_strict_ancestor(ancestor, p))
                .map(|(h, _)| *h)
                .collect();
            for h in &doomed {
                maps.drop_pair(*h);
            }
            doomed
        };
        let n = dropped.len();
        let mut pool = self.pool();
        pool.extend(dropped);
        n
    }

    /// Rewrite every mapping strictly below `old` to sit below `new`, keeping
    /// handle numbers. Stale mappings already at a destination path are
    /// evicted.
    pub fn remap_descendants(&self, old: &str, new: &str) -> usize {
        let mut evicted = Vec::new();
        let moved = {
            let mut maps = self.write();
            let moves: Vec<(Handle, String, String)> = maps
                .by_handle
                .iter()
                .filter_map(|(h, p)| {
                    path::strip_ancestor(p, old).map(|rest| (*h, p.clone(), path::join(new, rest)))
                })
                .collect();
            for (_, from, _) in &moves {
                maps.by_path.remove(from);
            }
            for (h, _, to) in &moves {
                if let Some(stale) = maps.by_path.insert(to.clone(), *h) {
                    maps.by_handle.remove(&stale);
                    evicted.push(stale);
                }
                maps.by_handle.insert(*h, to.clone());
            }
            moves.len()
        };
        if !evicted.is_empty() {
            debug!("evicted {} stale handles below {new}", evicted.len());
            self.pool().extend(evicted);
        }
        moved
    }

    pub fn len(&self) -> usize {
        self.read().by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when both directions agree pair for pair.
    pub fn is_consistent(&self) -> bool {
        let maps = self.read();
        maps.by_handle.len() == maps.by_path.len()
            && maps
                .by_handle
                .iter()
                .all(|(h, p)| maps.by_path.get(p) == Some(h))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    use super::*;

    fn h(n: u64) -> Handle {
        Handle::new(n).unwrap()
    }

    #[test]
    fn handle_wire_form_is_big_endian() {
        assert_eq!(h(258).to_bytes(), [0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(Handle::from_bytes(&[0, 0, 0, 0, 0, 0, 1, 2]).unwrap(), h(258));
        assert!(matches!(Handle::from_bytes(&[0; 8]), Err(Error::BadHandle(8))));
        assert!(matches!(Handle::from_bytes(&[1, 2, 3]), Err(Error::BadHandle(3))));
    }

    #[test]
    fn fresh_handles_count_up_from_one() {
        let table = HandleTable::new();
        assert_eq!(table.allocate(), h(1));
        assert_eq!(table.allocate(), h(2));
        assert_eq!(table.allocate(), h(3));
    }

    #[test]
    fn released_handles_are_reused_oldest_first() {
        let table = HandleTable::new();
        let (a, b, c) = (table.allocate(), table.allocate(), table.allocate());
        table.release(b);
        table.release(a);
        assert_eq!(table.allocate(), b);
        assert_eq!(table.allocate(), a);
        assert_eq!(table.allocate(), h(c.get() + 1));
    }

    #[test]
    fn map_rejects_duplicates_without_side_effects() {
        let table = HandleTable::new();
        table.map(h(1), "/zoneA/home/alice").unwrap();

        let err = table.map(h(1), "/zoneA/home/alice").unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        let err = table.map(h(2), "/zoneA/home/alice").unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        let err = table.map(h(1), "/zoneA/home/bob").unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        assert_eq!(table.len(), 1);
        assert!(table.get("/zoneA/home/bob").is_none());
        assert!(!table.contains(h(2)));
        assert!(table.is_consistent());
    }

    #[test]
    fn unmap_checks_both_directions() {
        let table = HandleTable::new();
        table.map(h(1), "/a").unwrap();
        table.map(h(2), "/b").unwrap();

        assert!(matches!(table.unmap(h(9), "/a"), Err(Error::NotFound(_))));
        assert!(matches!(table.unmap(h(1), "/b"), Err(Error::InvariantViolation(_))));
        assert_eq!(table.len(), 2);

        table.unmap(h(1), "/a").unwrap();
        assert!(matches!(table.path_of(h(1)), Err(Error::NotFound(_))));
        assert!(matches!(table.handle_of("/a"), Err(Error::NotFound(_))));
        assert_eq!(table.allocate(), h(1));
    }

    #[test]
    fn remap_keeps_the_number_and_does_not_recycle_it() {
        let table = HandleTable::new();
        let hd = table.bind("/zoneA/home/alice/old.txt").unwrap();
        table
            .remap(hd, "/zoneA/home/alice/old.txt", "/zoneA/home/bob/new.txt")
            .unwrap();
        assert_eq!(table.path_of(hd).unwrap(), "/zoneA/home/bob/new.txt");
        assert!(table.get("/zoneA/home/alice/old.txt").is_none());
        assert_ne!(table.allocate(), hd);
    }

    #[test]
    fn bind_is_idempotent() {
        let table = HandleTable::new();
        let a = table.bind("/x").unwrap();
        assert_eq!(table.bind("/x").unwrap(), a);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn descendants_follow_a_moved_collection() {
        let table = HandleTable::new();
        let dir = table.bind("/z/a").unwrap();
        let file = table.bind("/z/a/f").unwrap();
        let deep = table.bind("/z/a/sub/g").unwrap();
        let sibling = table.bind("/z/ab").unwrap();
        let stale = table.bind("/z/b/f").unwrap();

        table.remap(dir, "/z/a", "/z/b").unwrap();
        assert_eq!(table.remap_descendants("/z/a", "/z/b"), 2);

        assert_eq!(table.path_of(file).unwrap(), "/z/b/f");
        assert_eq!(table.path_of(deep).unwrap(), "/z/b/sub/g");
        assert_eq!(table.path_of(sibling).unwrap(), "/z/ab");
        assert!(!table.contains(stale));
        assert!(table.is_consistent());
    }

    #[test]
    fn forget_descendants_recycles_handles() {
        let table = HandleTable::new();
        table.bind("/z/a").unwrap();
        let f = table.bind("/z/a/f").unwrap();
        assert!(table.forget_path("/nope").is_none());
        assert_eq!(table.forget_descendants("/z/a"), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.allocate(), f);
    }

    #[test]
    fn concurrent_binds_agree_on_one_handle_per_path() {
        let table = Arc::new(HandleTable::new());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    (0..64)
                        .map(|i| (i, table.bind(&format!("/zone/f{i}")).unwrap()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<Vec<(i32, Handle)>> =
            workers.into_iter().map(|w| w.join().unwrap()).collect();
        for pair in results.windows(2) {
            assert_eq!(pair[0], pair[1]);
        }
        let distinct: HashSet<Handle> = results[0].iter().map(|(_, h)| *h).collect();
        assert_eq!(distinct.len(), 64);
        assert_eq!(table.len(), 64);
        assert!(table.is_consistent());
    }

    #[test]
    fn readers_never_see_half_removed_pairs() {
        const WRITERS: u64 = 4;
        const PER_WRITER: u64 = 16;
        let table = Arc::new(HandleTable::new());
        let stop = Arc::new(AtomicBool::new(false));

        // Each writer owns a fixed handle range, so a path only ever belongs to one handle.
        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    let handles: Vec<Handle> =
                        (0..PER_WRITER).map(|i| h(w * 100 + i + 1)).collect();
                    for _ in 0..200 {
                        for (i, &hd) in handles.iter().enumerate() {
                            table.map(hd, &format!("/w{w}/a/f{i}")).unwrap();
                        }
                        for (i, &hd) in handles.iter().enumerate().filter(|(i, _)| i % 2 == 0) {
                            table
                                .remap(hd, &format!("/w{w}/a/f{i}"), &format!("/w{w}/b/f{i}"))
                                .unwrap();
                        }
                        assert_eq!(
                            table.forget_descendants(&format!("/w{w}/a")),
                            PER_WRITER as usize / 2
                        );
                        for (i, &hd) in handles.iter().enumerate().filter(|(i, _)| i % 2 == 0) {
                            table.unmap(hd, &format!("/w{w}/b/f{i}")).unwrap();
                        }
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        for w in 0..WRITERS {
                            for i in 0..PER_WRITER {
                                let hd = h(w * 100 + i + 1);
                                let Ok(p) = table.path_of(hd) else { continue };
                                match table.handle_of(&p) {
                                    Ok(back) => assert_eq!(back, hd, "{p} resolved to {back}"),
                                    Err(e) => assert!(e.is_not_found()),
                                }
                            }
                        }
                        assert!(table.is_consistent());
                    }
                })
            })
            .collect();

        for w in writers {
            w.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }
        assert!(table.is_consistent());
        assert!(table.is_empty());
    }
}
