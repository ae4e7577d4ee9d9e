//! Remote metadata and ACLs to POSIX-style attributes.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::identity::Identity;
use crate::inode::Handle;
use crate::remote::{AccessLevel, AclEntry, EntityKind, ObjStat, PrincipalScope};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;

const OWNER_SHIFT: u32 = 6;
const OTHER_SHIFT: u32 = 0;
const READ_BITS: u32 = 0o444;
const EXEC_BITS: u32 = 0o111;
const ALL_BITS: u32 = 0o777;

/// Principals whose grants apply to everyone.
pub const WORLD_PRINCIPALS: [&str; 2] = ["anonymous", "public"];

/// Everything lives on one synthetic device.
pub const DEVICE_ID: u64 = 17;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    RegularFile,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileAttr {
    pub fileid: u64,
    pub kind: FileKind,
    /// Type and permission bits.
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub generation: u64,
    pub dev: u64,
    pub rdev: u64,
}

impl FileAttr {
    pub fn perm(&self) -> u32 {
        self.mode & !S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

fn class_bits(level: AccessLevel) -> u32 {
    match level {
        AccessLevel::Own => 0o7,
        AccessLevel::Write => 0o2,
        AccessLevel::Read => 0o4,
        AccessLevel::Null => 0,
    }
}

/// Fold user grants into permission bits as seen by `principal`. Its own
/// grants land in the owner class, world grants in the other class. Grants
/// to other users and to groups are not folded in.
pub fn reduce_acl(acl: &[AclEntry], principal: &str) -> u32 {
    acl.iter()
        .filter(|e| e.scope == PrincipalScope::User)
        .fold(0, |bits, e| {
            let shift = if e.principal == principal {
                OWNER_SHIFT
            } else if WORLD_PRINCIPALS.contains(&e.principal.as_str()) {
                OTHER_SHIFT
            } else {
                return bits;
            };
            bits | (class_bits(e.level) << shift)
        })
}

fn collection_bits(acl: &[AclEntry], principal: &str) -> u32 {
    let bits = reduce_acl(acl, principal);
    // Readable collections are searchable.
    bits | ((bits & READ_BITS) >> 2)
}

fn data_object_bits(acl: &[AclEntry], principal: &str) -> u32 {
    reduce_acl(acl, principal) & !EXEC_BITS
}

fn millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn translate(handle: Handle, stat: &ObjStat, acl: &[AclEntry], owner: &Identity) -> FileAttr {
    let (kind, mode) = match stat.kind {
        EntityKind::Collection => {
            (FileKind::Directory, S_IFDIR | collection_bits(acl, &owner.principal))
        }
        EntityKind::DataObject => {
            (FileKind::RegularFile, S_IFREG | data_object_bits(acl, &owner.principal))
        }
        EntityKind::Standin => (FileKind::Directory, S_IFDIR | ALL_BITS),
    };
    FileAttr {
        fileid: handle.get(),
        kind,
        mode,
        nlink: 1,
        uid: owner.uid,
        gid: owner.gid,
        size: stat.size,
        atime: stat.modified_at,
        mtime: stat.modified_at,
        ctime: stat.created_at,
        generation: millis(stat.modified_at),
        dev: DEVICE_ID,
        rdev: DEVICE_ID,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn stat(kind: EntityKind) -> ObjStat {
        ObjStat {
            kind,
            size: 42,
            created_at: UNIX_EPOCH + Duration::from_secs(100),
            modified_at: UNIX_EPOCH + Duration::from_millis(200_500),
        }
    }

    fn owner() -> Identity {
        Identity::new("alice", 1000, 1000)
    }

    fn h() -> Handle {
        Handle::new(7).unwrap()
    }

    #[test]
    fn owned_data_object_is_owner_rw_only() {
        let acl = [AclEntry::user("alice", AccessLevel::Own)];
        let attr = translate(h(), &stat(EntityKind::DataObject), &acl, &owner());
        assert_eq!(attr.mode, S_IFREG | 0o600);
        assert_eq!(attr.kind, FileKind::RegularFile);
        assert_eq!(attr.fileid, 7);
        assert_eq!(attr.size, 42);
        assert_eq!(attr.generation, 200_500);
        assert_eq!(attr.atime, attr.mtime);
        assert_eq!(attr.ctime, UNIX_EPOCH + Duration::from_secs(100));
        assert_eq!((attr.uid, attr.gid, attr.nlink), (1000, 1000, 1));
        assert_eq!((attr.dev, attr.rdev), (DEVICE_ID, DEVICE_ID));
    }

    #[test]
    fn grants_land_in_owner_and_other_classes() {
        let acl = [
            AclEntry::user("alice", AccessLevel::Read),
            AclEntry::user("alice", AccessLevel::Write),
            AclEntry::user("public", AccessLevel::Read),
            AclEntry::user("bob", AccessLevel::Own),
        ];
        let attr = translate(h(), &stat(EntityKind::DataObject), &acl, &owner());
        assert_eq!(attr.perm(), 0o604);
    }

    #[test]
    fn readable_collection_is_searchable() {
        let acl = [
            AclEntry::user("alice", AccessLevel::Read),
            AclEntry::user("anonymous", AccessLevel::Read),
        ];
        let attr = translate(h(), &stat(EntityKind::Collection), &acl, &owner());
        assert_eq!(attr.mode, S_IFDIR | 0o505);
        assert!(attr.is_dir());

        let acl = [AclEntry::user("alice", AccessLevel::Own)];
        let attr = translate(h(), &stat(EntityKind::Collection), &acl, &owner());
        assert_eq!(attr.perm(), 0o700);

        let acl = [AclEntry::user("alice", AccessLevel::Write)];
        let attr = translate(h(), &stat(EntityKind::Collection), &acl, &owner());
        assert_eq!(attr.perm(), 0o200);
    }

    #[test]
    fn group_grants_and_null_are_ignored() {
        let acl = [
            AclEntry::group("staff", AccessLevel::Own),
            AclEntry::user("alice", AccessLevel::Null),
        ];
        assert_eq!(reduce_acl(&acl, "alice"), 0);
        let attr = translate(h(), &stat(EntityKind::DataObject), &acl, &owner());
        assert_eq!(attr.mode, S_IFREG);
    }

    #[test]
    fn standin_is_wide_open_directory() {
        let attr = translate(h(), &stat(EntityKind::Standin), &[], &owner());
        assert_eq!(attr.mode, S_IFDIR | 0o777);
    }
}
