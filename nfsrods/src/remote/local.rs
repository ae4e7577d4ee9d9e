//! Host directory standing in for the data store. Remote path `/a/b` lives
//! at `<root>/a/b`. Directories strictly above the mount point are reported
//! as stand-ins.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;

use super::{
    AccessLevel, AclEntry, EntityKind, ListingEntry, ObjStat, RemoteAccount, RemoteConnection,
    RemoteConnector, RemoteError, RemoteResult,
};
use crate::path;

pub struct LocalStore {
    root: PathBuf,
    mount_point: String,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(root: P, mount_point: &str) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            mount_point: path::normalize(mount_point),
        }
    }
}

impl RemoteConnector for LocalStore {
    fn connect(&self, account: &RemoteAccount) -> RemoteResult<Arc<dyn RemoteConnection>> {
        if !self.root.is_dir() {
            return Err(RemoteError::Connect {
                endpoint: self.root.display().to_string(),
                user: account.user.clone(),
                reason: "backing directory does not exist".into(),
            });
        }
        debug!("local store session for {} at {}", account.user, self.root.display());
        Ok(Arc::new(LocalConnection {
            root: self.root.clone(),
            mount_point: self.mount_point.clone(),
            user: account.user.clone(),
        }))
    }
}

struct LocalConnection {
    root: PathBuf,
    mount_point: String,
    user: String,
}

fn classify(err: io::Error, p: &str) -> RemoteError {
    match err.kind() {
        io::ErrorKind::NotFound => RemoteError::NotFound(p.to_owned()),
        io::ErrorKind::AlreadyExists => RemoteError::AlreadyExists(p.to_owned()),
        io::ErrorKind::PermissionDenied => RemoteError::PermissionDenied(p.to_owned()),
        io::ErrorKind::DirectoryNotEmpty => RemoteError::NotEmpty(p.to_owned()),
        io::ErrorKind::NotADirectory => RemoteError::NotACollection(p.to_owned()),
        io::ErrorKind::IsADirectory => RemoteError::IsACollection(p.to_owned()),
        _ => RemoteError::Io(err),
    }
}

impl LocalConnection {
    fn path_for(&self, p: &str) -> PathBuf {
        self.root.join(p.trim_start_matches('/'))
    }

    fn stat_of(&self, p: &str, meta: &fs::Metadata) -> ObjStat {
        let kind = if !meta.is_dir() {
            EntityKind::DataObject
        } else if path::is_strict_ancestor(p, &self.mount_point) {
            EntityKind::Standin
        } else {
            EntityKind::Collection
        };
        let modified_at = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
        ObjStat {
            kind,
            size: if meta.is_dir() { 0 } else { meta.len() },
            created_at: meta.created().unwrap_or(modified_at),
            modified_at,
        }
    }

    fn expect_file(&self, p: &str) -> RemoteResult<PathBuf> {
        let host = self.path_for(p);
        let meta = fs::metadata(&host).map_err(|e| classify(e, p))?;
        if meta.is_dir() {
            return Err(RemoteError::IsACollection(p.to_owned()));
        }
        Ok(host)
    }
}

impl RemoteConnection for LocalConnection {
    fn stat(&self, p: &str) -> RemoteResult<ObjStat> {
        let meta = fs::metadata(self.path_for(p)).map_err(|e| classify(e, p))?;
        Ok(self.stat_of(p, &meta))
    }

    fn list(&self, p: &str) -> RemoteResult<Vec<ListingEntry>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(self.path_for(p)).map_err(|e| classify(e, p))? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                debug!("skipping non-UTF-8 entry under {p}");
                continue;
            };
            let child = path::join(p, &name);
            let meta = entry.metadata().map_err(|e| classify(e, &child))?;
            out.push(ListingEntry { stat: self.stat_of(&child, &meta), name });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn permissions(&self, p: &str, _kind: EntityKind) -> RemoteResult<Vec<AclEntry>> {
        let meta = fs::metadata(self.path_for(p)).map_err(|e| classify(e, p))?;
        let level = if meta.permissions().readonly() {
            AccessLevel::Read
        } else {
            AccessLevel::Own
        };
        Ok(vec![AclEntry::user(self.user.clone(), level)])
    }

    fn create_data_object(&self, p: &str) -> RemoteResult<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path_for(p))
            .map_err(|e| classify(e, p))?;
        Ok(())
    }

    fn create_collection(&self, p: &str) -> RemoteResult<()> {
        fs::create_dir(self.path_for(p)).map_err(|e| classify(e, p))
    }

    fn delete(&self, p: &str) -> RemoteResult<()> {
        let host = self.path_for(p);
        let meta = fs::metadata(&host).map_err(|e| classify(e, p))?;
        let removed = if meta.is_dir() {
            fs::remove_dir(&host)
        } else {
            fs::remove_file(&host)
        };
        removed.map_err(|e| classify(e, p))
    }

    fn rename_data_object(&self, from: &str, to: &str) -> RemoteResult<()> {
        self.expect_file(from)?;
        fs::rename(self.path_for(from), self.path_for(to)).map_err(|e| classify(e, to))
    }

    fn rename_collection(&self, from: &str, to: &str) -> RemoteResult<()> {
        let meta = fs::metadata(self.path_for(from)).map_err(|e| classify(e, from))?;
        if !meta.is_dir() {
            return Err(RemoteError::NotACollection(from.to_owned()));
        }
        fs::rename(self.path_for(from), self.path_for(to)).map_err(|e| classify(e, to))
    }

    fn read_at(&self, p: &str, offset: u64, buf: &mut [u8]) -> RemoteResult<usize> {
        let mut f = fs::File::open(self.expect_file(p)?).map_err(|e| classify(e, p))?;
        f.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match f.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn write_at(&self, p: &str, offset: u64, data: &[u8]) -> RemoteResult<usize> {
        let mut f = OpenOptions::new()
            .write(true)
            .open(self.expect_file(p)?)
            .map_err(|e| classify(e, p))?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)?;
        f.flush()?;
        Ok(data.len())
    }

    fn set_len(&self, p: &str, len: u64) -> RemoteResult<()> {
        let f = OpenOptions::new()
            .write(true)
            .open(self.expect_file(p)?)
            .map_err(|e| classify(e, p))?;
        f.set_len(len)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(dir: &Path, mount_point: &str) -> Arc<dyn RemoteConnection> {
        let account = RemoteAccount {
            host: "localhost".into(),
            port: 1247,
            zone: "tempZone".into(),
            user: "alice".into(),
            proxy_user: "rods".into(),
            proxy_password: String::new(),
            default_resource: None,
            home: mount_point.into(),
        };
        LocalStore::new(dir, mount_point).connect(&account).unwrap()
    }

    #[test]
    fn ancestors_of_the_mount_point_are_standins() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("tempZone/home/alice")).unwrap();
        let conn = connect(tmp.path(), "/tempZone/home/alice");

        assert_eq!(conn.stat("/tempZone").unwrap().kind, EntityKind::Standin);
        assert_eq!(conn.stat("/tempZone/home").unwrap().kind, EntityKind::Standin);
        assert_eq!(conn.stat("/tempZone/home/alice").unwrap().kind, EntityKind::Collection);
    }

    #[test]
    fn data_round_trips_through_the_host_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let conn = connect(tmp.path(), "/");

        conn.create_collection("/docs").unwrap();
        conn.create_data_object("/docs/a.txt").unwrap();
        assert!(matches!(
            conn.create_data_object("/docs/a.txt"),
            Err(RemoteError::AlreadyExists(_))
        ));
        conn.write_at("/docs/a.txt", 3, b"xyz").unwrap();

        let mut buf = [0xffu8; 16];
        let n = conn.read_at("/docs/a.txt", 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"\0\0\0xyz");
        assert_eq!(conn.stat("/docs/a.txt").unwrap().size, 6);

        conn.set_len("/docs/a.txt", 2).unwrap();
        assert_eq!(conn.stat("/docs/a.txt").unwrap().size, 2);
        assert!(matches!(conn.delete("/docs"), Err(RemoteError::NotEmpty(_))));
    }

    #[test]
    fn listing_is_sorted_and_missing_paths_are_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("b"), b"").unwrap();
        fs::create_dir(tmp.path().join("a")).unwrap();
        let conn = connect(tmp.path(), "/");

        let names: Vec<String> = conn.list("/").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["a", "b"]);
        assert!(matches!(conn.stat("/missing"), Err(RemoteError::NotFound(_))));
        assert!(!conn.exists("/missing").unwrap());
    }
}
