//! Translation between NFS principals and numeric uid/gid.
//!
//! Principals are account names, optionally qualified as `name@domain`; the
//! domain part is ignored. Unknown principals map to [`NOBODY_ID`] and
//! unknown ids map to [`NOBODY`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, warn};
use nix::unistd::{Gid, Group, Uid, User};
use serde::{Deserialize, Serialize};

use crate::config::{IdentityConfig, IdentitySourceKind};

pub const NOBODY: &str = "nobody";
pub const NOBODY_ID: u32 = 65534;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub principal: String,
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    pub fn new(principal: impl Into<String>, uid: u32, gid: u32) -> Self {
        Self { principal: principal.into(), uid, gid }
    }
}

/// Where user and group names come from.
pub trait IdentitySource: Send + Sync {
    fn name(&self) -> &'static str;
    fn user_by_uid(&self, uid: u32) -> Option<Identity>;
    fn user_by_name(&self, name: &str) -> Option<Identity>;
    fn group_name(&self, gid: u32) -> Option<String>;
    fn group_id(&self, name: &str) -> Option<u32>;
}

/// Fixed table from configuration. A gid resolves to the principal of the
/// lowest uid whose primary group it is.
pub struct StaticIdentities {
    by_uid: BTreeMap<u32, Identity>,
    by_name: HashMap<String, u32>,
}

impl StaticIdentities {
    pub fn new(entries: impl IntoIterator<Item = Identity>) -> Self {
        let mut by_uid = BTreeMap::new();
        let mut by_name = HashMap::new();
        for id in entries {
            by_name.insert(id.principal.clone(), id.uid);
            by_uid.insert(id.uid, id);
        }
        Self { by_uid, by_name }
    }
}

impl IdentitySource for StaticIdentities {
    fn name(&self) -> &'static str {
        "static"
    }

    fn user_by_uid(&self, uid: u32) -> Option<Identity> {
        self.by_uid.get(&uid).cloned()
    }

    fn user_by_name(&self, name: &str) -> Option<Identity> {
        self.by_name.get(name).and_then(|uid| self.by_uid.get(uid)).cloned()
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        self.by_uid
            .values()
            .find(|id| id.gid == gid)
            .map(|id| id.principal.clone())
    }

    fn group_id(&self, name: &str) -> Option<u32> {
        self.user_by_name(name).map(|id| id.gid)
    }
}

/// Host account database via getpwuid/getgrgid and friends.
pub struct OsIdentities;

impl IdentitySource for OsIdentities {
    fn name(&self) -> &'static str {
        "os"
    }

    fn user_by_uid(&self, uid: u32) -> Option<Identity> {
        match User::from_uid(Uid::from_raw(uid)) {
            Ok(user) => user.map(|u| Identity::new(u.name, u.uid.as_raw(), u.gid.as_raw())),
            Err(e) => {
                warn!("getpwuid({uid}) failed: {e}");
                None
            }
        }
    }

    fn user_by_name(&self, name: &str) -> Option<Identity> {
        match User::from_name(name) {
            Ok(user) => user.map(|u| Identity::new(u.name, u.uid.as_raw(), u.gid.as_raw())),
            Err(e) => {
                warn!("getpwnam({name}) failed: {e}");
                None
            }
        }
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        match Group::from_gid(Gid::from_raw(gid)) {
            Ok(group) => group.map(|g| g.name),
            Err(e) => {
                warn!("getgrgid({gid}) failed: {e}");
                None
            }
        }
    }

    fn group_id(&self, name: &str) -> Option<u32> {
        match Group::from_name(name) {
            Ok(group) => group.map(|g| g.gid.as_raw()),
            Err(e) => {
                warn!("getgrnam({name}) failed: {e}");
                None
            }
        }
    }
}

/// Pins one uid to the proxy admin account and defers everything else.
/// The admin's gid equals its uid.
pub struct AdminIdentity {
    admin: Identity,
    inner: Arc<dyn IdentitySource>,
}

impl AdminIdentity {
    pub fn new(inner: Arc<dyn IdentitySource>, principal: impl Into<String>, uid: u32) -> Self {
        Self { admin: Identity::new(principal, uid, uid), inner }
    }
}

impl IdentitySource for AdminIdentity {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn user_by_uid(&self, uid: u32) -> Option<Identity> {
        if uid == self.admin.uid {
            return Some(self.admin.clone());
        }
        self.inner.user_by_uid(uid)
    }

    fn user_by_name(&self, name: &str) -> Option<Identity> {
        if name == self.admin.principal {
            return Some(self.admin.clone());
        }
        self.inner.user_by_name(name)
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        if gid == self.admin.gid {
            return Some(self.admin.principal.clone());
        }
        self.inner.group_name(gid)
    }

    fn group_id(&self, name: &str) -> Option<u32> {
        if name == self.admin.principal {
            return Some(self.admin.gid);
        }
        self.inner.group_id(name)
    }
}

/// Build the configured source. `admin` is the proxy admin account name,
/// bound to `identity.admin_uid` when that is set.
pub fn source_from_config(cfg: &IdentityConfig, admin: &str) -> Arc<dyn IdentitySource> {
    let base: Arc<dyn IdentitySource> = match cfg.source {
        IdentitySourceKind::Static => Arc::new(StaticIdentities::new(cfg.entries.iter().cloned())),
        IdentitySourceKind::Os => Arc::new(OsIdentities),
    };
    match cfg.admin_uid {
        Some(uid) => {
            debug!("uid {uid} pinned to proxy admin {admin}");
            Arc::new(AdminIdentity::new(base, admin, uid))
        }
        None => base,
    }
}

fn bare(principal: &str) -> &str {
    principal.split_once('@').map_or(principal, |(name, _)| name)
}

/// Caching front for an [`IdentitySource`]. Concurrent fills of the same
/// key may race; the last writer wins and both writes carry the same
/// answer.
pub struct IdMapper {
    source: Arc<dyn IdentitySource>,
    by_uid: RwLock<HashMap<u32, Arc<Identity>>>,
}

impl IdMapper {
    pub fn new(source: Arc<dyn IdentitySource>) -> Self {
        Self { source, by_uid: RwLock::new(HashMap::new()) }
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    /// Account behind a numeric uid, cached after the first hit.
    pub fn identity(&self, uid: u32) -> Option<Arc<Identity>> {
        if let Some(id) = self.by_uid.read().unwrap_or_else(PoisonError::into_inner).get(&uid) {
            return Some(Arc::clone(id));
        }
        let id = Arc::new(self.source.user_by_uid(uid)?);
        debug!("uid {uid} resolved to {} via {} source", id.principal, self.source.name());
        self.by_uid
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uid, Arc::clone(&id));
        Some(id)
    }

    pub fn principal_to_uid(&self, principal: &str) -> u32 {
        self.source.user_by_name(bare(principal)).map_or(NOBODY_ID, |id| id.uid)
    }

    pub fn uid_to_principal(&self, uid: u32) -> String {
        self.identity(uid).map_or_else(|| NOBODY.to_owned(), |id| id.principal.clone())
    }

    pub fn principal_to_gid(&self, principal: &str) -> u32 {
        self.source.group_id(bare(principal)).unwrap_or(NOBODY_ID)
    }

    pub fn gid_to_principal(&self, gid: u32) -> String {
        self.source.group_name(gid).unwrap_or_else(|| NOBODY.to_owned())
    }
}
