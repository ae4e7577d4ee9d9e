//! Per-identity sessions and the registry that creates them on demand.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, info};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::identity::{IdMapper, Identity};
use crate::inode::{Handle, HandleTable};
use crate::path;
use crate::remote::{RemoteAccount, RemoteConnection, RemoteConnector};

/// One caller identity's view of the store: a remote connection plus the
/// handle table every request from that identity shares.
pub struct Session {
    identity: Arc<Identity>,
    root_path: String,
    root: Handle,
    connection: Arc<dyn RemoteConnection>,
    table: HandleTable,
}

impl Session {
    /// Build a session and bind its first handle to `root_path`.
    pub fn establish(
        identity: Arc<Identity>,
        root_path: &str,
        connection: Arc<dyn RemoteConnection>,
    ) -> Result<Self> {
        let table = HandleTable::new();
        let root_path = path::normalize(root_path);
        let root = Self::establish_root(&table, connection.as_ref(), &root_path)?;
        Ok(Self { identity, root_path, root, connection, table })
    }

    fn establish_root(
        table: &HandleTable,
        connection: &dyn RemoteConnection,
        root_path: &str,
    ) -> Result<Handle> {
        if !connection.exists(root_path)? {
            return Err(Error::NotFound(format!("mount point {root_path}")));
        }
        let root = table.allocate();
        table.map(root, root_path)?;
        Ok(root)
    }

    pub fn uid(&self) -> u32 {
        self.identity.uid
    }

    pub fn gid(&self) -> u32 {
        self.identity.gid
    }

    pub fn principal(&self) -> &str {
        &self.identity.principal
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn root(&self) -> Handle {
        self.root
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn connection(&self) -> &dyn RemoteConnection {
        self.connection.as_ref()
    }

    pub fn table(&self) -> &HandleTable {
        &self.table
    }

    pub fn path_of(&self, handle: Handle) -> Result<String> {
        self.table.path_of(handle)
    }
}

/// Connection parameters shared by every session.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub mount_point: String,
    pub host: String,
    pub port: u16,
    pub zone: String,
    pub default_resource: Option<String>,
    pub proxy_user: String,
    pub proxy_password: String,
}

impl SessionSettings {
    pub fn from_config(cfg: &ServerConfig) -> Self {
        let client = &cfg.irods_client;
        Self {
            mount_point: path::normalize(&cfg.nfs_server.irods_mount_point),
            host: client.host.clone(),
            port: client.port,
            zone: client.zone.clone(),
            default_resource: client.default_resource.clone(),
            proxy_user: client.proxy_admin_account.username.clone(),
            proxy_password: client.proxy_admin_account.password.clone(),
        }
    }

    fn account_for(&self, principal: &str) -> RemoteAccount {
        RemoteAccount {
            host: self.host.clone(),
            port: self.port,
            zone: self.zone.clone(),
            user: principal.to_owned(),
            proxy_user: self.proxy_user.clone(),
            proxy_password: self.proxy_password.clone(),
            default_resource: self.default_resource.clone(),
            home: format!("/{}/home/{principal}", self.zone),
        }
    }
}

/// Maps numeric caller ids to sessions. Sessions live for the life of the
/// registry.
pub struct SessionRegistry {
    settings: SessionSettings,
    ids: IdMapper,
    connector: Arc<dyn RemoteConnector>,
    sessions: RwLock<HashMap<u32, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(settings: SessionSettings, ids: IdMapper, connector: Arc<dyn RemoteConnector>) -> Self {
        Self {
            settings,
            ids,
            connector,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn id_mapper(&self) -> &IdMapper {
        &self.ids
    }

    /// Session for `uid`, creating it on first use.
    ///
    /// Two first requests for the same uid may both connect; the first
    /// session stored wins and the other is dropped, so every caller ends up
    /// sharing one handle table.
    pub fn resolve(&self, uid: u32) -> Result<Arc<Session>> {
        if let Some(s) = self.sessions.read().unwrap_or_else(PoisonError::into_inner).get(&uid) {
            return Ok(Arc::clone(s));
        }

        let identity = self
            .ids
            .identity(uid)
            .ok_or_else(|| Error::NotFound(format!("no identity for uid {uid}")))?;
        let account = self.settings.account_for(&identity.principal);
        debug!("connecting to {} as {} for uid {uid}", account.endpoint(), account.user);
        let connection = self.connector.connect(&account)?;
        let session = Arc::new(Session::establish(identity, &self.settings.mount_point, connection)?);

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let stored = sessions.entry(uid).or_insert_with(|| {
            info!("new session for uid {uid} ({}) rooted at {}", session.principal(), session.root_path());
            Arc::clone(&session)
        });
        Ok(Arc::clone(stored))
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
