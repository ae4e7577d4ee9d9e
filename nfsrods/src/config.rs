use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use serde::Deserialize;

use crate::identity::Identity;

/// Environment variable naming the directory that holds `server.json`.
pub const CONFIG_HOME_ENV: &str = "NFSRODS_CONFIG_HOME";
pub const CONFIG_FILE_NAME: &str = "server.json";

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub nfs_server: NfsServerConfig,
    pub irods_client: IrodsClientConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NfsServerConfig {
    #[serde(default = "default_nfs_port")]
    pub port: u16,
    // Collection exposed as the filesystem root.
    pub irods_mount_point: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IrodsClientConfig {
    pub host: String,
    #[serde(default = "default_irods_port")]
    pub port: u16,
    pub zone: String,
    #[serde(default)]
    pub default_resource: Option<String>,
    #[serde(default)]
    pub ssl_negotiation_policy: SslNegotiationPolicy,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_in_seconds: u64,
    #[serde(default)]
    pub connection_management: ConnectionManagementConfig,
    pub proxy_admin_account: ProxyAdminAccountConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SslNegotiationPolicy {
    CsNegRequire,
    CsNegDontCare,
    #[default]
    CsNegRefuse,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    #[default]
    Simple,
    Cache,
    Proxy,
}

/// Connection handling for the remote client. Pool settings are only read
/// in `cache` mode.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionManagementConfig {
    #[serde(default)]
    pub mode: ConnectionMode,
    pub cache_minimum_evictable_idle_time_in_milliseconds: Option<u64>,
    pub cache_soft_minimum_evictable_idle_time_in_milliseconds: Option<u64>,
    pub cache_maximum_idle_connections_per_key: Option<u32>,
    pub cache_test_on_return: Option<bool>,
    pub cache_test_on_borrow: Option<bool>,
    pub cache_enable_jmx: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub min_evictable_idle_ms: u64,
    pub soft_min_evictable_idle_ms: u64,
    pub max_idle_per_key: u32,
    pub test_on_return: bool,
    pub test_on_borrow: bool,
    pub enable_jmx: bool,
}

impl ConnectionManagementConfig {
    /// Pool settings for `cache` mode, `None` for the other modes.
    pub fn pool_settings(&self) -> Result<Option<PoolSettings>> {
        if self.mode != ConnectionMode::Cache {
            return Ok(None);
        }
        fn required<T: Copy>(v: Option<T>, name: &str) -> Result<T> {
            v.with_context(|| format!("connection_management.{name} is required in cache mode"))
        }
        Ok(Some(PoolSettings {
            min_evictable_idle_ms: required(
                self.cache_minimum_evictable_idle_time_in_milliseconds,
                "cache_minimum_evictable_idle_time_in_milliseconds",
            )?,
            soft_min_evictable_idle_ms: required(
                self.cache_soft_minimum_evictable_idle_time_in_milliseconds,
                "cache_soft_minimum_evictable_idle_time_in_milliseconds",
            )?,
            max_idle_per_key: required(
                self.cache_maximum_idle_connections_per_key,
                "cache_maximum_idle_connections_per_key",
            )?,
            test_on_return: required(self.cache_test_on_return, "cache_test_on_return")?,
            test_on_borrow: required(self.cache_test_on_borrow, "cache_test_on_borrow")?,
            enable_jmx: required(self.cache_enable_jmx, "cache_enable_jmx")?,
        }))
    }
}

#[derive(Clone, Deserialize)]
pub struct ProxyAdminAccountConfig {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ProxyAdminAccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyAdminAccountConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentitySourceKind {
    #[default]
    Static,
    Os,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub source: IdentitySourceKind,
    #[serde(default)]
    pub entries: Vec<Identity>,
    /// Uid (and gid) that stands for the proxy admin account. Unset by default.
    #[serde(default)]
    pub admin_uid: Option<u32>,
}

fn default_nfs_port() -> u16 {
    2049
}

fn default_irods_port() -> u16 {
    1247
}

fn default_connection_timeout() -> u64 {
    600
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        let mount = &self.nfs_server.irods_mount_point;
        ensure!(
            mount.starts_with('/'),
            "nfs_server.irods_mount_point must be an absolute path, got {mount:?}"
        );
        ensure!(!self.irods_client.host.is_empty(), "irods_client.host must not be empty");
        ensure!(!self.irods_client.zone.is_empty(), "irods_client.zone must not be empty");
        ensure!(
            !self.irods_client.proxy_admin_account.username.is_empty(),
            "irods_client.proxy_admin_account.username must not be empty"
        );
        self.irods_client.connection_management.pool_settings()?;

        let mut principals = HashSet::new();
        let mut uids = HashSet::new();
        for entry in &self.identity.entries {
            if !principals.insert(entry.principal.as_str()) {
                bail!("identity entry for principal {:?} is duplicated", entry.principal);
            }
            if !uids.insert(entry.uid) {
                bail!("identity entry for uid {} is duplicated", entry.uid);
            }
        }
        if let Some(uid) = self.identity.admin_uid {
            let admin = &self.irods_client.proxy_admin_account.username;
            ensure!(!uids.contains(&uid), "identity.admin_uid {uid} is also a static entry");
            ensure!(
                !principals.contains(admin.as_str()),
                "proxy admin {admin:?} is also a static identity entry"
            );
        }
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ServerConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: ServerConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse JSON config {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("Invalid config {}", path.display()))?;
    Ok(cfg)
}

/// `$NFSRODS_CONFIG_HOME/server.json`, else `<user config dir>/nfsrods/server.json`.
pub fn default_config_path() -> PathBuf {
    let dir = match std::env::var_os(CONFIG_HOME_ENV) {
        Some(home) => PathBuf::from(home),
        None => dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nfsrods"),
    };
    dir.join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const MINIMAL: &str = r#"{
        "nfs_server": { "irods_mount_point": "/tempZone/home" },
        "irods_client": {
            "host": "localhost",
            "zone": "tempZone",
            "proxy_admin_account": { "username": "rods", "password": "s3cret" }
        }
    }"#;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let f = write_config(MINIMAL);
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.nfs_server.port, 2049);
        assert_eq!(cfg.irods_client.port, 1247);
        assert_eq!(cfg.irods_client.connection_timeout_in_seconds, 600);
        assert_eq!(cfg.irods_client.ssl_negotiation_policy, SslNegotiationPolicy::CsNegRefuse);
        assert_eq!(cfg.irods_client.connection_management.mode, ConnectionMode::Simple);
        assert_eq!(cfg.identity.source, IdentitySourceKind::Static);
        assert!(cfg.identity.entries.is_empty());
    }

    #[test]
    fn full_document_parses() {
        let f = write_config(
            r#"{
            "nfs_server": { "port": 2050, "irods_mount_point": "/tempZone/home" },
            "irods_client": {
                "host": "irods.example.org", "port": 1248, "zone": "tempZone",
                "default_resource": "demoResc",
                "ssl_negotiation_policy": "CS_NEG_DONT_CARE",
                "connection_timeout_in_seconds": 30,
                "connection_management": {
                    "mode": "cache",
                    "cache_minimum_evictable_idle_time_in_milliseconds": 60000,
                    "cache_soft_minimum_evictable_idle_time_in_milliseconds": 30000,
                    "cache_maximum_idle_connections_per_key": 4,
                    "cache_test_on_return": false,
                    "cache_test_on_borrow": true,
                    "cache_enable_jmx": false
                },
                "proxy_admin_account": { "username": "rods", "password": "rods" }
            },
            "identity": { "source": "static", "entries": [
                { "principal": "alice", "uid": 1000, "gid": 1000 },
                { "principal": "bob", "uid": 1001, "gid": 100 }
            ] }
        }"#,
        );
        let cfg = load_config(f.path()).unwrap();
        let pool = cfg.irods_client.connection_management.pool_settings().unwrap().unwrap();
        assert_eq!(pool.max_idle_per_key, 4);
        assert!(pool.test_on_borrow);
        assert_eq!(cfg.irods_client.default_resource.as_deref(), Some("demoResc"));
        assert_eq!(cfg.identity.entries[1], Identity::new("bob", 1001, 100));
    }

    #[test]
    fn incomplete_cache_settings_are_rejected() {
        let f = write_config(&MINIMAL.replace(
            r#""zone": "tempZone","#,
            r#""zone": "tempZone", "connection_management": { "mode": "cache", "cache_test_on_borrow": true },"#,
        ));
        let err = load_config(f.path()).unwrap_err();
        assert!(format!("{err:#}").contains("cache_minimum_evictable_idle_time_in_milliseconds"));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let f = write_config(&MINIMAL.replace(
            r#""zone": "tempZone","#,
            r#""zone": "tempZone", "connection_management": { "mode": "pooled" },"#,
        ));
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn relative_mount_point_is_rejected() {
        let f = write_config(&MINIMAL.replace("/tempZone/home", "tempZone/home"));
        let err = load_config(f.path()).unwrap_err();
        assert!(format!("{err:#}").contains("absolute"));
    }

    #[test]
    fn duplicate_identities_are_rejected() {
        let body = MINIMAL.trim_end().trim_end_matches('}').to_owned()
            + r#", "identity": { "entries": [
                { "principal": "alice", "uid": 1000, "gid": 1000 },
                { "principal": "alice2", "uid": 1000, "gid": 1000 } ] } }"#;
        let err = load_config(write_config(&body).path()).unwrap_err();
        assert!(format!("{err:#}").contains("uid 1000"));
    }

    #[test]
    fn admin_uid_is_optional_and_must_not_collide() {
        let cfg = load_config(write_config(MINIMAL).path()).unwrap();
        assert_eq!(cfg.identity.admin_uid, None);

        let with_admin = |entries: &str| {
            MINIMAL.trim_end().trim_end_matches('}').to_owned()
                + r#", "identity": { "admin_uid": 0, "entries": ["#
                + entries
                + "] } }"
        };
        let cfg = load_config(write_config(&with_admin("")).path()).unwrap();
        assert_eq!(cfg.identity.admin_uid, Some(0));

        let clash = with_admin(r#"{ "principal": "toor", "uid": 0, "gid": 0 }"#);
        let err = load_config(write_config(&clash).path()).unwrap_err();
        assert!(format!("{err:#}").contains("admin_uid 0"));
    }

    #[test]
    fn password_is_redacted_in_debug_output() {
        let cfg = load_config(write_config(MINIMAL).path()).unwrap();
        let dump = format!("{cfg:?}");
        assert!(!dump.contains("s3cret"));
        assert!(dump.contains("<redacted>"));
    }
}
