mod cli;

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands, Target};
use log::info;

use nfsrods::config::{self, ServerConfig};
use nfsrods::identity::{self, IdMapper};
use nfsrods::remote::LocalStore;
use nfsrods::{SessionRegistry, SessionSettings, Vfs};

const CHUNK: u32 = 64 * 1024;

fn open_vfs(cfg: &ServerConfig, target: &Target) -> Vfs {
    let settings = SessionSettings::from_config(cfg);
    let store = LocalStore::new(&target.backend, &settings.mount_point);
    let ids = IdMapper::new(identity::source_from_config(
        &cfg.identity,
        &cfg.irods_client.proxy_admin_account.username,
    ));
    Vfs::new(Arc::new(SessionRegistry::new(settings, ids, Arc::new(store))))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(config::default_config_path);
    let cfg = config::load_config(&config_path)?;
    info!("loaded configuration from {}", config_path.display());

    match cli.command {
        Commands::Check => {
            let client = &cfg.irods_client;
            println!("mount point:  {}", cfg.nfs_server.irods_mount_point);
            println!("nfs port:     {}", cfg.nfs_server.port);
            println!("zone:         {} at {}:{}", client.zone, client.host, client.port);
            println!("proxy admin:  {}", client.proxy_admin_account.username);
            println!("ssl policy:   {:?}", client.ssl_negotiation_policy);
            println!("connections:  {:?}", client.connection_management.mode);
            if let Some(pool) = client.connection_management.pool_settings()? {
                println!("pool:         {pool:?}");
            }
            println!(
                "identities:   {:?} source, {} static entries",
                cfg.identity.source,
                cfg.identity.entries.len()
            );
            if let Some(uid) = cfg.identity.admin_uid {
                println!("admin uid:    {uid}");
            }
        }
        Commands::Ls { target, path } => {
            let vfs = open_vfs(&cfg, &target);
            let dir = vfs.walk(target.uid, &path).with_context(|| format!("cannot resolve {path:?}"))?;
            for entry in vfs.list(target.uid, dir)? {
                let kind = if entry.attr.is_dir() { 'd' } else { '-' };
                println!(
                    "{:>6} {kind}{:04o} {:>10} {}",
                    entry.handle.get(),
                    entry.attr.perm(),
                    entry.attr.size,
                    entry.name
                );
            }
        }
        Commands::Stat { target, path } => {
            let vfs = open_vfs(&cfg, &target);
            let h = vfs.walk(target.uid, &path).with_context(|| format!("cannot resolve {path:?}"))?;
            println!("{:#?}", vfs.getattr(target.uid, h)?);
        }
        Commands::Cat { target, path } => {
            let vfs = open_vfs(&cfg, &target);
            let h = vfs.walk(target.uid, &path).with_context(|| format!("cannot resolve {path:?}"))?;
            let mut out = io::stdout().lock();
            let mut offset = 0u64;
            loop {
                let chunk = vfs.read(target.uid, h, offset, CHUNK)?;
                if chunk.is_empty() {
                    break;
                }
                out.write_all(&chunk)?;
                offset += chunk.len() as u64;
            }
            out.flush()?;
        }
    }
    Ok(())
}
