// ===================================================================================================
// SwarmSync - LAN Peer-to-Peer Folder Synchronization Daemon
// ===================================================================================================
//
// Discovers peers on the local network over UDP beacons, authenticates them
// with long-lived Ed25519 identity keys and per-session X25519 key exchange,
// and keeps one folder consistent across peers: change detection through a
// debounced watcher, SQLite-backed file state, rsync-style delta transfers
// for large updates, password-locked vault folders, and resumable transfer
// checkpoints.
//
// The binary is a thin shell: parse arguments, load configuration, hand off
// to the supervisor (daemon) or to one of the offline utilities.
//
// ===================================================================================================

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::sync::Arc;

use swarmsync::cli::{Cli, Commands, TrustCommands, VaultCommands};
use swarmsync::config::{default_config_path, default_keys_dir, Config};
use swarmsync::conflict::SkipResolver;
use swarmsync::key_storage::{load_or_create_identity, FileKeyStorage};
use swarmsync::peer::TrustedPeer;
use swarmsync::power::MainsPower;
use swarmsync::state_store::{default_db_path, StateStore};
use swarmsync::supervisor::Supervisor;
use swarmsync::vault::VaultManager;
use swarmsync::{integrity, logging};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging_safe();
    let cli = Cli::parse_args();
    let config_path = match cli.config.clone() {
        Some(p) => p,
        None => default_config_path()?,
    };

    match cli.command {
        Commands::Run { sync_folder, device_name } => {
            let mut config = Config::load_or_default(Some(config_path.clone()))?;
            if let Some(folder) = sync_folder {
                config.sync_folder_path = folder;
            }
            if let Some(name) = device_name {
                config.device_name = name;
            }
            run_daemon(config).await
        }
        Commands::Init { sync_folder } => init(config_path, sync_folder),
        Commands::Trust { command } => trust(config_path, command),
        Commands::Vault { command } => vault(config_path, command),
        Commands::Check => check(config_path),
    }
}

async fn run_daemon(config: Config) -> Result<()> {
    let supervisor = Supervisor::start(config, Arc::new(MainsPower), Arc::new(SkipResolver))
        .await
        .context("daemon startup failed")?;
    tokio::signal::ctrl_c().await.context("cannot listen for ctrl-c")?;
    supervisor.shutdown().await;
    Ok(())
}

fn init(config_path: std::path::PathBuf, sync_folder: Option<std::path::PathBuf>) -> Result<()> {
    let mut config = Config::load_or_default(Some(config_path.clone()))?;
    if let Some(folder) = sync_folder {
        config.sync_folder_path = folder;
    }
    std::fs::create_dir_all(&config.sync_folder_path)?;

    let storage = FileKeyStorage::new(default_keys_dir()?);
    let identity = load_or_create_identity(&storage)?;
    config.save(&config_path)?;

    println!("device id:   {}", config.local_id);
    println!("device name: {}", config.device_name);
    println!("fingerprint: {}", identity.fingerprint());
    println!("sync folder: {}", config.sync_folder_path.display());
    println!();
    println!("Share the device id and fingerprint with peers that should trust this device.");
    Ok(())
}

fn trust(config_path: std::path::PathBuf, command: TrustCommands) -> Result<()> {
    let mut config = Config::load_or_default(Some(config_path.clone()))?;
    match command {
        TrustCommands::List => {
            if config.trusted_peers.is_empty() {
                println!("no trusted peers");
            }
            for peer in &config.trusted_peers {
                println!("{}  {}  {}  (since {})", peer.peer_id, peer.fingerprint, peer.display_name, peer.trusted_at);
            }
            Ok(())
        }
        TrustCommands::Add { peer_id, fingerprint, name } => {
            if fingerprint.len() != 64 || !fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
                bail!("fingerprint must be 64 hex characters");
            }
            config.trust_peer(TrustedPeer {
                peer_id,
                fingerprint: fingerprint.to_lowercase(),
                display_name: name,
                trusted_at: chrono::Utc::now(),
                auto_resolve: None,
            });
            config.save(&config_path)?;
            println!("trusted {}", peer_id);
            Ok(())
        }
        TrustCommands::Remove { fingerprint } => {
            config.revoke_trust(&fingerprint.to_lowercase());
            config.save(&config_path)?;
            println!("revoked {}", fingerprint);
            Ok(())
        }
    }
}

fn vault(config_path: std::path::PathBuf, command: VaultCommands) -> Result<()> {
    let mut config = Config::load_or_default(Some(config_path.clone()))?;
    let vault = VaultManager::new(&config.sync_folder_path, config.encryption_auto_lock_minutes);
    match command {
        VaultCommands::Create { folder } => {
            std::fs::create_dir_all(config.sync_folder_path.join(&folder))?;
            let password = rpassword::prompt_password("vault password: ")?;
            let confirm = rpassword::prompt_password("confirm password: ")?;
            if password != confirm {
                bail!("passwords do not match");
            }
            vault.create(&folder, &password)?;
            if !config.encrypted_folders.contains(&folder) {
                config.encrypted_folders.push(folder.clone());
                config.save(&config_path)?;
            }
            println!("created vault folder {}", folder);
            Ok(())
        }
        VaultCommands::List { folder } => {
            vault.register(&folder)?;
            let password = rpassword::prompt_password("vault password: ")?;
            vault.unlock(&folder, &password)?;
            for (obfuscated, real) in vault.manifest(&folder)? {
                println!("{}  {}", obfuscated, real);
            }
            vault.lock(&folder);
            Ok(())
        }
        VaultCommands::Read { folder, name, output } => {
            vault.register(&folder)?;
            let password = rpassword::prompt_password("vault password: ")?;
            vault.unlock(&folder, &password)?;
            let bytes = vault.decrypt_by_real_name(&folder, &name)?;
            vault.lock(&folder);
            match output {
                Some(path) => std::fs::write(path, bytes)?,
                None => std::io::stdout().write_all(&bytes)?,
            }
            Ok(())
        }
    }
}

fn check(config_path: std::path::PathBuf) -> Result<()> {
    let config = Config::load_or_default(Some(config_path))?;
    let store = StateStore::open(&default_db_path(&config.sync_folder_path))?;
    let result = integrity::check(&store, &config.sync_folder_path)?;
    println!(
        "checked {} files: {} healthy, {} issues",
        result.files_checked,
        result.healthy,
        result.issues.len()
    );
    for issue in &result.issues {
        println!("  {:?}  {}", issue.health, issue.relative_path);
    }
    if !result.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}
