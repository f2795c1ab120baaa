/// Command Line Interface Module
///
/// Argument parsing for the swarmsync binary. The daemon itself runs under
/// `run`; the remaining subcommands are offline utilities operating on the
/// same configuration and sync folder.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// LAN peer-to-peer folder synchronization daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "swarmsync", version)]
pub struct Cli {
    /// Path to the configuration file (defaults to the platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the sync daemon in the foreground
    Run {
        /// Override the configured sync folder
        #[arg(long)]
        sync_folder: Option<PathBuf>,
        /// Override the advertised device name
        #[arg(long)]
        device_name: Option<String>,
    },
    /// Create the identity key and write a default configuration
    Init {
        /// Folder to keep in sync
        #[arg(long)]
        sync_folder: Option<PathBuf>,
    },
    /// Manage trusted peers
    Trust {
        #[command(subcommand)]
        command: TrustCommands,
    },
    /// Work with encrypted vault folders
    Vault {
        #[command(subcommand)]
        command: VaultCommands,
    },
    /// Verify every tracked file against its recorded hash
    Check,
}

#[derive(Subcommand, Debug, Clone)]
pub enum TrustCommands {
    /// List trusted peers
    List,
    /// Trust a peer identity by its key fingerprint
    Add {
        /// Peer ID as printed by the peer's `init`
        peer_id: uuid::Uuid,
        /// Identity public key fingerprint (SHA-256 hex)
        fingerprint: String,
        /// Display name for the peer
        #[arg(long, default_value = "peer")]
        name: String,
    },
    /// Revoke trust for a fingerprint
    Remove { fingerprint: String },
}

#[derive(Subcommand, Debug, Clone)]
pub enum VaultCommands {
    /// Create an encrypted folder inside the sync root
    Create {
        /// Folder path relative to the sync root
        folder: String,
    },
    /// List the real file names inside a vault (prompts for the password)
    List { folder: String },
    /// Decrypt one vault entry to stdout or a file
    Read {
        folder: String,
        /// Real (manifest) file name
        name: String,
        /// Write to this path instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
