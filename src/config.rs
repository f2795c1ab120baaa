use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{SyncError, SyncResult};
use crate::peer::TrustedPeer;
use crate::schedule::SyncSchedule;

/// Configuration for the sync daemon. A plain value object persisted as
/// TOML; UI layers edit it through their own settings surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name advertised in beacons.
    pub device_name: String,
    /// Stable 128-bit identifier of this device.
    pub local_id: uuid::Uuid,
    /// Folder kept consistent across peers.
    pub sync_folder_path: PathBuf,
    /// Where accepted one-off file offers land.
    pub download_path: PathBuf,
    pub sync_enabled: bool,
    pub start_minimized: bool,
    /// Accept incoming file offers from trusted peers without prompting.
    pub auto_accept_from_trusted: bool,
    pub notifications_enabled: bool,
    pub show_transfer_complete: bool,
    /// Folders excluded from sync, relative to the sync root.
    #[serde(default)]
    pub excluded_folders: Vec<String>,
    /// Persisted trust records keyed by identity fingerprint.
    #[serde(default)]
    pub trusted_peers: Vec<TrustedPeer>,
    #[serde(default)]
    pub schedule: SyncSchedule,
    /// Manual pause flag; cleared automatically when `pause_until` passes.
    #[serde(default)]
    pub sync_paused: bool,
    #[serde(default)]
    pub pause_until: Option<DateTime<Utc>>,
    /// Minutes of inactivity before an unlocked vault folder relocks.
    pub encryption_auto_lock_minutes: u64,
    /// Vault folders, relative to the sync root.
    #[serde(default)]
    pub encrypted_folders: Vec<String>,
    /// Network tunables.
    #[serde(default)]
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// UDP beacon port.
    pub discovery_port: u16,
    /// First TCP port tried for the transfer listener.
    pub transfer_port_start: u16,
    /// Last TCP port tried, inclusive.
    pub transfer_port_end: u16,
    /// Updates at or above this size use the delta path.
    pub delta_threshold_bytes: u64,
    /// Minutes between periodic full rescans.
    pub rescan_interval_minutes: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: 52100,
            transfer_port_start: 52000,
            transfer_port_end: 52099,
            delta_threshold_bytes: 1024 * 1024,
            rescan_interval_minutes: 15,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let device_name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "swarmsync-device".to_string());
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            device_name,
            local_id: uuid::Uuid::new_v4(),
            sync_folder_path: home.join("SwarmSync"),
            download_path: home.join("Downloads"),
            sync_enabled: true,
            start_minimized: false,
            auto_accept_from_trusted: false,
            notifications_enabled: true,
            show_transfer_complete: true,
            excluded_folders: Vec::new(),
            trusted_peers: Vec::new(),
            schedule: SyncSchedule::default(),
            sync_paused: false,
            pause_until: None,
            encryption_auto_lock_minutes: 15,
            encrypted_folders: Vec::new(),
            network: NetworkConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `config_path`, falling back to defaults when
    /// the file does not exist.
    pub fn load_or_default(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let path = match config_path {
            Some(p) => p,
            None => default_config_path()?,
        };
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&text)
                .map_err(|e| SyncError::Config(format!("config parse error: {}", e)))?;
            tracing::info!("loaded configuration from {:?}", path);
            return Ok(config);
        }
        tracing::info!("using default configuration");
        Ok(Config::default())
    }

    /// Save the configuration as pretty TOML, creating parent directories.
    pub fn save(&self, config_path: &Path) -> SyncResult<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| SyncError::Config(format!("config serialize error: {}", e)))?;
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(config_path, text)?;
        tracing::info!("configuration saved to {:?}", config_path);
        Ok(())
    }

    /// The trust record matching an identity fingerprint, if any.
    pub fn trusted_peer(&self, fingerprint: &str) -> Option<&TrustedPeer> {
        self.trusted_peers.iter().find(|t| t.fingerprint == fingerprint)
    }

    pub fn is_trusted(&self, fingerprint: &str) -> bool {
        self.trusted_peer(fingerprint).is_some()
    }

    /// Add or refresh a trust record for a peer identity.
    pub fn trust_peer(&mut self, record: TrustedPeer) {
        self.trusted_peers.retain(|t| t.fingerprint != record.fingerprint);
        self.trusted_peers.push(record);
    }

    pub fn revoke_trust(&mut self, fingerprint: &str) {
        self.trusted_peers.retain(|t| t.fingerprint != fingerprint);
    }

    /// Whether a manual pause is in effect at `now`. A pause with no
    /// deadline holds until explicitly lifted.
    pub fn is_paused_at(&self, now: DateTime<Utc>) -> bool {
        if !self.sync_paused {
            return false;
        }
        match self.pause_until {
            Some(until) => now < until,
            None => true,
        }
    }
}

/// Default configuration file location: `<config-dir>/swarmsync/config.toml`.
pub fn default_config_path() -> SyncResult<PathBuf> {
    let base = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .ok_or_else(|| SyncError::Config("could not determine config directory".to_string()))?;
    Ok(base.join("swarmsync").join("config.toml"))
}

/// Default key-storage directory: `<config-dir>/swarmsync/keys`.
pub fn default_keys_dir() -> SyncResult<PathBuf> {
    let base = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .ok_or_else(|| SyncError::Config("could not determine config directory".to_string()))?;
    Ok(base.join("swarmsync").join("keys"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn toml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.device_name = "laptop".to_string();
        config.excluded_folders.push("Archive".to_string());
        config.save(&path).unwrap();

        let loaded = Config::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.device_name, "laptop");
        assert_eq!(loaded.local_id, config.local_id);
        assert_eq!(loaded.excluded_folders, vec!["Archive".to_string()]);
        assert_eq!(loaded.network.discovery_port, 52100);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Config::load_or_default(Some(dir.path().join("nope.toml"))).unwrap();
        assert!(loaded.sync_enabled);
        assert_eq!(loaded.network.delta_threshold_bytes, 1024 * 1024);
    }

    #[test]
    fn trust_records_replace_by_fingerprint() {
        let mut config = Config::default();
        let record = TrustedPeer {
            peer_id: uuid::Uuid::new_v4(),
            fingerprint: "abc".to_string(),
            display_name: "old".to_string(),
            trusted_at: Utc::now(),
            auto_resolve: None,
        };
        config.trust_peer(record.clone());
        config.trust_peer(TrustedPeer { display_name: "new".to_string(), ..record });
        assert_eq!(config.trusted_peers.len(), 1);
        assert_eq!(config.trusted_peers[0].display_name, "new");
        assert!(config.is_trusted("abc"));

        config.revoke_trust("abc");
        assert!(!config.is_trusted("abc"));
    }

    #[test]
    fn pause_expires() {
        let mut config = Config::default();
        let now = Utc::now();
        assert!(!config.is_paused_at(now));

        config.sync_paused = true;
        assert!(config.is_paused_at(now));

        config.pause_until = Some(now + Duration::minutes(10));
        assert!(config.is_paused_at(now));
        assert!(!config.is_paused_at(now + Duration::minutes(11)));
    }
}
