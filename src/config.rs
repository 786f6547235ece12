use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ota::archive::AssetLayout;
use crate::ota::verify::VerifySettings;
use crate::system::reboot::RebootDelays;

pub const DEFAULT_CONFIG_PATH: &str = "/sdcard/config/ota.json";

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    // Storage layout
    pub sd_root: PathBuf,
    pub firmware_dir: PathBuf,
    pub config_dir: PathBuf,
    pub log_file: PathBuf,
    pub update_marker: PathBuf,
    pub reboot_marker: PathBuf,

    // Download limits
    pub max_update_bytes: u64,
    pub max_model_bytes: u64,
    pub max_update_manifest_bytes: usize,
    pub max_model_manifest_bytes: usize,

    // Flashing
    pub flash_chunk_size: usize,

    // Post-boot verification
    pub verify_timeout_secs: u64,
    pub verify_poll_ms: u64,

    // Reboot timing
    pub reboot_grace_secs: u64,
    pub reboot_after_shutdown_secs: u64,
    pub reboot_fallback_secs: u64,
    pub ota_reboot_settle_secs: u64,

    /// Accept `task=update` for files placed on the card without a digest.
    pub allow_unverified_local_update: bool,
    pub log_level: String,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self::under("/sdcard")
    }
}

impl OtaConfig {
    /// Defaults with every path rooted at `sd_root`.
    pub fn under(sd_root: impl Into<PathBuf>) -> Self {
        let sd_root = sd_root.into();
        Self {
            firmware_dir: sd_root.join("firmware"),
            config_dir: sd_root.join("config"),
            log_file: sd_root.join("log").join("ota.log"),
            update_marker: sd_root.join("update.txt"),
            reboot_marker: sd_root.join("reboot.txt"),
            sd_root,
            max_update_bytes: 8 * MIB,
            max_model_bytes: 3 * MIB,
            max_update_manifest_bytes: 32 * 1024,
            max_model_manifest_bytes: 64 * 1024,
            flash_chunk_size: 1024,
            verify_timeout_secs: 180,
            verify_poll_ms: 1000,
            reboot_grace_secs: 3,
            reboot_after_shutdown_secs: 3,
            reboot_fallback_secs: 5,
            ota_reboot_settle_secs: 5,
            allow_unverified_local_update: true,
            log_level: "info".to_string(),
        }
    }

    pub fn asset_layout(&self) -> AssetLayout {
        AssetLayout {
            root: self.sd_root.clone(),
            live: self.sd_root.join("html"),
            staging: self.sd_root.join("html_tmp"),
            backup: self.sd_root.join("html_old"),
            firmware_dir: self.firmware_dir.clone(),
        }
    }

    pub fn verify_settings(&self) -> VerifySettings {
        VerifySettings {
            network_timeout: Duration::from_secs(self.verify_timeout_secs),
            poll_interval: Duration::from_millis(self.verify_poll_ms.max(1)),
        }
    }

    pub fn reboot_delays(&self) -> RebootDelays {
        RebootDelays {
            before_shutdown: Duration::from_secs(self.reboot_grace_secs),
            after_shutdown: Duration::from_secs(self.reboot_after_shutdown_secs),
            soft_restart_timeout: Duration::from_secs(self.reboot_fallback_secs),
            ota_settle: Duration::from_secs(self.ota_reboot_settle_secs),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        log::info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

fn load(path: &Path) -> Result<OtaConfig> {
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let config = serde_json::from_slice(&data)?;
    Ok(config)
}

/// Load the configuration, falling back to defaults and writing them back.
pub fn load_or_default(path: &Path) -> OtaConfig {
    load_or(path, OtaConfig::default())
}

/// Like [`load_or_default`] with caller-supplied defaults.
pub fn load_or(path: &Path, defaults: OtaConfig) -> OtaConfig {
    match load(path) {
        Ok(config) => {
            log::info!("Loaded configuration from {}", path.display());
            config
        }
        Err(e) => {
            log::warn!("Failed to load config from {}: {:?}, using defaults", path.display(), e);
            let config = defaults;

            // Try to save default config for next time
            if let Err(save_err) = config.save(path) {
                log::warn!("Failed to save default config: {:?}", save_err);
            }
            config
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("ota.json");

        let config = load_or_default(&path);

        assert_eq!(config, OtaConfig::default());
        assert!(path.exists());
        assert_eq!(load(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ota.json");
        fs::write(&path, r#"{"max_model_bytes": 1024, "allow_unverified_local_update": false}"#).unwrap();

        let config = load_or_default(&path);

        assert_eq!(config.max_model_bytes, 1024);
        assert!(!config.allow_unverified_local_update);
        assert_eq!(config.max_update_bytes, 8 * MIB);
        assert_eq!(config.verify_settings().network_timeout, Duration::from_secs(180));
    }

    #[test]
    fn corrupt_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ota.json");
        fs::write(&path, "{not json").unwrap();
        assert_eq!(load_or_default(&path), OtaConfig::default());
    }

    #[test]
    fn layout_follows_root() {
        let config = OtaConfig::under("/mnt/card");
        let layout = config.asset_layout();
        assert_eq!(layout.live, PathBuf::from("/mnt/card/html"));
        assert_eq!(layout.firmware_dir, PathBuf::from("/mnt/card/firmware"));
        assert_eq!(config.update_marker, PathBuf::from("/mnt/card/update.txt"));
    }
}
