//! Update bundle installer.
//!
//! A bundle is a zip with the web UI under `html/`, optionally a firmware image
//! (`*.bin`) at the top level, and, for first-time setup, seed files for the
//! rest of the SD card. The UI is unpacked next to the live tree and swapped in
//! with renames so that a crash at any point leaves either the old or the new
//! tree in place.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use zip::ZipArchive;

use super::error::{OtaError, Result};
use super::marker::InstallKind;

const ASSET_PREFIX: &str = "html";

/// Where the asset trees live on the storage card.
#[derive(Debug, Clone)]
pub struct AssetLayout {
    /// Storage root; first-time-setup files are extracted relative to it.
    pub root: PathBuf,
    pub live: PathBuf,
    pub staging: PathBuf,
    pub backup: PathBuf,
    pub firmware_dir: PathBuf,
}

impl AssetLayout {
    /// Default layout under a storage root: `html`, `html_tmp`, `html_old`, `firmware`.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            live: root.join("html"),
            staging: root.join("html_tmp"),
            backup: root.join("html_old"),
            firmware_dir: root.join("firmware"),
            root,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractedBundle {
    /// Embedded firmware image, if the bundle carried one.
    pub firmware: Option<PathBuf>,
    pub asset_files: usize,
    pub seeded_files: usize,
    pub skipped_files: usize,
}

pub struct ArchiveInstaller {
    layout: AssetLayout,
}

impl ArchiveInstaller {
    pub fn new(layout: AssetLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &AssetLayout {
        &self.layout
    }

    /// Clean leftovers, extract to staging, then swap the UI tree in.
    /// Returns what was extracted; the caller flashes `firmware` and reboots.
    pub fn install(&self, bundle: &Path, kind: InstallKind) -> Result<ExtractedBundle> {
        remove_dir_if_exists(&self.layout.staging)?;
        remove_dir_if_exists(&self.layout.backup)?;

        log::info!("Extracting ZIP file {}...", bundle.display());
        let extracted = self.extract(bundle, kind)?;
        log::info!(
            "Files unzipped: {} assets, {} seeded, {} skipped",
            extracted.asset_files,
            extracted.seeded_files,
            extracted.skipped_files
        );

        if extracted.asset_files > 0 {
            self.swap_assets()?;
        } else {
            log::warn!("Bundle has no {}/ entries; keeping current UI", ASSET_PREFIX);
            remove_dir_if_exists(&self.layout.staging)?;
        }
        if let Some(fw) = &extracted.firmware {
            log::info!("Found firmware image {}", fw.display());
        }
        Ok(extracted)
    }

    /// Replace the live UI with the content of a UI-only zip, without reboot.
    pub fn unzip_html(&self, bundle: &Path) -> Result<usize> {
        remove_dir_if_exists(&self.layout.staging)?;
        remove_dir_if_exists(&self.layout.backup)?;

        let mut archive = open_archive(bundle)?;
        let mut count = 0;
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| OtaError::InvalidArchive(e.to_string()))?;
            let rel = safe_entry_path(entry.name(), entry.enclosed_name())?;
            let rel = rel.strip_prefix(ASSET_PREFIX).unwrap_or(&rel).to_path_buf();
            if rel.as_os_str().is_empty() {
                continue;
            }
            if write_entry(&mut entry, &self.layout.staging.join(&rel))? {
                count += 1;
            }
        }
        if count == 0 {
            remove_dir_if_exists(&self.layout.staging)?;
            return Err(OtaError::InvalidArchive("archive contains no files".into()));
        }
        self.swap_assets()?;
        log::info!("Web interface updated from {} ({} files)", bundle.display(), count);
        Ok(count)
    }

    fn extract(&self, bundle: &Path, kind: InstallKind) -> Result<ExtractedBundle> {
        let mut archive = open_archive(bundle)?;
        let mut out = ExtractedBundle::default();
        fs::create_dir_all(&self.layout.staging)?;

        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| OtaError::InvalidArchive(e.to_string()))?;
            let rel = safe_entry_path(entry.name(), entry.enclosed_name())?;

            if let Ok(asset) = rel.strip_prefix(ASSET_PREFIX) {
                if asset.as_os_str().is_empty() {
                    continue;
                }
                if write_entry(&mut entry, &self.layout.staging.join(asset))? {
                    out.asset_files += 1;
                }
            } else if is_firmware_image(&rel) {
                let dest = self.layout.firmware_dir.join(&rel);
                if write_entry(&mut entry, &dest)? {
                    out.firmware = Some(dest);
                }
            } else if kind == InstallKind::InitialSetup {
                if write_entry(&mut entry, &self.layout.root.join(&rel))? {
                    out.seeded_files += 1;
                }
            } else if !entry.is_dir() {
                log::debug!("Skipping {} (only extracted during initial setup)", rel.display());
                out.skipped_files += 1;
            }
        }
        Ok(out)
    }

    /// Live → backup, staging → live, delete backup.
    fn swap_assets(&self) -> Result<()> {
        let layout = &self.layout;
        let had_live = layout.live.exists();
        if had_live {
            log::info!("Renaming {} to {}", layout.live.display(), layout.backup.display());
            fs::rename(&layout.live, &layout.backup)?;
        }
        log::info!("Renaming {} to {}", layout.staging.display(), layout.live.display());
        if let Err(e) = fs::rename(&layout.staging, &layout.live) {
            if had_live {
                if let Err(restore) = fs::rename(&layout.backup, &layout.live) {
                    log::error!("Failed to restore {}: {}", layout.live.display(), restore);
                }
            }
            return Err(e.into());
        }
        if had_live {
            log::info!("Deleting {}", layout.backup.display());
            if let Err(e) = fs::remove_dir_all(&layout.backup) {
                log::warn!("Failed to delete {}: {}", layout.backup.display(), e);
            }
        }
        Ok(())
    }

    /// Finish or undo a swap interrupted by a reset. Run once at boot.
    pub fn recover_interrupted_swap(&self) -> Result<()> {
        let layout = &self.layout;
        if !layout.backup.exists() {
            return Ok(());
        }
        if layout.live.exists() {
            log::info!("Removing leftover {}", layout.backup.display());
            fs::remove_dir_all(&layout.backup)?;
        } else {
            log::warn!(
                "No {} after interrupted update, restoring {}",
                layout.live.display(),
                layout.backup.display()
            );
            fs::rename(&layout.backup, &layout.live)?;
        }
        Ok(())
    }
}

fn open_archive(bundle: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(bundle).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => OtaError::NotFound(bundle.display().to_string()),
        _ => OtaError::Io(e),
    })?;
    ZipArchive::new(file).map_err(|e| OtaError::InvalidArchive(e.to_string()))
}

fn safe_entry_path(name: &str, enclosed: Option<&Path>) -> Result<PathBuf> {
    let path = enclosed
        .ok_or_else(|| OtaError::InvalidArchive(format!("unsafe entry path {}", name)))?;
    if path.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(OtaError::InvalidArchive(format!("unsafe entry path {}", name)));
    }
    Ok(path.to_path_buf())
}

fn is_firmware_image(rel: &Path) -> bool {
    rel.components().count() == 1
        && rel
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("bin"))
            .unwrap_or(false)
}

/// Returns `true` if a file (not a directory) was written.
fn write_entry(entry: &mut zip::read::ZipFile<'_>, dest: &Path) -> Result<bool> {
    if entry.is_dir() {
        fs::create_dir_all(dest)?;
        return Ok(false);
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = File::create(dest)?;
    io::copy(entry, &mut out)?;
    out.sync_all()?;
    Ok(true)
}

pub(crate) fn remove_dir_if_exists(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
