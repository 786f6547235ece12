use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const INIT_FLAG: &str = "init";

/// Flavor of an owed install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallKind {
    Update,
    /// First-time setup: the bundle may also seed configuration files.
    InitialSetup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub file: PathBuf,
    pub kind: InstallKind,
}

/// "Install this file on next boot", persisted as a one- or two-line text file.
///
/// The marker is deleted the moment it is read so a crash or watchdog reset
/// during the install cannot re-trigger the same install on the next boot.
#[derive(Debug, Clone)]
pub struct UpdateMarker {
    path: PathBuf,
}

impl UpdateMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_pending(&self) -> bool {
        self.path.is_file()
    }

    /// Write the marker and sync it before returning.
    pub fn schedule(&self, file: &Path, kind: InstallKind) -> io::Result<()> {
        let mut content = file.to_string_lossy().into_owned();
        if kind == InstallKind::InitialSetup {
            content.push('\n');
            content.push_str(INIT_FLAG);
        }
        let mut out = File::create(&self.path)?;
        out.write_all(content.as_bytes())?;
        out.sync_all()?;
        log::info!("Update scheduled for next boot: {}", file.display());
        Ok(())
    }

    /// Read and delete the marker. The delete happens before anything is returned.
    pub fn consume_at_boot(&self) -> io::Result<Option<PendingUpdate>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("No pending update");
                return Ok(None);
            }
            Err(e) => {
                // Unreadable marker must not survive to the next boot either
                let _ = fs::remove_file(&self.path);
                return Err(e);
            }
        };
        fs::remove_file(&self.path)?;

        let mut lines = content.lines().map(str::trim);
        let file = match lines.next() {
            Some(first) if !first.is_empty() => PathBuf::from(first),
            _ => {
                log::warn!("Empty update marker {} discarded", self.path.display());
                return Ok(None);
            }
        };
        let kind = match lines.next() {
            Some(INIT_FLAG) => {
                log::info!("Initial setup triggered");
                InstallKind::InitialSetup
            }
            _ => InstallKind::Update,
        };
        log::info!("Start update process ({})", file.display());
        Ok(Some(PendingUpdate { file, kind }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_then_consume_once() {
        let dir = tempfile::tempdir().unwrap();
        let marker = UpdateMarker::new(dir.path().join("update.txt"));
        marker
            .schedule(Path::new("/sdcard/firmware/update.zip"), InstallKind::Update)
            .unwrap();
        assert!(marker.is_pending());

        let pending = marker.consume_at_boot().unwrap().unwrap();
        assert_eq!(pending.file, PathBuf::from("/sdcard/firmware/update.zip"));
        assert_eq!(pending.kind, InstallKind::Update);
        assert!(!marker.is_pending());
        assert_eq!(marker.consume_at_boot().unwrap(), None);
    }

    #[test]
    fn init_flag_on_second_line() {
        let dir = tempfile::tempdir().unwrap();
        let marker = UpdateMarker::new(dir.path().join("update.txt"));
        fs::write(marker.path(), "/sdcard/firmware/setup.zip\r\ninit\r\n").unwrap();
        let pending = marker.consume_at_boot().unwrap().unwrap();
        assert_eq!(pending.file, PathBuf::from("/sdcard/firmware/setup.zip"));
        assert_eq!(pending.kind, InstallKind::InitialSetup);
    }

    #[test]
    fn empty_marker_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = UpdateMarker::new(dir.path().join("update.txt"));
        fs::write(marker.path(), "\n").unwrap();
        assert_eq!(marker.consume_at_boot().unwrap(), None);
        assert!(!marker.is_pending());
    }
}
