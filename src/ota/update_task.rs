// Boot-time install of an update scheduled before the last reboot

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::archive::ArchiveInstaller;
use super::error::{OtaError, Result};
use super::flasher::{FlashReport, PartitionFlasher};
use super::marker::{InstallKind, UpdateMarker};
use super::partition::FlashBackend;
use super::source::ReaderSource;
use crate::system::reboot::RebootOrchestrator;

/// What the boot dispatch decided.
#[derive(Debug)]
pub enum BootDispatch {
    NothingPending,
    /// An install ran (successfully or not) and a reboot is owed.
    RebootRequired { flashed: Option<FlashReport> },
    /// Marker named a file that cannot be installed at boot.
    Unsupported(PathBuf),
    /// Image matched the last rolled-back version.
    BootLoopGuard { version: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BundleKind {
    Zip,
    Bin,
    Other,
}

fn bundle_kind(path: &Path) -> BundleKind {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("zip") => BundleKind::Zip,
        Some("bin") => BundleKind::Bin,
        _ => BundleKind::Other,
    }
}

pub struct UpdateTask<B: FlashBackend> {
    marker: UpdateMarker,
    installer: ArchiveInstaller,
    flasher: Arc<PartitionFlasher<B>>,
    reboot: Arc<RebootOrchestrator>,
    guard_poll: Duration,
}

impl<B: FlashBackend + 'static> UpdateTask<B> {
    pub fn new(
        marker: UpdateMarker,
        installer: ArchiveInstaller,
        flasher: Arc<PartitionFlasher<B>>,
        reboot: Arc<RebootOrchestrator>,
    ) -> Self {
        Self {
            marker,
            installer,
            flasher,
            reboot,
            guard_poll: Duration::from_secs(1),
        }
    }

    /// Finish an interrupted asset swap and install whatever the marker names.
    ///
    /// The marker is gone once this returns, whatever the outcome.
    pub fn dispatch(&self) -> BootDispatch {
        if let Err(e) = self.installer.recover_interrupted_swap() {
            log::error!("Asset recovery failed: {}", e);
        }

        let pending = match self.marker.consume_at_boot() {
            Ok(Some(pending)) => pending,
            Ok(None) => return BootDispatch::NothingPending,
            Err(e) => {
                log::error!("Update marker unreadable, discarded: {}", e);
                return BootDispatch::NothingPending;
            }
        };

        log::info!("File: {} Filetype: {:?}", pending.file.display(), bundle_kind(&pending.file));
        match bundle_kind(&pending.file) {
            BundleKind::Zip => self.install_bundle(&pending.file, pending.kind),
            BundleKind::Bin => {
                log::info!("Do firmware update - file: {}", pending.file.display());
                self.flash_file(&pending.file)
            }
            BundleKind::Other => {
                log::error!("Only ZIP or BIN files are supported for update during startup");
                BootDispatch::Unsupported(pending.file)
            }
        }
    }

    fn install_bundle(&self, bundle: &Path, kind: InstallKind) -> BootDispatch {
        let extracted = match self.installer.install(bundle, kind) {
            Ok(extracted) => extracted,
            Err(e) => {
                log::error!("Bundle install failed: {}", e);
                return BootDispatch::RebootRequired { flashed: None };
            }
        };
        match extracted.firmware {
            Some(firmware) => {
                log::info!("Found firmware {}", firmware.display());
                self.flash_file(&firmware)
            }
            None => BootDispatch::RebootRequired { flashed: None },
        }
    }

    fn flash_file(&self, path: &Path) -> BootDispatch {
        let result = File::open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => OtaError::NotFound(path.display().to_string()),
                _ => OtaError::Io(e),
            })
            .and_then(|file| self.flasher.flash(&mut ReaderSource::new(file)));
        match result {
            Ok(report) => {
                log::info!("Firmware {} written to {}", report.version, report.partition.label);
                BootDispatch::RebootRequired { flashed: Some(report) }
            }
            Err(OtaError::BootLoopGuard { version }) => BootDispatch::BootLoopGuard { version },
            Err(e) => {
                log::error!("Firmware update from {} failed: {}", path.display(), e);
                BootDispatch::RebootRequired { flashed: None }
            }
        }
    }

    /// Dispatch and act on the result.
    ///
    /// Returns `Ok(())` when boot should continue normally. Does not return
    /// after a boot-loop guard, and only returns after an install if the
    /// reboot itself failed.
    pub fn run(&self) -> Result<()> {
        match self.dispatch() {
            BootDispatch::NothingPending | BootDispatch::Unsupported(_) => Ok(()),
            BootDispatch::RebootRequired { .. } => {
                log::info!("Trigger reboot due to firmware update");
                self.reboot.reboot_for_update().map(|never| match never {})
            }
            BootDispatch::BootLoopGuard { version } => self.park(&version),
        }
    }

    fn park(&self, version: &str) -> ! {
        log::error!(
            "Firmware {} was rolled back before; refusing to install it again. Manual reset required",
            version
        );
        loop {
            log::warn!("Waiting for new firmware ...");
            thread::sleep(self.guard_poll);
        }
    }

    /// Run on a dedicated thread so the flash stays off the caller's stack.
    pub fn spawn(self) -> std::io::Result<JoinHandle<Result<()>>> {
        thread::Builder::new()
            .name("ota-update".to_string())
            .stack_size(16 * 1024)
            .spawn(move || self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ota::archive::tests::write_zip;
    use crate::ota::archive::AssetLayout;
    use crate::ota::sim::{app_image, SimulatedFlash};
    use crate::system::reboot::tests::{no_delays, RecordingControl};
    use crate::system::reboot::RebootOrchestrator;
    use std::fs;
    use std::sync::atomic::Ordering;

    struct Fixture {
        dir: tempfile::TempDir,
        control: Arc<RecordingControl>,
        flasher: Arc<PartitionFlasher<SimulatedFlash>>,
        task: UpdateTask<SimulatedFlash>,
    }

    fn fixture(sim: SimulatedFlash) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = AssetLayout::under(dir.path());
        fs::create_dir_all(&layout.firmware_dir).unwrap();
        fs::create_dir_all(&layout.live).unwrap();
        let control = Arc::new(RecordingControl::default());
        let reboot = Arc::new(
            RebootOrchestrator::new(control.clone(), dir.path().join("reboot.txt")).with_delays(no_delays()),
        );
        let flasher = Arc::new(PartitionFlasher::new(sim, 1024));
        let task = UpdateTask::new(
            UpdateMarker::new(dir.path().join("update.txt")),
            ArchiveInstaller::new(layout),
            flasher.clone(),
            reboot,
        );
        Fixture { dir, control, flasher, task }
    }

    #[test]
    fn no_marker_continues_boot() {
        let fx = fixture(SimulatedFlash::new("v1"));
        assert!(matches!(fx.task.dispatch(), BootDispatch::NothingPending));
        fx.task.run().unwrap();
        assert_eq!(fx.control.soft.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn bin_marker_flashes_and_reboots() {
        let fx = fixture(SimulatedFlash::new("v1"));
        let bin = fx.dir.path().join("firmware").join("update.BIN");
        fs::write(&bin, app_image("v2", 3000)).unwrap();
        fx.task.marker.schedule(&bin, InstallKind::Update).unwrap();

        let err = fx.task.run().unwrap_err();

        assert!(matches!(err, OtaError::RebootFailed));
        assert!(!fx.task.marker.is_pending());
        assert_eq!(fx.control.soft.load(Ordering::SeqCst), 1);
        fx.flasher.with_backend(|sim| assert_eq!(sim.boot_target_label().as_deref(), Some("ota_1")));
    }

    #[test]
    fn zip_marker_installs_assets_and_firmware() {
        let fx = fixture(SimulatedFlash::new("v1"));
        let bundle = fx.dir.path().join("firmware").join("update.zip");
        let image = app_image("v3", 2000);
        write_zip(&bundle, &[("html/index.html", b"<html>new</html>"), ("firmware.bin", image.as_slice())]);
        fx.task.marker.schedule(&bundle, InstallKind::Update).unwrap();

        match fx.task.dispatch() {
            BootDispatch::RebootRequired { flashed: Some(report) } => assert_eq!(report.version, "v3"),
            other => panic!("unexpected dispatch {:?}", other),
        }
        assert_eq!(
            fs::read_to_string(fx.dir.path().join("html").join("index.html")).unwrap(),
            "<html>new</html>"
        );
    }

    #[test]
    fn failed_install_still_clears_marker() {
        let fx = fixture(SimulatedFlash::new("v1"));
        let bundle = fx.dir.path().join("firmware").join("broken.zip");
        fs::write(&bundle, b"not a zip").unwrap();
        fx.task.marker.schedule(&bundle, InstallKind::Update).unwrap();

        assert!(matches!(fx.task.dispatch(), BootDispatch::RebootRequired { flashed: None }));
        assert!(!fx.task.marker.is_pending());
        assert!(matches!(fx.task.dispatch(), BootDispatch::NothingPending));
    }

    #[test]
    fn rolled_back_version_is_guarded() {
        let mut sim = SimulatedFlash::new("v1");
        sim.set_last_invalid("v2");
        let fx = fixture(sim);
        let bin = fx.dir.path().join("firmware").join("firmware.bin");
        fs::write(&bin, app_image("v2", 3000)).unwrap();
        fx.task.marker.schedule(&bin, InstallKind::Update).unwrap();

        assert!(matches!(
            fx.task.dispatch(),
            BootDispatch::BootLoopGuard { ref version } if version == "v2"
        ));
        fx.flasher.with_backend(|sim| assert_eq!(sim.end_calls(), 0));
    }

    #[test]
    fn unknown_extension_is_not_installed() {
        let fx = fixture(SimulatedFlash::new("v1"));
        let file = fx.dir.path().join("firmware").join("notes.txt");
        fs::write(&file, "x").unwrap();
        fx.task.marker.schedule(&file, InstallKind::Update).unwrap();

        assert!(matches!(fx.task.dispatch(), BootDispatch::Unsupported(_)));
        fx.task.run().unwrap();
        assert_eq!(fx.control.soft.load(Ordering::SeqCst), 0);
    }
}
