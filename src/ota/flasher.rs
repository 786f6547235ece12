// Partition flasher - streams an app image into the inactive OTA partition

use std::sync::{Mutex, TryLockError};

use super::error::{OtaError, Result};
use super::image::{AppDescriptor, MIN_HEADER_LEN};
use super::partition::{FlashBackend, OtaHandle, PartitionDescriptor};
use super::source::{read_full, ByteSource, Chunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    Idle,
    HeaderPending,
    Writing,
    Finalizing,
    Committed,
    Rejected,
    /// Image matches the last rejected version; nothing was written.
    BootLoopGuard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    pub partition: PartitionDescriptor,
    pub version: String,
    pub bytes_written: usize,
    /// `false` if the image is valid but the boot target could not be switched.
    pub boot_target_set: bool,
}

/// One in-flight write, bound to exactly one partition.
struct OtaSession<'a, B: FlashBackend + ?Sized> {
    backend: &'a mut B,
    partition: PartitionDescriptor,
    handle: OtaHandle,
    bytes_written: usize,
    finished: bool,
}

impl<'a, B: FlashBackend + ?Sized> OtaSession<'a, B> {
    fn begin(backend: &'a mut B, partition: PartitionDescriptor) -> Result<Self> {
        let handle = backend.begin(&partition)?;
        log::info!("esp_ota_begin succeeded on {}", partition);
        Ok(Self {
            backend,
            partition,
            handle,
            bytes_written: 0,
            finished: false,
        })
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.backend.write(self.handle, data)?;
        self.bytes_written += data.len();
        log::debug!("Written image length {}", self.bytes_written);
        Ok(())
    }

    fn finish(mut self) -> Result<usize> {
        self.finished = true;
        self.backend.end(self.handle)?;
        Ok(self.bytes_written)
    }
}

impl<B: FlashBackend + ?Sized> Drop for OtaSession<'_, B> {
    fn drop(&mut self) {
        // Release the handle if the write never reached `end`
        if !self.finished {
            self.backend.abort(self.handle);
        }
    }
}

pub struct PartitionFlasher<B: FlashBackend> {
    backend: Mutex<B>,
    chunk_size: usize,
    last_state: Mutex<FlashState>,
}

impl<B: FlashBackend> PartitionFlasher<B> {
    pub fn new(backend: B, chunk_size: usize) -> Self {
        Self {
            backend: Mutex::new(backend),
            chunk_size: chunk_size.max(MIN_HEADER_LEN),
            last_state: Mutex::new(FlashState::Idle),
        }
    }

    /// State reached by the most recent flash attempt.
    pub fn last_state(&self) -> FlashState {
        *self.last_state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: FlashState) {
        *self.last_state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// Run `f` against the backend, e.g. to inspect the simulated flash in tests.
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        let mut guard = self.backend.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    /// Flash an image read from `source` into the next update partition.
    ///
    /// Never reboots. On success the caller is responsible for restarting.
    pub fn flash(&self, source: &mut dyn ByteSource) -> Result<FlashReport> {
        let mut backend = match self.backend.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                log::warn!("Flash session already in progress");
                return Err(OtaError::Busy);
            }
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };

        log::info!("Starting OTA update");
        let result = self.run(&mut *backend, source);
        let state = match &result {
            Ok(_) => FlashState::Committed,
            Err(OtaError::BootLoopGuard { .. }) => FlashState::BootLoopGuard,
            Err(_) => FlashState::Rejected,
        };
        self.set_state(state);
        if let Err(e) = &result {
            log::error!("Firmware update failed: {}", e);
        }
        result
    }

    fn run(&self, backend: &mut B, source: &mut dyn ByteSource) -> Result<FlashReport> {
        self.set_state(FlashState::HeaderPending);
        let running = backend.running_partition();
        if let (Some(running), Some(configured)) = (&running, backend.boot_partition()) {
            if configured != *running {
                log::error!(
                    "Configured OTA boot partition at offset 0x{:08x}, but running from offset 0x{:08x}",
                    configured.address,
                    running.address
                );
                log::error!("(This can happen if either the OTA boot data or preferred boot image become corrupted.)");
            }
        }
        let update = backend.next_update_partition().ok_or(OtaError::NoUpdatePartition)?;
        if let Some(running) = &running {
            log::info!("Running partition {}", running);
        }
        log::info!("Writing to partition {}", update);

        let mut buf = vec![0u8; self.chunk_size];
        let first = read_full(source, &mut buf)?;
        if first < MIN_HEADER_LEN {
            log::error!("Received package is not fit len ({} bytes)", first);
            return Err(OtaError::ImageTooSmall {
                len: first,
                required: MIN_HEADER_LEN,
            });
        }
        let new_app = AppDescriptor::from_image(&buf[..first])?;
        log::info!("New firmware version: {}", new_app.version);
        if let Some(running_app) = running.as_ref().and_then(|p| backend.app_description(p)) {
            log::info!("Running firmware version: {}", running_app.version);
        }
        check_boot_loop(backend, &new_app)?;

        self.set_state(FlashState::Writing);
        let mut session = OtaSession::begin(backend, update)?;
        session.write(&buf[..first])?;
        loop {
            match source.next_chunk(&mut buf)? {
                Chunk::Data(n) => session.write(&buf[..n])?,
                Chunk::End => break,
            }
        }

        self.set_state(FlashState::Finalizing);
        let partition = session.partition.clone();
        let bytes_written = session.finish().map_err(|e| match e {
            OtaError::ImageCorrupted(msg) => {
                log::error!("Image validation failed, image is corrupted");
                OtaError::ImageCorrupted(msg)
            }
            other => other,
        })?;
        log::info!("Total Write binary data length: {}", bytes_written);

        let boot_target_set = match backend.set_boot_target(&partition) {
            Ok(()) => true,
            Err(e) => {
                log::error!("esp_ota_set_boot_partition failed ({}); image stays unbooted", e);
                false
            }
        };

        Ok(FlashReport {
            partition,
            version: new_app.version.to_string(),
            bytes_written,
            boot_target_set,
        })
    }
}

fn check_boot_loop<B: FlashBackend + ?Sized>(backend: &B, new_app: &AppDescriptor) -> Result<()> {
    let Some(invalid) = backend.last_invalid_partition() else {
        return Ok(());
    };
    let Some(invalid_app) = backend.app_description(&invalid) else {
        return Ok(());
    };
    log::info!("Last invalid firmware version: {}", invalid_app.version);
    if invalid_app.version == new_app.version {
        log::warn!("New version is the same as invalid version");
        log::warn!(
            "Previously, there was an attempt to launch the firmware with {} version, but it failed",
            invalid_app.version
        );
        log::warn!("The firmware has been rolled back to the previous version");
        return Err(OtaError::BootLoopGuard {
            version: new_app.version.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ota::sim::{app_image, SimulatedFlash};
    use crate::ota::source::ReaderSource;
    use std::io::{self, Cursor, Read};
    use std::sync::mpsc;
    use std::thread;

    fn flasher(sim: SimulatedFlash) -> PartitionFlasher<SimulatedFlash> {
        PartitionFlasher::new(sim, 1024)
    }

    #[test]
    fn commits_valid_image() {
        let f = flasher(SimulatedFlash::new("v1.0.0"));
        let image = app_image("v2.0.0", 5000);

        let report = f.flash(&mut ReaderSource::new(Cursor::new(&image))).unwrap();

        assert_eq!(report.version, "v2.0.0");
        assert_eq!(report.bytes_written, image.len());
        assert!(report.boot_target_set);
        assert_eq!(f.last_state(), FlashState::Committed);
        f.with_backend(|sim| {
            assert_eq!(sim.written_image(), Some(image.as_slice()));
            assert_eq!(sim.boot_target_label().as_deref(), Some("ota_1"));
        });
    }

    #[test]
    fn same_version_as_last_invalid_is_guarded() {
        let mut sim = SimulatedFlash::new("v1.0.0");
        sim.set_last_invalid("v2.0.0");
        let f = flasher(sim);

        let err = f
            .flash(&mut ReaderSource::new(Cursor::new(app_image("v2.0.0", 4096))))
            .unwrap_err();

        assert!(matches!(err, OtaError::BootLoopGuard { ref version } if version == "v2.0.0"));
        assert_eq!(f.last_state(), FlashState::BootLoopGuard);
        f.with_backend(|sim| {
            assert_eq!(sim.begin_calls(), 0);
            assert_eq!(sim.end_calls(), 0);
            assert_eq!(sim.boot_target_label(), None);
        });
    }

    #[test]
    fn different_version_than_last_invalid_proceeds() {
        let mut sim = SimulatedFlash::new("v1.0.0");
        sim.set_last_invalid("v2.0.0");
        let f = flasher(sim);
        f.flash(&mut ReaderSource::new(Cursor::new(app_image("v2.0.1", 2048))))
            .unwrap();
        assert_eq!(f.last_state(), FlashState::Committed);
    }

    /// Hands out the header, then blocks until released.
    struct GatedReader {
        inner: Cursor<Vec<u8>>,
        started: Option<mpsc::Sender<()>>,
        release: mpsc::Receiver<()>,
    }

    impl Read for GatedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inner.position() > 0 {
                if let Some(started) = self.started.take() {
                    let _ = started.send(());
                    let _ = self.release.recv();
                }
            }
            self.inner.read(buf)
        }
    }

    #[test]
    fn concurrent_flash_is_busy() {
        let f = flasher(SimulatedFlash::new("v1.0.0"));
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let mut reader = GatedReader {
            inner: Cursor::new(app_image("v2.0.0", 4096)),
            started: Some(started_tx),
            release: release_rx,
        };

        let (first, second) = thread::scope(|s| {
            let first = s.spawn(|| f.flash(&mut ReaderSource::new(&mut reader)));
            started_rx.recv().unwrap();
            let second = f.flash(&mut ReaderSource::new(Cursor::new(app_image("v3.0.0", 2048))));
            release_tx.send(()).unwrap();
            (first.join().unwrap(), second)
        });

        assert!(matches!(second, Err(OtaError::Busy)));
        assert_eq!(first.unwrap().version, "v2.0.0");
        assert_eq!(f.last_state(), FlashState::Committed);
        f.with_backend(|sim| assert_eq!(sim.begin_calls(), 1));
    }

    #[test]
    fn short_image_is_rejected() {
        let f = flasher(SimulatedFlash::new("v1"));
        let image = app_image("v2", 0);
        let err = f
            .flash(&mut ReaderSource::new(Cursor::new(&image[..MIN_HEADER_LEN - 10])))
            .unwrap_err();
        assert!(matches!(err, OtaError::ImageTooSmall { .. }));
        assert_eq!(f.last_state(), FlashState::Rejected);
        f.with_backend(|sim| assert_eq!(sim.begin_calls(), 0));
    }

    #[test]
    fn validation_failure_leaves_partition_unbooted() {
        let mut sim = SimulatedFlash::new("v1");
        sim.fail_validation(true);
        let f = flasher(sim);
        let err = f
            .flash(&mut ReaderSource::new(Cursor::new(app_image("v2", 3000))))
            .unwrap_err();
        assert!(matches!(err, OtaError::ImageCorrupted(_)));
        f.with_backend(|sim| assert_eq!(sim.boot_target_label(), None));
    }

    #[test]
    fn boot_target_failure_is_best_effort() {
        let mut sim = SimulatedFlash::new("v1");
        sim.fail_set_boot(true);
        let f = flasher(sim);
        let report = f
            .flash(&mut ReaderSource::new(Cursor::new(app_image("v2", 3000))))
            .unwrap();
        assert!(!report.boot_target_set);
        assert_eq!(f.last_state(), FlashState::Committed);
    }

    #[test]
    fn write_failure_aborts_session() {
        let mut sim = SimulatedFlash::new("v1");
        sim.fail_write_after(2000);
        let f = flasher(sim);
        let err = f
            .flash(&mut ReaderSource::new(Cursor::new(app_image("v2", 8000))))
            .unwrap_err();
        assert!(matches!(err, OtaError::Flash(_)));
        f.with_backend(|sim| {
            assert_eq!(sim.abort_calls(), 1);
            assert_eq!(sim.end_calls(), 0);
        });
    }

    struct DropsAfter {
        data: Cursor<Vec<u8>>,
        limit: u64,
    }

    impl Read for DropsAfter {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.data.position() >= self.limit {
                return Err(io::Error::from(io::ErrorKind::ConnectionReset));
            }
            self.data.read(buf)
        }
    }

    #[test]
    fn connection_reset_is_transfer_interrupted() {
        let f = flasher(SimulatedFlash::new("v1"));
        let mut src = ReaderSource::new(DropsAfter {
            data: Cursor::new(app_image("v2", 8000)),
            limit: 3072,
        });
        let err = f.flash(&mut src).unwrap_err();
        assert!(matches!(err, OtaError::TransferInterrupted));
        f.with_backend(|sim| assert_eq!(sim.boot_target_label(), None));
    }
}
