//! Flash partitions and the narrow seam to the vendor OTA API.

use std::fmt;

use super::error::Result;
use super::image::AppDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    App,
    Data,
}

/// A fixed flash region holding one firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub label: String,
    pub address: u32,
    pub size: u32,
    pub kind: PartitionType,
    pub subtype: u8,
}

impl fmt::Display for PartitionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (subtype {}, offset 0x{:08x}, {} KB)",
            self.label,
            self.subtype,
            self.address,
            self.size / 1024
        )
    }
}

/// Persisted confirmation state of the running image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyState {
    /// Booted once after an update, not yet confirmed.
    PendingVerify,
    Valid,
    RolledBack,
    /// Factory image, or a state the platform does not report.
    Unknown,
}

/// Opaque handle returned by [`FlashBackend::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaHandle(pub u32);

/// Vendor flash primitives, isolated so the pipeline runs against a simulated flash.
///
/// `end` validates the written image; it fails with
/// [`OtaError::ImageCorrupted`](super::OtaError::ImageCorrupted) if the image
/// does not pass the structural/signature check.
pub trait FlashBackend: Send {
    fn running_partition(&self) -> Option<PartitionDescriptor>;
    /// Partition the bootloader is configured to start.
    fn boot_partition(&self) -> Option<PartitionDescriptor>;
    fn next_update_partition(&self) -> Option<PartitionDescriptor>;
    /// Partition most recently rejected after a failed post-boot verification.
    fn last_invalid_partition(&self) -> Option<PartitionDescriptor>;
    fn app_description(&self, partition: &PartitionDescriptor) -> Option<AppDescriptor>;

    fn begin(&mut self, partition: &PartitionDescriptor) -> Result<OtaHandle>;
    fn write(&mut self, handle: OtaHandle, data: &[u8]) -> Result<()>;
    fn end(&mut self, handle: OtaHandle) -> Result<()>;
    /// Release a session without validating it.
    fn abort(&mut self, handle: OtaHandle);
    fn set_boot_target(&mut self, partition: &PartitionDescriptor) -> Result<()>;
}

/// Boot-time confirmation primitives used by the verification monitor.
pub trait BootControl: Send + Sync {
    fn running_state(&self) -> VerifyState;
    /// Confirm the running image and cancel the pending rollback.
    fn mark_valid(&self) -> Result<()>;
    /// Mark the running image invalid and reboot into the previous one.
    /// On hardware this does not return.
    fn mark_invalid_and_rollback(&self) -> Result<()>;
    /// SHA-256 of the running partition, for the boot log.
    fn running_sha256(&self) -> Option<[u8; 32]> {
        None
    }
}
