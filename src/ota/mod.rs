// OTA (Over-The-Air) update module
//
// Update flow:
// 1. Resolve a manifest entry (url + sha256)
// 2. Download to <dest>.part, verify, rename into place
// 3. Schedule the install for the next boot
// 4. At boot: consume the marker, unpack the bundle, flash the inactive partition
// 5. Reboot into the new image and confirm it (or roll back)

pub mod archive;
pub mod digest;
pub mod download;
pub mod error;
pub mod flasher;
pub mod image;
pub mod manifest;
pub mod marker;
pub mod partition;
pub mod sim;
pub mod source;
pub mod update_task;
pub mod verify;

pub use archive::{ArchiveInstaller, AssetLayout, ExtractedBundle};
pub use digest::Sha256Digest;
pub use download::{DigestPolicy, DownloadTask, Downloaded};
pub use error::{OtaError, Result};
pub use flasher::{FlashReport, FlashState, PartitionFlasher};
pub use image::AppDescriptor;
pub use manifest::{ManifestRecord, UpdateManifest};
pub use marker::{InstallKind, PendingUpdate, UpdateMarker};
pub use partition::{BootControl, FlashBackend, PartitionDescriptor, VerifyState};
pub use source::{ByteSource, Chunk, HttpClient, ReaderSource};
pub use update_task::{BootDispatch, UpdateTask};
pub use verify::{
    BootVerifyMonitor, Connectivity, Diagnostic, MonitorStart, VerifyOutcome, VerifySettings,
};
