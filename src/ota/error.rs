use std::fmt;
use std::io;

/// Everything that can go wrong between "fetch manifest" and "boot new image".
///
/// All variants are local to the request or task that triggered them; none of
/// them should take the process down. `BootLoopGuard` is the one deliberate
/// terminal state: the caller is expected to park and wait for a human.
#[derive(Debug)]
pub enum OtaError {
    /// Transport-level failure (connect, TLS, read).
    Network(String),
    /// Payload larger than the configured limit.
    SizeExceeded { limit: u64 },
    /// Computed digest (or byte count) does not match the manifest.
    IntegrityMismatch { expected: String, actual: String },
    /// Digest string is not 64 hex characters, or was required but missing.
    InvalidDigest(String),
    /// Manifest is not valid JSON or a matched entry is incomplete.
    InvalidManifest(String),
    /// Requested entry or file does not exist.
    NotFound(String),
    /// Caller-supplied name or path rejected before touching the filesystem.
    InvalidPath(String),
    /// Update bundle could not be read or contains unsafe entries.
    InvalidArchive(String),
    ImageTooSmall { len: usize, required: usize },
    ImageCorrupted(String),
    TransferInterrupted,
    /// New image carries the same version as the last rejected one.
    BootLoopGuard { version: String },
    /// Another flash session is already in flight.
    Busy,
    NoUpdatePartition,
    /// Vendor flash primitive failed.
    Flash(String),
    Io(io::Error),
    RebootFailed,
}

pub type Result<T> = std::result::Result<T, OtaError>;

impl OtaError {
    /// HTTP status the request layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            OtaError::InvalidDigest(_)
            | OtaError::InvalidManifest(_)
            | OtaError::InvalidPath(_)
            | OtaError::InvalidArchive(_) => 400,
            OtaError::NotFound(_) => 404,
            OtaError::Network(_)
            | OtaError::SizeExceeded { .. }
            | OtaError::IntegrityMismatch { .. }
            | OtaError::TransferInterrupted => 502,
            OtaError::Busy => 503,
            _ => 500,
        }
    }

    /// True for errors caused by a connection dropping mid-stream.
    pub(crate) fn from_read_error(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => OtaError::TransferInterrupted,
            _ => OtaError::Io(err),
        }
    }
}

impl fmt::Display for OtaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaError::Network(msg) => write!(f, "network error: {}", msg),
            OtaError::SizeExceeded { limit } => {
                write!(f, "payload exceeds limit of {} bytes", limit)
            }
            OtaError::IntegrityMismatch { expected, actual } => {
                write!(f, "integrity mismatch: expected {} got {}", expected, actual)
            }
            OtaError::InvalidDigest(msg) => write!(f, "invalid sha256: {}", msg),
            OtaError::InvalidManifest(msg) => write!(f, "invalid manifest: {}", msg),
            OtaError::NotFound(what) => write!(f, "not found: {}", what),
            OtaError::InvalidPath(msg) => write!(f, "invalid path: {}", msg),
            OtaError::InvalidArchive(msg) => write!(f, "invalid archive: {}", msg),
            OtaError::ImageTooSmall { len, required } => write!(
                f,
                "image too small: first chunk has {} bytes, header needs {}",
                len, required
            ),
            OtaError::ImageCorrupted(msg) => write!(f, "image corrupted: {}", msg),
            OtaError::TransferInterrupted => write!(f, "transfer interrupted (connection closed)"),
            OtaError::BootLoopGuard { version } => write!(
                f,
                "version {} was already rejected after a failed boot",
                version
            ),
            OtaError::Busy => write!(f, "another update is in progress"),
            OtaError::NoUpdatePartition => write!(f, "no OTA update partition available"),
            OtaError::Flash(msg) => write!(f, "flash error: {}", msg),
            OtaError::Io(err) => write!(f, "i/o error: {}", err),
            OtaError::RebootFailed => write!(f, "reboot did not take effect"),
        }
    }
}

impl std::error::Error for OtaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OtaError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for OtaError {
    fn from(err: io::Error) -> Self {
        OtaError::Io(err)
    }
}

impl From<serde_json::Error> for OtaError {
    fn from(err: serde_json::Error) -> Self {
        OtaError::InvalidManifest(err.to_string())
    }
}
