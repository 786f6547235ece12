// Host stand-ins used by the simulator binary

use std::fs::File;
use std::io;
use std::path::PathBuf;

use crate::ota::source::{ByteSource, HttpClient, ReaderSource};
use crate::ota::verify::Connectivity;
use crate::ota::{OtaError, Result};
use crate::system::reboot::{ResetReason, SystemControl};

/// Serves `file://` URLs, optionally relative to a base directory.
#[derive(Debug, Clone, Default)]
pub struct FileHttpClient {
    base: Option<PathBuf>,
}

impl FileHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        Self { base: Some(base.into()) }
    }

    fn resolve(&self, url: &str) -> Result<PathBuf> {
        let path = url
            .strip_prefix("file://")
            .ok_or_else(|| OtaError::Network(format!("unsupported scheme in {}", url)))?;
        Ok(match &self.base {
            Some(base) => base.join(path.trim_start_matches('/')),
            None => PathBuf::from(path),
        })
    }
}

impl HttpClient for FileHttpClient {
    fn get<'a>(&'a self, url: &str) -> Result<Box<dyn ByteSource + 'a>> {
        let path = self.resolve(url)?;
        let file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => OtaError::Network(format!("{}: HTTP 404", url)),
            _ => OtaError::Network(format!("{}: {}", url, e)),
        })?;
        log::debug!("Serving {} from {}", url, path.display());
        Ok(Box::new(ReaderSource::new(file)))
    }
}

/// A restart on the host ends the process.
pub struct HostSystem;

impl SystemControl for HostSystem {
    fn soft_restart(&self) {
        log::info!("Restart requested, exiting simulator");
        log::logger().flush();
        std::process::exit(0);
    }

    fn hard_restart(&self) {
        std::process::exit(1);
    }

    fn reset_reason(&self) -> ResetReason {
        ResetReason::PowerOn
    }
}

/// The host is always online.
pub struct HostLink;

impl Connectivity for HostLink {
    fn is_connected(&self) -> bool {
        true
    }
}
