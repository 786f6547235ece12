//! Controlled restarts: stop services, restart, and fall back to a hard reset.

use std::convert::Infallible;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::ota::{OtaError, Result};

use super::shutdown::{ShutdownHandler, ShutdownManager, ShutdownMode, ShutdownScope};

const REBOOT_MARKER_CONTENT: &str = "reboot";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    Unknown,
    PowerOn,
    External,
    Software,
    Panic,
    InterruptWatchdog,
    TaskWatchdog,
    OtherWatchdog,
    DeepSleep,
    Brownout,
    Sdio,
}

impl ResetReason {
    pub fn is_watchdog(self) -> bool {
        matches!(
            self,
            Self::InterruptWatchdog | Self::TaskWatchdog | Self::OtherWatchdog
        )
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "Unknown",
            Self::PowerOn => "Power-on",
            Self::External => "External pin",
            Self::Software => "Software reset",
            Self::Panic => "Panic",
            Self::InterruptWatchdog => "Interrupt watchdog",
            Self::TaskWatchdog => "Task watchdog",
            Self::OtherWatchdog => "Other watchdog",
            Self::DeepSleep => "Deep sleep",
            Self::Brownout => "Brownout",
            Self::Sdio => "SDIO",
        };
        f.write_str(s)
    }
}

/// Chip-level restart primitives.
///
/// On hardware neither restart returns. Simulated controls return, which the
/// orchestrator reports as [`OtaError::RebootFailed`].
pub trait SystemControl: Send + Sync {
    fn soft_restart(&self);
    /// Arm the task watchdog with a minimal timeout and spin until it fires.
    fn hard_restart(&self);
    fn reset_reason(&self) -> ResetReason;
}

#[derive(Debug, Clone, Copy)]
pub struct RebootDelays {
    /// Graceful path: after writing the marker, before stopping services.
    pub before_shutdown: Duration,
    pub after_shutdown: Duration,
    /// Both paths: how long a soft restart may take before the hard reset.
    pub soft_restart_timeout: Duration,
    /// Update path: after stopping services, before restarting.
    pub ota_settle: Duration,
}

impl Default for RebootDelays {
    fn default() -> Self {
        Self {
            before_shutdown: Duration::from_secs(3),
            after_shutdown: Duration::from_secs(3),
            soft_restart_timeout: Duration::from_secs(5),
            ota_settle: Duration::from_secs(5),
        }
    }
}

pub struct RebootOrchestrator {
    control: Arc<dyn SystemControl>,
    services: Mutex<ShutdownManager>,
    marker: PathBuf,
    delays: RebootDelays,
}

impl RebootOrchestrator {
    pub fn new(control: Arc<dyn SystemControl>, marker: impl Into<PathBuf>) -> Self {
        Self {
            control,
            services: Mutex::new(ShutdownManager::new()),
            marker: marker.into(),
            delays: RebootDelays::default(),
        }
    }

    pub fn with_delays(mut self, delays: RebootDelays) -> Self {
        self.delays = delays;
        self
    }

    pub fn with_shutdown_manager(mut self, manager: ShutdownManager) -> Self {
        self.services = Mutex::new(manager);
        self
    }

    pub fn register(&self, scope: ShutdownScope, service: Box<dyn ShutdownHandler>) {
        self.services
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .register(scope, service);
    }

    pub fn reset_reason(&self) -> ResetReason {
        self.control.reset_reason()
    }

    /// Operator-requested restart. Only returns if every restart attempt failed.
    pub fn reboot(&self, reason: &str) -> Result<Infallible> {
        log::info!("Reboot triggered by software ({})", reason);
        if let Err(e) = write_marker(&self.marker) {
            log::error!("Failed to write {}: {}", self.marker.display(), e);
        }
        log::info!("Reboot in {}sec", self.delays.before_shutdown.as_secs());
        thread::sleep(self.delays.before_shutdown);

        self.stop_services(ShutdownMode::Graceful);
        thread::sleep(self.delays.after_shutdown);
        self.restart()
    }

    /// Restart after an install. Only stops services registered for every reboot.
    pub fn reboot_for_update(&self) -> Result<Infallible> {
        log::info!("Reboot to activate new firmware");
        self.stop_services(ShutdownMode::OtaUpdate);
        thread::sleep(self.delays.ota_settle);
        self.restart()
    }

    /// Whether the previous boot ended in a requested reboot. Clears the marker.
    pub fn was_intentional_reboot(&self) -> bool {
        match fs::read_to_string(&self.marker) {
            Ok(content) => {
                if let Err(e) = fs::remove_file(&self.marker) {
                    log::warn!("Failed to remove {}: {}", self.marker.display(), e);
                }
                content.trim() == REBOOT_MARKER_CONTENT
            }
            Err(_) => false,
        }
    }

    fn stop_services(&self, mode: ShutdownMode) {
        let mut services = self.services.lock().unwrap_or_else(|p| p.into_inner());
        services.shutdown(mode);
    }

    fn restart(&self) -> Result<Infallible> {
        log::logger().flush();
        self.control.soft_restart();
        thread::sleep(self.delays.soft_restart_timeout);

        log::error!("Soft restart did not happen, forcing hard reset");
        log::logger().flush();
        self.control.hard_restart();

        log::error!("Hard reset failed");
        Err(OtaError::RebootFailed)
    }
}

fn write_marker(path: &Path) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(REBOOT_MARKER_CONTENT.as_bytes())?;
    file.sync_all()
}
