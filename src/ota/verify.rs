// Post-boot verification - confirms a freshly flashed image or rolls it back

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::partition::{BootControl, VerifyState};

pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Whether the device currently has a usable network link.
pub trait Connectivity: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// Self-test run before the new image is confirmed.
pub trait Diagnostic: Send + Sync {
    fn name(&self) -> &str {
        "diagnostic"
    }
    fn run(&self) -> bool;
}

/// Diagnostic that always passes.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticPass;

impl Diagnostic for StaticPass {
    fn name(&self) -> &str {
        "static"
    }

    fn run(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Image confirmed. `connected` records whether the network came up in time.
    Valid { connected: bool },
    RolledBack,
    /// State was no longer pending after the wait; nothing to do.
    AlreadySettled(VerifyState),
    /// Platform refused to confirm or roll back.
    Failed,
}

/// What [`BootVerifyMonitor::start`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStart {
    Started,
    /// A task from an earlier call is still held.
    AlreadyRunning,
    /// Running image does not need confirming.
    NotPending(VerifyState),
    SpawnFailed,
}

#[derive(Debug, Clone, Copy)]
pub struct VerifySettings {
    pub network_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

pub struct BootVerifyMonitor {
    boot: Arc<dyn BootControl>,
    connectivity: Arc<dyn Connectivity>,
    diagnostic: Arc<dyn Diagnostic>,
    settings: VerifySettings,
    task: Mutex<Option<JoinHandle<VerifyOutcome>>>,
}

impl BootVerifyMonitor {
    pub fn new(boot: Arc<dyn BootControl>, connectivity: Arc<dyn Connectivity>) -> Self {
        Self {
            boot,
            connectivity,
            diagnostic: Arc::new(StaticPass),
            settings: VerifySettings::default(),
            task: Mutex::new(None),
        }
    }

    pub fn with_diagnostic(mut self, diagnostic: Arc<dyn Diagnostic>) -> Self {
        self.diagnostic = diagnostic;
        self
    }

    pub fn with_settings(mut self, settings: VerifySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Spawn the verification task if the running image is pending verification.
    pub fn start(&self) -> MonitorStart {
        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if task.is_some() {
            return MonitorStart::AlreadyRunning;
        }
        let state = self.boot.running_state();
        if state != VerifyState::PendingVerify {
            return MonitorStart::NotPending(state);
        }

        let boot = self.boot.clone();
        let connectivity = self.connectivity.clone();
        let diagnostic = self.diagnostic.clone();
        let settings = self.settings;
        let spawned = thread::Builder::new()
            .name("ota-verify".to_string())
            .stack_size(6 * 1024)
            .spawn(move || {
                verify_running_image(boot.as_ref(), connectivity.as_ref(), diagnostic.as_ref(), settings)
            });
        match spawned {
            Ok(handle) => {
                log::info!("Firmware verification task started");
                *task = Some(handle);
                MonitorStart::Started
            }
            Err(e) => {
                log::error!("Failed to spawn verification task: {}", e);
                MonitorStart::SpawnFailed
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Wait for the spawned task. `None` if no task was started.
    pub fn join(&self) -> Option<VerifyOutcome> {
        let handle = self.task.lock().unwrap_or_else(|p| p.into_inner()).take()?;
        match handle.join() {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                log::error!("Verification task panicked");
                Some(VerifyOutcome::Failed)
            }
        }
    }
}

/// Body of the verification task.
pub fn verify_running_image(
    boot: &dyn BootControl,
    connectivity: &dyn Connectivity,
    diagnostic: &dyn Diagnostic,
    settings: VerifySettings,
) -> VerifyOutcome {
    log::info!(
        "Waiting up to {}s for network before verifying firmware",
        settings.network_timeout.as_secs()
    );
    let connected = wait_for_network(connectivity, settings);
    if !connected {
        log::warn!("No network after {}s, verifying offline", settings.network_timeout.as_secs());
    }

    // Something else may have confirmed the image while we waited
    let state = boot.running_state();
    if state != VerifyState::PendingVerify {
        log::info!("Image state changed to {:?} during wait", state);
        return VerifyOutcome::AlreadySettled(state);
    }

    log::info!("Running {} diagnostic", diagnostic.name());
    if diagnostic.run() {
        match boot.mark_valid() {
            Ok(()) => {
                if connected {
                    log::info!("Diagnostics completed successfully! Continuing execution ...");
                } else {
                    log::info!("Diagnostics completed without network; image marked valid");
                }
                VerifyOutcome::Valid { connected }
            }
            Err(e) => {
                log::error!("Failed to mark running image valid: {}", e);
                VerifyOutcome::Failed
            }
        }
    } else {
        log::error!("Diagnostics failed! Start rollback to the previous version ...");
        match boot.mark_invalid_and_rollback() {
            Ok(()) => VerifyOutcome::RolledBack,
            Err(e) => {
                log::error!("Rollback failed: {}", e);
                VerifyOutcome::Failed
            }
        }
    }
}

fn wait_for_network(connectivity: &dyn Connectivity, settings: VerifySettings) -> bool {
    let deadline = Instant::now() + settings.network_timeout;
    loop {
        if connectivity.is_connected() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(settings.poll_interval);
    }
}

/// Log the running image digest and its verification state at boot.
pub fn log_boot_state(boot: &dyn BootControl) {
    match boot.running_sha256() {
        Some(sha) => log::info!("SHA-256 for current firmware: {}", hex::encode(sha)),
        None => log::debug!("Running partition digest unavailable"),
    }
    match boot.running_state() {
        VerifyState::PendingVerify => {
            log::warn!("Running image is pending verification; it will be rolled back if diagnostics fail")
        }
        VerifyState::RolledBack => log::warn!("Running image was reached through a rollback"),
        state => log::debug!("Running image state: {:?}", state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ota::sim::SimulatedBoot;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Link(AtomicBool);

    impl Connectivity for Link {
        fn is_connected(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Fails;

    impl Diagnostic for Fails {
        fn run(&self) -> bool {
            false
        }
    }

    fn fast() -> VerifySettings {
        VerifySettings {
            network_timeout: Duration::from_millis(30),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn monitor(boot: Arc<SimulatedBoot>, up: bool) -> BootVerifyMonitor {
        BootVerifyMonitor::new(boot, Arc::new(Link(AtomicBool::new(up)))).with_settings(fast())
    }

    #[test]
    fn pending_and_passing_becomes_valid() {
        let boot = Arc::new(SimulatedBoot::new(VerifyState::PendingVerify));
        let m = monitor(boot.clone(), true);
        assert_eq!(m.start(), MonitorStart::Started);
        assert_eq!(m.join(), Some(VerifyOutcome::Valid { connected: true }));
        assert_eq!(boot.running_state(), VerifyState::Valid);
        assert_eq!(boot.rollback_calls(), 0);
    }

    #[test]
    fn failing_diagnostic_rolls_back() {
        let boot = Arc::new(SimulatedBoot::new(VerifyState::PendingVerify));
        let m = monitor(boot.clone(), true).with_diagnostic(Arc::new(Fails));
        assert_eq!(m.start(), MonitorStart::Started);
        assert_eq!(m.join(), Some(VerifyOutcome::RolledBack));
        assert_eq!(boot.running_state(), VerifyState::RolledBack);
        assert_eq!(boot.mark_valid_calls(), 0);
    }

    #[test]
    fn not_pending_spawns_nothing() {
        let boot = Arc::new(SimulatedBoot::new(VerifyState::Valid));
        let m = monitor(boot.clone(), true);
        assert_eq!(m.start(), MonitorStart::NotPending(VerifyState::Valid));
        assert_eq!(m.join(), None);
        assert_eq!(boot.mark_valid_calls(), 0);
    }

    #[test]
    fn second_start_is_noop() {
        let boot = Arc::new(SimulatedBoot::new(VerifyState::PendingVerify));
        let m = monitor(boot.clone(), false);
        assert_eq!(m.start(), MonitorStart::Started);
        assert_eq!(m.start(), MonitorStart::AlreadyRunning);
        m.join();
        assert_eq!(boot.mark_valid_calls(), 1);
    }

    #[test]
    fn network_timeout_still_verifies() {
        let boot = SimulatedBoot::new(VerifyState::PendingVerify);
        let link = Link(AtomicBool::new(false));
        let outcome = verify_running_image(&boot, &link, &StaticPass, fast());
        assert_eq!(outcome, VerifyOutcome::Valid { connected: false });
    }

    struct CountingLink(AtomicUsize);

    impl Connectivity for CountingLink {
        fn is_connected(&self) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst) >= 2
        }
    }

    #[test]
    fn polls_until_connected() {
        let boot = SimulatedBoot::new(VerifyState::PendingVerify);
        let link = CountingLink(AtomicUsize::new(0));
        let settings = VerifySettings {
            network_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1),
        };
        let outcome = verify_running_image(&boot, &link, &StaticPass, settings);
        assert_eq!(outcome, VerifyOutcome::Valid { connected: true });
        assert_eq!(link.0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn settled_during_wait_is_noop() {
        let boot = SimulatedBoot::new(VerifyState::PendingVerify);
        boot.mark_valid().unwrap();
        let outcome = verify_running_image(&boot, &Link(AtomicBool::new(true)), &Fails, fast());
        assert_eq!(outcome, VerifyOutcome::AlreadySettled(VerifyState::Valid));
        assert_eq!(boot.rollback_calls(), 0);
    }
}
