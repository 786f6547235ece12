/// Service shutdown ahead of a reboot
use std::sync::{Arc, atomic::{AtomicBool, Ordering}};
use std::thread;
use std::time::Duration;
use anyhow::Result;

/// Shutdown signal that can be shared across threads
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    shutdown_requested: Arc<AtomicBool>,
    shutdown_complete: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    /// Request shutdown of all services
    pub fn request_shutdown(&self) {
        log::info!("Shutdown requested");
        self.shutdown_requested.store(true, Ordering::Relaxed);
    }

    pub fn is_complete(&self) -> bool {
        self.shutdown_complete.load(Ordering::Relaxed)
    }

    fn mark_complete(&self) {
        self.shutdown_complete.store(true, Ordering::Relaxed);
    }
}

/// Which reboot flows stop a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownScope {
    /// Stopped before every reboot, including the post-update one.
    Always,
    /// Left running during the post-update reboot.
    GracefulOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Graceful,
    OtaUpdate,
}

/// Trait for services that need to stop before a reboot
pub trait ShutdownHandler: Send {
    /// Service name for logging
    fn name(&self) -> &str;

    /// Perform shutdown
    fn shutdown(&mut self) -> Result<()>;
}

/// Manager for coordinating shutdown
pub struct ShutdownManager {
    signal: ShutdownSignal,
    services: Vec<(ShutdownScope, Box<dyn ShutdownHandler>)>,
    settle: Duration,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            signal: ShutdownSignal::new(),
            services: Vec::new(),
            settle: Duration::from_millis(100),
        }
    }

    /// Time services get to observe the signal before being stopped.
    pub fn with_settle_time(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Get a clone of the shutdown signal
    pub fn get_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    pub fn register(&mut self, scope: ShutdownScope, service: Box<dyn ShutdownHandler>) {
        log::debug!("Registered {} for shutdown ({:?})", service.name(), scope);
        self.services.push((scope, service));
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Stop services in reverse registration order. Failures are logged and skipped.
    ///
    /// Returns the names of the services that were stopped.
    pub fn shutdown(&mut self, mode: ShutdownMode) -> Vec<String> {
        log::info!("Beginning {:?} shutdown sequence...", mode);
        self.signal.request_shutdown();
        thread::sleep(self.settle);

        let mut stopped = Vec::new();
        let mut kept = Vec::new();
        // Last registered first
        while let Some((scope, mut service)) = self.services.pop() {
            if mode == ShutdownMode::OtaUpdate && scope == ShutdownScope::GracefulOnly {
                kept.push((scope, service));
                continue;
            }
            match service.shutdown() {
                Ok(()) => log::info!("{} shutdown complete", service.name()),
                Err(e) => log::error!("{} shutdown failed: {:?}", service.name(), e),
            }
            stopped.push(service.name().to_string());
        }
        kept.reverse();
        self.services = kept;

        log::info!("{} services shut down", stopped.len());
        self.signal.mark_complete();
        stopped
    }
}
