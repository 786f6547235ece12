pub mod reboot;
pub mod shutdown;

pub use reboot::{RebootDelays, RebootOrchestrator, ResetReason, SystemControl};
pub use shutdown::{ShutdownHandler, ShutdownManager, ShutdownMode, ShutdownScope, ShutdownSignal};
