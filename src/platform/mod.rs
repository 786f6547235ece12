//! Platform adapters: ESP-IDF on target, plain files and processes on the host.

#[cfg(target_os = "espidf")]
pub mod esp;

pub mod host;
