//! Firmware update and integrity-verification core for a dual-partition
//! ESP32 image-reading device.
//!
//! Everything outside [`platform::esp`] is hardware independent and runs on
//! the host against [`ota::sim::SimulatedFlash`].

pub mod config;
pub mod logging;
pub mod network;
pub mod ota;
pub mod platform;
pub mod system;
pub mod version;
