// Centralized version information

// Version string as compared by the boot-loop guard and shown in the web UI
pub const FIRMWARE_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

// Full version string including the build target
pub fn full_version() -> String {
    format!("{} ({})", FIRMWARE_VERSION, std::env::consts::OS)
}

// One-line banner for the console logger
pub fn banner() -> String {
    format!("edge-digitizer {}", FIRMWARE_VERSION)
}
