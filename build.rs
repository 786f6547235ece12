fn main() -> anyhow::Result<()> {
    // Host builds (unit tests, simulator) have no ESP-IDF environment to export
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("espidf") {
        return Ok(());
    }

    // Necessary for ESP-IDF
    embuild::espidf::sysenv::output();

    // Add crash log helper for better panic diagnostics
    println!("cargo:rustc-link-arg=-Wl,--undefined=esp_backtrace_print_app_description");

    Ok(())
}
