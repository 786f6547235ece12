use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::path::Path;
use std::sync::Arc;

use edge_digitizer::config::{self, OtaConfig};
use edge_digitizer::logging;
use edge_digitizer::ota::archive::ArchiveInstaller;
use edge_digitizer::ota::verify::{log_boot_state, BootVerifyMonitor, Connectivity, MonitorStart};
use edge_digitizer::ota::{BootControl, FlashBackend, PartitionFlasher, UpdateMarker, UpdateTask};
use edge_digitizer::system::{RebootOrchestrator, SystemControl};
use edge_digitizer::version;

// Generate ESP-IDF app descriptor
#[cfg(target_os = "espidf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

/// Everything that outlives the boot sequence.
struct Booted {
    config: OtaConfig,
    reboot: Arc<RebootOrchestrator>,
    monitor: BootVerifyMonitor,
}

/// Load config, open the log file, install any pending update and start
/// post-boot verification. Only returns if boot should carry on normally.
fn boot<B: FlashBackend + 'static>(
    defaults: OtaConfig,
    config_path: &Path,
    flash: B,
    boot_control: Arc<dyn BootControl>,
    system: Arc<dyn SystemControl>,
    link: Arc<dyn Connectivity>,
) -> Result<Booted> {
    let config = config::load_or(config_path, defaults);
    if !logging::set_max_level_from_str(&config.log_level) {
        warn!("Unknown log level '{}', keeping info", config.log_level);
    }
    if let Err(e) = logging::attach_log_file(&config.log_file) {
        warn!("Log file {} unavailable: {}", config.log_file.display(), e);
    }
    info!("Firmware {}", version::full_version());

    let reboot = Arc::new(
        RebootOrchestrator::new(system, config.reboot_marker.clone()).with_delays(config.reboot_delays()),
    );
    let reason = reboot.reset_reason();
    if reason.is_watchdog() {
        warn!("Reset reason: {}", reason);
    } else {
        info!("Reset reason: {}", reason);
    }
    if reboot.was_intentional_reboot() {
        info!("Previous reboot was requested");
    }

    log_boot_state(boot_control.as_ref());

    let flasher = Arc::new(PartitionFlasher::new(flash, config.flash_chunk_size));
    let task = UpdateTask::new(
        UpdateMarker::new(config.update_marker.clone()),
        ArchiveInstaller::new(config.asset_layout()),
        flasher,
        reboot.clone(),
    );
    let handle = task.spawn().context("spawning update task")?;
    match handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Update task failed: {}", e),
        Err(_) => error!("Update task panicked"),
    }

    let monitor = BootVerifyMonitor::new(boot_control, link).with_settings(config.verify_settings());
    match monitor.start() {
        MonitorStart::Started | MonitorStart::SpawnFailed => {}
        MonitorStart::NotPending(state) => debug!("Running image is {:?}, no verification needed", state),
        MonitorStart::AlreadyRunning => warn!("Boot verification already running"),
    }

    Ok(Booted {
        config,
        reboot,
        monitor,
    })
}

#[cfg(target_os = "espidf")]
fn main() -> Result<()> {
    use edge_digitizer::network::OtaService;
    use edge_digitizer::platform::esp::{
        web_server, EspBootControl, EspFlash, EspHttpClient, EspSystem, StaConnectivity,
    };
    use std::time::Duration;

    // Initialize ESP-IDF
    esp_idf_svc::sys::link_patches();
    logging::init_logger()?;

    // The card is mounted at /sdcard by the board bring-up before we get here
    let booted = boot(
        OtaConfig::default(),
        Path::new(config::DEFAULT_CONFIG_PATH),
        EspFlash,
        Arc::new(EspBootControl),
        Arc::new(EspSystem),
        Arc::new(StaConnectivity),
    )?;

    let client = Arc::new(EspHttpClient::new(Duration::from_secs(30)));
    let service = Arc::new(OtaService::new(booted.config.clone(), client));
    let _server = web_server::start_server(service, booted.reboot.clone())?;

    loop {
        std::thread::sleep(Duration::from_secs(60));
        if !booted.monitor.is_running() {
            if let Some(outcome) = booted.monitor.join() {
                info!("Boot verification finished: {:?}", outcome);
            }
        }
    }
}

/// Host simulator: `edge-digitizer [SD_ROOT] [QUERY ...]`
///
/// Runs the boot sequence against a directory standing in for the card,
/// then answers each query as `GET /ota?QUERY` would.
#[cfg(not(target_os = "espidf"))]
fn main() -> Result<()> {
    use edge_digitizer::network::OtaService;
    use edge_digitizer::ota::sim::{SimulatedBoot, SimulatedFlash};
    use edge_digitizer::ota::VerifyState;
    use edge_digitizer::platform::host::{FileHttpClient, HostLink, HostSystem};

    logging::init_logger()?;

    let mut args = std::env::args().skip(1);
    let root = args.next().unwrap_or_else(|| "./sdcard".to_string());
    let queries: Vec<String> = args.collect();

    let defaults = OtaConfig::under(&root);
    let config_path = defaults.config_dir.join("ota.json");
    let booted = boot(
        defaults,
        &config_path,
        SimulatedFlash::new(version::FIRMWARE_VERSION),
        Arc::new(SimulatedBoot::new(VerifyState::PendingVerify)),
        Arc::new(HostSystem),
        Arc::new(HostLink),
    )?;

    let service = OtaService::new(booted.config.clone(), Arc::new(FileHttpClient::new()));
    for query in &queries {
        let reply = service.handle(query);
        println!("{} {}", reply.status, reply.body.trim_end());
    }

    if let Some(outcome) = booted.monitor.join() {
        info!("Boot verification finished: {:?}", outcome);
    }

    // A scheduled install is picked up on the next run, as after a reboot
    if UpdateMarker::new(booted.config.update_marker.clone()).is_pending() {
        booted.reboot.reboot_for_update()?;
    }
    logging::detach_log_file();
    Ok(())
}
