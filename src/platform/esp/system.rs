/// Restart primitives, reset reason and link state on ESP-IDF
use std::time::{Duration, Instant};

use crate::ota::verify::Connectivity;
use crate::system::reboot::{ResetReason, SystemControl};

/// Hard reset gives up after this long if the watchdog never fires.
const WATCHDOG_SPIN_LIMIT: Duration = Duration::from_secs(10);

pub struct EspSystem;

impl SystemControl for EspSystem {
    fn soft_restart(&self) {
        log::info!("esp_restart");
        esp_idf_hal::reset::restart();
    }

    fn hard_restart(&self) {
        let config = esp_idf_sys::esp_task_wdt_config_t {
            timeout_ms: 1,
            idle_core_mask: (1 << esp_idf_sys::portNUM_PROCESSORS) - 1,
            trigger_panic: true,
        };
        unsafe {
            // Either call fails harmlessly if the watchdog is already set up
            if esp_idf_sys::esp_task_wdt_reconfigure(&config) != esp_idf_sys::ESP_OK {
                esp_idf_sys::esp_task_wdt_init(&config);
            }
            esp_idf_sys::esp_task_wdt_add(core::ptr::null_mut());
        }
        let started = Instant::now();
        while started.elapsed() < WATCHDOG_SPIN_LIMIT {
            core::hint::spin_loop();
        }
    }

    fn reset_reason(&self) -> ResetReason {
        let reason = unsafe { esp_idf_sys::esp_reset_reason() };

        #[allow(non_upper_case_globals)]
        match reason {
            esp_idf_sys::esp_reset_reason_t_ESP_RST_POWERON => ResetReason::PowerOn,
            esp_idf_sys::esp_reset_reason_t_ESP_RST_EXT => ResetReason::External,
            esp_idf_sys::esp_reset_reason_t_ESP_RST_SW => ResetReason::Software,
            esp_idf_sys::esp_reset_reason_t_ESP_RST_PANIC => ResetReason::Panic,
            esp_idf_sys::esp_reset_reason_t_ESP_RST_INT_WDT => ResetReason::InterruptWatchdog,
            esp_idf_sys::esp_reset_reason_t_ESP_RST_TASK_WDT => ResetReason::TaskWatchdog,
            esp_idf_sys::esp_reset_reason_t_ESP_RST_WDT => ResetReason::OtherWatchdog,
            esp_idf_sys::esp_reset_reason_t_ESP_RST_DEEPSLEEP => ResetReason::DeepSleep,
            esp_idf_sys::esp_reset_reason_t_ESP_RST_BROWNOUT => ResetReason::Brownout,
            esp_idf_sys::esp_reset_reason_t_ESP_RST_SDIO => ResetReason::Sdio,
            _ => ResetReason::Unknown,
        }
    }
}

/// Station interface has an IPv4 address.
pub struct StaConnectivity;

impl Connectivity for StaConnectivity {
    fn is_connected(&self) -> bool {
        unsafe {
            let mut ip_info: esp_idf_sys::esp_netif_ip_info_t = std::mem::zeroed();
            let netif = esp_idf_sys::esp_netif_get_handle_from_ifkey(
                b"WIFI_STA_DEF\0".as_ptr() as *const ::core::ffi::c_char,
            );
            !netif.is_null()
                && esp_idf_sys::esp_netif_get_ip_info(netif, &mut ip_info) == esp_idf_sys::ESP_OK
                && ip_info.ip.addr != 0
        }
    }
}
