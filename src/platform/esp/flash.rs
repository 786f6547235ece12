// OTA partitions through the raw ESP-IDF OTA API

use core::ffi::c_void;
use std::ffi::CString;

use esp_idf_sys::{
    esp, esp_app_desc_t, esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_boot_partition,
    esp_ota_get_last_invalid_partition, esp_ota_get_next_update_partition,
    esp_ota_get_partition_description, esp_ota_get_running_partition, esp_ota_get_state_partition,
    esp_ota_handle_t, esp_ota_img_states_t, esp_ota_img_states_t_ESP_OTA_IMG_ABORTED,
    esp_ota_img_states_t_ESP_OTA_IMG_INVALID, esp_ota_img_states_t_ESP_OTA_IMG_PENDING_VERIFY,
    esp_ota_img_states_t_ESP_OTA_IMG_VALID, esp_ota_mark_app_invalid_rollback_and_reboot,
    esp_ota_mark_app_valid_cancel_rollback, esp_ota_set_boot_partition, esp_ota_write,
    esp_partition_find_first, esp_partition_get_sha256, esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
    esp_partition_t, esp_partition_type_t_ESP_PARTITION_TYPE_APP, EspError,
    ESP_ERR_OTA_VALIDATE_FAILED, OTA_SIZE_UNKNOWN,
};

use crate::ota::image::AppDescriptor;
use crate::ota::partition::{
    BootControl, FlashBackend, OtaHandle, PartitionDescriptor, PartitionType, VerifyState,
};
use crate::ota::{OtaError, Result};

fn flash_err(what: &str, err: EspError) -> OtaError {
    OtaError::Flash(format!("{} failed ({})", what, err))
}

fn describe(raw: *const esp_partition_t) -> Option<PartitionDescriptor> {
    if raw.is_null() {
        return None;
    }
    // Safety: non-null partition pointers from the OTA API point into the static partition table
    let p = unsafe { &*raw };
    let label: Vec<u8> = p
        .label
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    Some(PartitionDescriptor {
        label: String::from_utf8_lossy(&label).into_owned(),
        address: p.address,
        size: p.size,
        kind: if p.type_ == esp_partition_type_t_ESP_PARTITION_TYPE_APP {
            PartitionType::App
        } else {
            PartitionType::Data
        },
        subtype: p.subtype as u8,
    })
}

fn lookup(partition: &PartitionDescriptor) -> Result<*const esp_partition_t> {
    let label = CString::new(partition.label.as_str())
        .map_err(|_| OtaError::Flash(format!("bad partition label {:?}", partition.label)))?;
    let raw = unsafe {
        esp_partition_find_first(
            esp_partition_type_t_ESP_PARTITION_TYPE_APP,
            esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
            label.as_ptr(),
        )
    };
    if raw.is_null() {
        return Err(OtaError::Flash(format!("partition {} not found", partition.label)));
    }
    Ok(raw)
}

fn app_desc(raw: *const esp_partition_t) -> Option<AppDescriptor> {
    let mut desc: esp_app_desc_t = unsafe { core::mem::zeroed() };
    esp!(unsafe { esp_ota_get_partition_description(raw, &mut desc) }).ok()?;
    // Safety: esp_app_desc_t is a plain repr(C) struct with the on-flash layout
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &desc as *const esp_app_desc_t as *const u8,
            core::mem::size_of::<esp_app_desc_t>(),
        )
    };
    AppDescriptor::parse(bytes).ok()
}

/// Flash backend over the ESP-IDF OTA partitions.
#[derive(Default)]
pub struct EspFlash;

impl FlashBackend for EspFlash {
    fn running_partition(&self) -> Option<PartitionDescriptor> {
        describe(unsafe { esp_ota_get_running_partition() })
    }

    fn boot_partition(&self) -> Option<PartitionDescriptor> {
        describe(unsafe { esp_ota_get_boot_partition() })
    }

    fn next_update_partition(&self) -> Option<PartitionDescriptor> {
        describe(unsafe { esp_ota_get_next_update_partition(core::ptr::null()) })
    }

    fn last_invalid_partition(&self) -> Option<PartitionDescriptor> {
        describe(unsafe { esp_ota_get_last_invalid_partition() })
    }

    fn app_description(&self, partition: &PartitionDescriptor) -> Option<AppDescriptor> {
        app_desc(lookup(partition).ok()?)
    }

    fn begin(&mut self, partition: &PartitionDescriptor) -> Result<OtaHandle> {
        let raw = lookup(partition)?;
        let mut handle: esp_ota_handle_t = 0;
        esp!(unsafe { esp_ota_begin(raw, OTA_SIZE_UNKNOWN as _, &mut handle) })
            .map_err(|e| flash_err("esp_ota_begin", e))?;
        Ok(OtaHandle(handle as u32))
    }

    fn write(&mut self, handle: OtaHandle, data: &[u8]) -> Result<()> {
        esp!(unsafe {
            esp_ota_write(handle.0 as esp_ota_handle_t, data.as_ptr() as *const c_void, data.len() as _)
        })
        .map_err(|e| flash_err("esp_ota_write", e))
    }

    fn end(&mut self, handle: OtaHandle) -> Result<()> {
        let result = unsafe { esp_ota_end(handle.0 as esp_ota_handle_t) };
        if result == ESP_ERR_OTA_VALIDATE_FAILED as i32 {
            return Err(OtaError::ImageCorrupted("esp_ota_end: image validation failed".into()));
        }
        esp!(result).map_err(|e| flash_err("esp_ota_end", e))
    }

    fn abort(&mut self, handle: OtaHandle) {
        if let Err(e) = esp!(unsafe { esp_ota_abort(handle.0 as esp_ota_handle_t) }) {
            log::warn!("esp_ota_abort failed ({})", e);
        }
    }

    fn set_boot_target(&mut self, partition: &PartitionDescriptor) -> Result<()> {
        let raw = lookup(partition)?;
        esp!(unsafe { esp_ota_set_boot_partition(raw) })
            .map_err(|e| flash_err("esp_ota_set_boot_partition", e))
    }
}

/// Rollback state of the running image.
#[derive(Default)]
pub struct EspBootControl;

impl BootControl for EspBootControl {
    fn running_state(&self) -> VerifyState {
        let running = unsafe { esp_ota_get_running_partition() };
        if running.is_null() {
            return VerifyState::Unknown;
        }
        let mut state: esp_ota_img_states_t = 0;
        if esp!(unsafe { esp_ota_get_state_partition(running, &mut state) }).is_err() {
            // Factory image or rollback disabled
            return VerifyState::Unknown;
        }
        #[allow(non_upper_case_globals)]
        match state {
            esp_ota_img_states_t_ESP_OTA_IMG_PENDING_VERIFY => VerifyState::PendingVerify,
            esp_ota_img_states_t_ESP_OTA_IMG_VALID => VerifyState::Valid,
            esp_ota_img_states_t_ESP_OTA_IMG_INVALID | esp_ota_img_states_t_ESP_OTA_IMG_ABORTED => {
                VerifyState::RolledBack
            }
            _ => VerifyState::Unknown,
        }
    }

    fn mark_valid(&self) -> Result<()> {
        esp!(unsafe { esp_ota_mark_app_valid_cancel_rollback() })
            .map_err(|e| flash_err("esp_ota_mark_app_valid_cancel_rollback", e))
    }

    fn mark_invalid_and_rollback(&self) -> Result<()> {
        log::logger().flush();
        // Reboots on success
        esp!(unsafe { esp_ota_mark_app_invalid_rollback_and_reboot() })
            .map_err(|e| flash_err("esp_ota_mark_app_invalid_rollback_and_reboot", e))
    }

    fn running_sha256(&self) -> Option<[u8; 32]> {
        let mut sha = [0u8; 32];
        let running = unsafe { esp_ota_get_running_partition() };
        if running.is_null() {
            return None;
        }
        esp!(unsafe { esp_partition_get_sha256(running, sha.as_mut_ptr()) }).ok()?;
        Some(sha)
    }
}
