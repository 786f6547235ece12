//! In-memory flash and boot control for host builds and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::error::{OtaError, Result};
use super::image::{AppDescriptor, IMAGE_HEADER_LEN, IMAGE_MAGIC, MIN_HEADER_LEN, SEGMENT_HEADER_LEN};
use super::partition::{
    BootControl, FlashBackend, OtaHandle, PartitionDescriptor, PartitionType, VerifyState,
};

const SLOT_SIZE: u32 = 0x1E_0000;
const SLOTS: [(&str, u32, u8); 2] = [("ota_0", 0x1_0000, 0x10), ("ota_1", 0x1F_0000, 0x11)];

fn slot(index: usize) -> PartitionDescriptor {
    let (label, address, subtype) = SLOTS[index % SLOTS.len()];
    PartitionDescriptor {
        label: label.to_string(),
        address,
        size: SLOT_SIZE,
        kind: PartitionType::App,
        subtype,
    }
}

pub fn descriptor(version: &str) -> AppDescriptor {
    let mut desc = AppDescriptor::default();
    for c in version.chars() {
        if desc.version.push(c).is_err() {
            break;
        }
    }
    let _ = desc.project_name.push_str("edge-digitizer");
    let _ = desc.idf_ver.push_str("v5.3.2");
    desc
}

/// Build a structurally valid app image of `MIN_HEADER_LEN + body_len` bytes.
pub fn app_image(version: &str, body_len: usize) -> Vec<u8> {
    let mut image = vec![0u8; MIN_HEADER_LEN + body_len];
    image[0] = IMAGE_MAGIC;
    image[1] = 3;
    image[4..8].copy_from_slice(&0x4037_5000u32.to_le_bytes());
    image[IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN..MIN_HEADER_LEN]
        .copy_from_slice(&descriptor(version).encode());
    for (i, b) in image[MIN_HEADER_LEN..].iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    image
}

#[derive(Debug, Default)]
struct Calls {
    begin: usize,
    end: usize,
    abort: usize,
}

/// Two-slot OTA flash. Slot 0 runs, slot 1 receives updates until
/// [`SimulatedFlash::reboot`] switches them.
#[derive(Debug)]
pub struct SimulatedFlash {
    running: usize,
    boot_target: Option<usize>,
    apps: HashMap<usize, AppDescriptor>,
    images: HashMap<usize, Vec<u8>>,
    last_invalid: Option<usize>,
    session: Option<(OtaHandle, usize, Vec<u8>)>,
    next_handle: u32,
    calls: Calls,
    fail_validation: bool,
    fail_set_boot: bool,
    fail_write_after: Option<usize>,
}

impl SimulatedFlash {
    pub fn new(running_version: &str) -> Self {
        let mut apps = HashMap::new();
        apps.insert(0, descriptor(running_version));
        Self {
            running: 0,
            boot_target: None,
            apps,
            images: HashMap::new(),
            last_invalid: None,
            session: None,
            next_handle: 1,
            calls: Calls::default(),
            fail_validation: false,
            fail_set_boot: false,
            fail_write_after: None,
        }
    }

    /// Pretend the inactive slot holds `version` and was rolled back.
    pub fn set_last_invalid(&mut self, version: &str) {
        let slot = self.inactive();
        self.apps.insert(slot, descriptor(version));
        self.last_invalid = Some(slot);
    }

    pub fn fail_validation(&mut self, fail: bool) {
        self.fail_validation = fail;
    }

    pub fn fail_set_boot(&mut self, fail: bool) {
        self.fail_set_boot = fail;
    }

    /// Reject writes once the session holds more than `bytes`.
    pub fn fail_write_after(&mut self, bytes: usize) {
        self.fail_write_after = Some(bytes);
    }

    pub fn running_version(&self) -> Option<String> {
        self.apps.get(&self.running).map(|d| d.version.to_string())
    }

    /// Image committed to the inactive slot by the last successful `end`.
    pub fn written_image(&self) -> Option<&[u8]> {
        self.images.get(&self.inactive()).map(Vec::as_slice)
    }

    pub fn boot_target_label(&self) -> Option<String> {
        self.boot_target.map(|i| slot(i).label)
    }

    pub fn begin_calls(&self) -> usize {
        self.calls.begin
    }

    pub fn end_calls(&self) -> usize {
        self.calls.end
    }

    pub fn abort_calls(&self) -> usize {
        self.calls.abort
    }

    /// Restart into the boot target. Returns `true` if the running slot changed.
    pub fn reboot(&mut self) -> bool {
        match self.boot_target.take() {
            Some(target) if target != self.running => {
                self.running = target;
                true
            }
            _ => false,
        }
    }

    fn inactive(&self) -> usize {
        (self.running + 1) % SLOTS.len()
    }

    fn index_of(&self, partition: &PartitionDescriptor) -> Option<usize> {
        SLOTS.iter().position(|(label, ..)| *label == partition.label)
    }
}

impl FlashBackend for SimulatedFlash {
    fn running_partition(&self) -> Option<PartitionDescriptor> {
        Some(slot(self.running))
    }

    fn boot_partition(&self) -> Option<PartitionDescriptor> {
        Some(slot(self.boot_target.unwrap_or(self.running)))
    }

    fn next_update_partition(&self) -> Option<PartitionDescriptor> {
        Some(slot(self.inactive()))
    }

    fn last_invalid_partition(&self) -> Option<PartitionDescriptor> {
        self.last_invalid.map(slot)
    }

    fn app_description(&self, partition: &PartitionDescriptor) -> Option<AppDescriptor> {
        self.index_of(partition).and_then(|i| self.apps.get(&i).cloned())
    }

    fn begin(&mut self, partition: &PartitionDescriptor) -> Result<OtaHandle> {
        self.calls.begin += 1;
        let index = self
            .index_of(partition)
            .ok_or_else(|| OtaError::Flash(format!("unknown partition {}", partition.label)))?;
        if index == self.running {
            return Err(OtaError::Flash("cannot write the running partition".into()));
        }
        if self.session.is_some() {
            return Err(OtaError::Flash("OTA session already open".into()));
        }
        let handle = OtaHandle(self.next_handle);
        self.next_handle += 1;
        self.session = Some((handle, index, Vec::new()));
        Ok(handle)
    }

    fn write(&mut self, handle: OtaHandle, data: &[u8]) -> Result<()> {
        let limit = self.fail_write_after;
        match self.session.as_mut() {
            Some((h, _, buf)) if *h == handle => {
                if limit.is_some_and(|l| buf.len() + data.len() > l) {
                    return Err(OtaError::Flash("esp_ota_write failed (0x103)".into()));
                }
                if buf.len() + data.len() > SLOT_SIZE as usize {
                    return Err(OtaError::Flash("image larger than partition".into()));
                }
                buf.extend_from_slice(data);
                Ok(())
            }
            _ => Err(OtaError::Flash("invalid OTA handle".into())),
        }
    }

    fn end(&mut self, handle: OtaHandle) -> Result<()> {
        self.calls.end += 1;
        let (index, image) = match self.session.take() {
            Some((h, index, image)) if h == handle => (index, image),
            other => {
                self.session = other;
                return Err(OtaError::Flash("invalid OTA handle".into()));
            }
        };
        if self.fail_validation {
            return Err(OtaError::ImageCorrupted("image validation failed".into()));
        }
        let desc = AppDescriptor::from_image(&image)?;
        self.apps.insert(index, desc);
        self.images.insert(index, image);
        Ok(())
    }

    fn abort(&mut self, handle: OtaHandle) {
        self.calls.abort += 1;
        if matches!(self.session, Some((h, ..)) if h == handle) {
            self.session = None;
        }
    }

    fn set_boot_target(&mut self, partition: &PartitionDescriptor) -> Result<()> {
        if self.fail_set_boot {
            return Err(OtaError::Flash("esp_ota_set_boot_partition failed".into()));
        }
        let index = self
            .index_of(partition)
            .filter(|i| self.images.contains_key(i) || *i == self.running)
            .ok_or_else(|| OtaError::Flash(format!("{} holds no valid image", partition.label)))?;
        self.boot_target = Some(index);
        Ok(())
    }
}

/// Boot confirmation state held in memory.
#[derive(Debug)]
pub struct SimulatedBoot {
    state: Mutex<VerifyState>,
    mark_valid_calls: AtomicUsize,
    rollback_calls: AtomicUsize,
}

impl SimulatedBoot {
    pub fn new(state: VerifyState) -> Self {
        Self {
            state: Mutex::new(state),
            mark_valid_calls: AtomicUsize::new(0),
            rollback_calls: AtomicUsize::new(0),
        }
    }

    pub fn mark_valid_calls(&self) -> usize {
        self.mark_valid_calls.load(Ordering::SeqCst)
    }

    pub fn rollback_calls(&self) -> usize {
        self.rollback_calls.load(Ordering::SeqCst)
    }
}

impl BootControl for SimulatedBoot {
    fn running_state(&self) -> VerifyState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn mark_valid(&self) -> Result<()> {
        self.mark_valid_calls.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = VerifyState::Valid;
        Ok(())
    }

    fn mark_invalid_and_rollback(&self) -> Result<()> {
        self.rollback_calls.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = VerifyState::RolledBack;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reboot_switches_to_committed_slot() {
        let mut sim = SimulatedFlash::new("v1");
        let target = sim.next_update_partition().unwrap();
        let h = sim.begin(&target).unwrap();
        sim.write(h, &app_image("v2", 100)).unwrap();
        sim.end(h).unwrap();
        sim.set_boot_target(&target).unwrap();

        assert!(sim.reboot());
        assert_eq!(sim.running_version().as_deref(), Some("v2"));
        assert_eq!(sim.running_partition().unwrap().label, "ota_1");
    }

    #[test]
    fn boot_target_requires_committed_image() {
        let mut sim = SimulatedFlash::new("v1");
        let target = sim.next_update_partition().unwrap();
        assert!(sim.set_boot_target(&target).is_err());
    }
}
