//! Runtime registry of backend families.
//!
//! Families register themselves by tag at start-up, so callers can enumerate devices and obtain
//! backends and buffer types without compile-time knowledge of which accelerator libraries are
//! present. Families can be registered from any crate, including external ones.

use std::sync::{Arc, OnceLock, RwLock};

use crate::buffer::{BufferType, HostBufferType, HostRegistration};
use crate::device::{Device, MemoryInfo};
use crate::error::{BackendError, BackendResult};

use super::family::BackendFamily;
use super::handle::BackendHandle;

/// Table of backend families keyed by family tag, in registration order.
pub struct BackendRegistry {
    families: RwLock<Vec<Arc<dyn BackendFamily>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            families: RwLock::new(Vec::new()),
        }
    }

    /// Adds a family. Each tag may be registered once.
    pub fn register_family(&self, family: Arc<dyn BackendFamily>) -> BackendResult<()> {
        let mut families = self.families.write().expect("backend registry poisoned");
        if families.iter().any(|existing| existing.name() == family.name()) {
            return Err(BackendError::DuplicateFamily(family.name().to_string()));
        }
        tracing::info!(
            family = family.name(),
            devices = family.count(),
            "registered backend family"
        );
        families.push(family);
        Ok(())
    }

    pub fn family(&self, name: &str) -> Option<Arc<dyn BackendFamily>> {
        self.families
            .read()
            .expect("backend registry poisoned")
            .iter()
            .find(|family| family.name() == name)
            .cloned()
    }

    pub fn has_family(&self, name: &str) -> bool {
        self.family(name).is_some()
    }

    pub fn list_families(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|family| family.name().to_string())
            .collect()
    }

    /// Number of accelerator devices, excluding the always-present CPU.
    pub fn get_count(&self) -> usize {
        self.snapshot()
            .iter()
            .flat_map(|family| family.devices())
            .filter(|device| !device.is_cpu())
            .count()
    }

    /// Every device, accelerators first in family registration order, CPU devices last.
    ///
    /// The position in this list is the device's global index.
    pub fn devices(&self) -> Vec<Device> {
        let (cpus, mut accelerators): (Vec<Device>, Vec<Device>) = self
            .snapshot()
            .iter()
            .flat_map(|family| family.devices())
            .partition(Device::is_cpu);
        accelerators.extend(cpus);
        accelerators
    }

    /// Writes the description of `device` into `out`, NUL-terminated and truncated to fit.
    ///
    /// # Panics
    ///
    /// If `device` does not belong to a registered family or its ordinal is out of range.
    pub fn device_description(&self, device: &Device, out: &mut [u8]) -> usize {
        self.known_family(device)
            .write_description(device.ordinal(), out)
    }

    /// Best-effort free/total memory of `device`.
    ///
    /// # Panics
    ///
    /// If `device` does not belong to a registered family or its ordinal is out of range.
    pub fn device_memory(&self, device: &Device) -> MemoryInfo {
        self.known_family(device).memory(device.ordinal())
    }

    pub fn backend_init(&self, device: &Device) -> BackendResult<BackendHandle> {
        let family = self.family_for(device)?;
        tracing::debug!(device = %device, "initialising backend");
        family.init_backend(device)
    }

    pub fn get_device_buffer_type(&self, device: &Device) -> BackendResult<Arc<dyn BufferType>> {
        self.family_for(device)?.device_buffer_type(device)
    }

    /// Split buffer type over the devices of `main_device`'s family, one ratio per device.
    pub fn get_split_buffer_type(
        &self,
        main_device: &Device,
        ratios: &[f32],
    ) -> BackendResult<Arc<dyn BufferType>> {
        self.family_for(main_device)?
            .split_buffer_type(main_device, ratios)
    }

    /// Pinned host type of the first accelerator family offering one, else plain host memory.
    pub fn get_host_buffer_type(&self) -> Arc<dyn BufferType> {
        let pinned = self
            .snapshot()
            .iter()
            .find_map(|family| family.host_buffer_type());
        match pinned {
            Some(buffer_type) => buffer_type,
            None => HostBufferType::shared(),
        }
    }

    /// Registers `region` with the first family that accepts it.
    pub fn register_host_buffer<'a>(
        &self,
        region: &'a mut [u8],
    ) -> BackendResult<HostRegistration<'a>> {
        let families = self.snapshot();
        let mut candidates = families
            .iter()
            .filter(|family| family.host_buffer_type().is_some());
        match candidates.next() {
            Some(family) => family.register_host_buffer(region),
            None => Err(BackendError::registration(
                "no registered family supports host buffer registration",
            )),
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn BackendFamily>> {
        self.families
            .read()
            .expect("backend registry poisoned")
            .clone()
    }

    fn family_for(&self, device: &Device) -> BackendResult<Arc<dyn BackendFamily>> {
        let family = self.family(device.family()).ok_or_else(|| {
            BackendError::device_unavailable(device, "no backend family registered under this tag")
        })?;
        if device.ordinal() >= family.count() {
            return Err(BackendError::device_unavailable(
                device,
                format!("family {} has {} devices", family.name(), family.count()),
            ));
        }
        Ok(family)
    }

    #[track_caller]
    fn known_family(&self, device: &Device) -> Arc<dyn BackendFamily> {
        match self.family(device.family()) {
            Some(family) => family,
            None => panic!("device {device} belongs to no registered backend family"),
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();

/// Process-wide registry, created empty on first use.
pub fn global_registry() -> &'static BackendRegistry {
    GLOBAL_REGISTRY.get_or_init(BackendRegistry::new)
}

/// Register a family with the global registry.
pub fn register_family(family: Arc<dyn BackendFamily>) -> BackendResult<()> {
    global_registry().register_family(family)
}

pub fn has_family(name: &str) -> bool {
    global_registry().has_family(name)
}

pub fn list_families() -> Vec<String> {
    global_registry().list_families()
}

pub fn device_count() -> usize {
    global_registry().get_count()
}

pub fn devices() -> Vec<Device> {
    global_registry().devices()
}

pub fn device_description(device: &Device, out: &mut [u8]) -> usize {
    global_registry().device_description(device, out)
}

pub fn device_memory(device: &Device) -> MemoryInfo {
    global_registry().device_memory(device)
}

pub fn backend_init(device: &Device) -> BackendResult<BackendHandle> {
    global_registry().backend_init(device)
}

pub fn buffer_type_for_device(device: &Device) -> BackendResult<Arc<dyn BufferType>> {
    global_registry().get_device_buffer_type(device)
}

pub fn split_buffer_type(main_device: &Device, ratios: &[f32]) -> BackendResult<Arc<dyn BufferType>> {
    global_registry().get_split_buffer_type(main_device, ratios)
}

pub fn host_buffer_type() -> Arc<dyn BufferType> {
    global_registry().get_host_buffer_type()
}

pub fn register_host_buffer(region: &mut [u8]) -> BackendResult<HostRegistration<'_>> {
    global_registry().register_host_buffer(region)
}
