use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use crate::buffer::{
    check_range, BufferKind, BufferMemory, BufferType, HostPinning, HostRegistration,
};
use crate::device::Device;
use crate::error::{BackendError, BackendResult};

use super::driver::{AcceleratorDriver, DevicePtr, HOST_PAGE_SIZE};

/// Memory on a single accelerator device.
pub struct DeviceBufferType {
    name: String,
    device: Device,
    driver: Arc<dyn AcceleratorDriver>,
}

impl DeviceBufferType {
    pub fn new(device: Device, driver: Arc<dyn AcceleratorDriver>) -> Self {
        Self {
            name: format!("{}{}", device.family().to_ascii_uppercase(), device.ordinal()),
            device,
            driver,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl BufferType for DeviceBufferType {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BufferKind {
        BufferKind::Device
    }

    fn alignment(&self) -> usize {
        self.driver.device_alignment()
    }

    fn supports_device(&self, device: &Device) -> bool {
        *device == self.device
    }

    fn alloc_memory(&self, size: usize) -> BackendResult<Box<dyn BufferMemory>> {
        let ordinal = self.device.ordinal();
        let ptr = if size == 0 {
            0
        } else {
            self.driver.alloc_device(ordinal, size).map_err(|err| {
                tracing::debug!(buffer_type = %self.name, size, "device allocation failed: {err}");
                BackendError::allocation(&self.name, size, err.to_string())
            })?
        };
        Ok(Box::new(DeviceMemory {
            driver: Arc::clone(&self.driver),
            ordinal,
            ptr,
            len: size,
        }))
    }
}

/// Device allocation freed through the driver on drop.
pub struct DeviceMemory {
    driver: Arc<dyn AcceleratorDriver>,
    ordinal: usize,
    ptr: DevicePtr,
    len: usize,
}

impl DeviceMemory {
    pub fn device_ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}

impl BufferMemory for DeviceMemory {
    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> BackendResult<()> {
        check_range(self.len, offset, out.len())?;
        if out.is_empty() {
            return Ok(());
        }
        self.driver
            .copy_from_device(self.ordinal, out, self.ptr + offset as u64)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> BackendResult<()> {
        check_range(self.len, offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        self.driver
            .copy_to_device(self.ordinal, self.ptr + offset as u64, data)
    }

    fn fill(&mut self, value: u8) -> BackendResult<()> {
        if self.len == 0 {
            return Ok(());
        }
        self.driver.memset(self.ordinal, self.ptr, value, self.len)
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        if let Err(err) = self.driver.free_device(self.ordinal, self.ptr) {
            tracing::warn!(
                ordinal = self.ordinal,
                ptr = format_args!("{:#x}", self.ptr),
                "failed to free device memory: {err}"
            );
        }
    }
}

/// Page-locked host memory allocated by the driver for fast transfers.
pub struct PinnedHostBufferType {
    name: String,
    family: String,
    driver: Arc<dyn AcceleratorDriver>,
}

impl PinnedHostBufferType {
    pub fn new(driver: Arc<dyn AcceleratorDriver>) -> Self {
        Self {
            name: format!("{}_Host", driver.name().to_ascii_uppercase()),
            family: driver.name().to_string(),
            driver,
        }
    }
}

impl BufferType for PinnedHostBufferType {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BufferKind {
        BufferKind::PinnedHost
    }

    fn alignment(&self) -> usize {
        crate::buffer::TENSOR_ALIGNMENT
    }

    fn supports_device(&self, device: &Device) -> bool {
        device.is_cpu() || device.family() == self.family
    }

    fn alloc_memory(&self, size: usize) -> BackendResult<Box<dyn BufferMemory>> {
        let capacity = size.max(1);
        let ptr = self
            .driver
            .alloc_pinned(capacity)
            .map_err(|err| BackendError::allocation(&self.name, size, err.to_string()))?;
        Ok(Box::new(PinnedMemory {
            driver: Arc::clone(&self.driver),
            ptr,
            capacity,
            len: size,
        }))
    }
}

/// Host allocation page-locked by the driver; unpinned and freed on drop.
pub struct PinnedMemory {
    driver: Arc<dyn AcceleratorDriver>,
    ptr: NonNull<u8>,
    capacity: usize,
    len: usize,
}

// SAFETY: the allocation is exclusively owned; shared access only hands out `&[u8]`.
unsafe impl Send for PinnedMemory {}
unsafe impl Sync for PinnedMemory {}

impl PinnedMemory {
    fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` addresses `capacity >= len` bytes owned by this value.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl BufferMemory for PinnedMemory {
    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> BackendResult<()> {
        check_range(self.len, offset, out.len())?;
        out.copy_from_slice(&self.as_slice()[offset..offset + out.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> BackendResult<()> {
        check_range(self.len, offset, data.len())?;
        self.as_mut_slice()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn fill(&mut self, value: u8) -> BackendResult<()> {
        self.as_mut_slice().fill(value);
        Ok(())
    }

    fn host_bytes(&self) -> Option<&[u8]> {
        Some(self.as_slice())
    }

    fn host_bytes_mut(&mut self) -> Option<&mut [u8]> {
        Some(self.as_mut_slice())
    }
}

impl Drop for PinnedMemory {
    fn drop(&mut self) {
        // SAFETY: `ptr` and `capacity` are exactly what `alloc_pinned` handed out.
        if let Err(err) = unsafe { self.driver.free_pinned(self.ptr, self.capacity) } {
            tracing::warn!(len = self.len, "failed to free pinned host memory: {err}");
        }
    }
}

/// Book-keeping for caller-owned host regions registered with a driver.
///
/// A region start may be registered once at a time; a second registration of the same address
/// fails with `RegistrationFailure` until the first guard is released.
pub struct HostPins {
    driver: Arc<dyn AcceleratorDriver>,
    enabled: bool,
    registered: Mutex<HashSet<usize>>,
}

impl HostPins {
    pub fn new(driver: Arc<dyn AcceleratorDriver>, enabled: bool) -> Self {
        Self {
            driver,
            enabled,
            registered: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn registered_count(&self) -> usize {
        self.registered.lock().expect("host pin set poisoned").len()
    }

    pub fn pin<'a>(self: &Arc<Self>, region: &'a mut [u8]) -> BackendResult<HostRegistration<'a>> {
        if !self.enabled {
            return Err(BackendError::registration(format!(
                "external host registration is disabled (set {}=1)",
                crate::env::ENV_REGISTER_HOST
            )));
        }
        if region.is_empty() {
            return Err(BackendError::registration("cannot register an empty region"));
        }
        let addr = region.as_ptr() as usize;
        if addr % HOST_PAGE_SIZE != 0 {
            return Err(BackendError::registration(format!(
                "region at {addr:#x} is not aligned to {HOST_PAGE_SIZE} bytes"
            )));
        }
        if !self
            .registered
            .lock()
            .expect("host pin set poisoned")
            .insert(addr)
        {
            return Err(BackendError::registration(format!(
                "region at {addr:#x} is already registered"
            )));
        }
        if let Err(err) = self.driver.register_host(addr, region.len()) {
            self.forget(addr);
            tracing::debug!(addr = format_args!("{addr:#x}"), "driver rejected host registration: {err}");
            return Err(BackendError::registration(err.to_string()));
        }
        tracing::debug!(addr = format_args!("{addr:#x}"), len = region.len(), "registered host buffer");
        let pinning: Arc<dyn HostPinning> = Arc::clone(self) as Arc<dyn HostPinning>;
        Ok(HostRegistration::new(region, pinning))
    }

    fn forget(&self, addr: usize) {
        self.registered
            .lock()
            .expect("host pin set poisoned")
            .remove(&addr);
    }
}

impl HostPinning for HostPins {
    fn unpin(&self, addr: usize, _len: usize) -> BackendResult<()> {
        self.forget(addr);
        self.driver.unregister_host(addr)
    }
}
