use std::ptr::NonNull;

use crate::device::MemoryInfo;
use crate::error::BackendResult;

/// Upper bound on the devices one accelerator family exposes.
pub const MAX_DEVICES: usize = 16;

/// Alignment of host regions accepted for external registration.
pub const HOST_PAGE_SIZE: usize = 4096;

/// Opaque device address as handed out by the driver.
pub type DevicePtr = u64;

/// Low-level operations an accelerator family needs from its vendor driver.
///
/// Implementations own driver state (contexts, streams) and make every call safe to issue from
/// any thread. Ordinals are always below [`AcceleratorDriver::device_count`].
pub trait AcceleratorDriver: Send + Sync {
    /// Family tag used for devices driven by this driver (e.g. "cuda").
    fn name(&self) -> &str;

    fn device_count(&self) -> BackendResult<usize>;

    fn device_name(&self, ordinal: usize) -> BackendResult<String>;

    fn memory_info(&self, ordinal: usize) -> BackendResult<MemoryInfo>;

    /// Brings up the execution context of `ordinal`. Called by backend initialisation only;
    /// repeated calls must be cheap.
    fn init_device(&self, ordinal: usize) -> BackendResult<()>;

    /// Alignment guaranteed for device allocations.
    fn device_alignment(&self) -> usize {
        128
    }

    fn alloc_device(&self, ordinal: usize, size: usize) -> BackendResult<DevicePtr>;

    fn free_device(&self, ordinal: usize, ptr: DevicePtr) -> BackendResult<()>;

    fn copy_to_device(&self, ordinal: usize, dst: DevicePtr, src: &[u8]) -> BackendResult<()>;

    fn copy_from_device(&self, ordinal: usize, dst: &mut [u8], src: DevicePtr)
        -> BackendResult<()>;

    fn memset(&self, ordinal: usize, dst: DevicePtr, value: u8, len: usize) -> BackendResult<()>;

    /// Allocates page-locked host memory of `size` bytes.
    fn alloc_pinned(&self, size: usize) -> BackendResult<NonNull<u8>>;

    /// Frees memory returned by [`AcceleratorDriver::alloc_pinned`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc_pinned` on this driver with the same `size`, and must not be
    /// used afterwards.
    unsafe fn free_pinned(&self, ptr: NonNull<u8>, size: usize) -> BackendResult<()>;

    /// Page-locks an existing host region.
    fn register_host(&self, addr: usize, len: usize) -> BackendResult<()>;

    fn unregister_host(&self, addr: usize) -> BackendResult<()>;

    fn synchronize(&self, ordinal: usize) -> BackendResult<()>;
}
