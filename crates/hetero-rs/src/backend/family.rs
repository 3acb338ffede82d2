use std::sync::Arc;

use crate::buffer::{BufferType, HostRegistration};
use crate::device::{check_ordinal, Device, DeviceKind, DeviceQuery};
use crate::error::{BackendError, BackendResult};

use super::handle::BackendHandle;

/// One kind of backend (CPU, CUDA, ...) together with the devices it enumerates.
///
/// Families are registered once with the [`BackendRegistry`](super::BackendRegistry) and looked
/// up by [`BackendFamily::name`]. Buffer-type lookups must be cheap and idempotent: families
/// memoize them and never re-initialise their driver to answer.
pub trait BackendFamily: DeviceQuery + Send + Sync {
    /// Family tag, unique per process.
    fn name(&self) -> &str;

    fn device_kind(&self) -> DeviceKind;

    fn device(&self, ordinal: usize) -> Device {
        check_ordinal(self.name(), ordinal, self.count());
        Device::new(self.name(), ordinal, self.device_kind())
    }

    fn devices(&self) -> Vec<Device> {
        (0..self.count()).map(|ordinal| self.device(ordinal)).collect()
    }

    /// Creates a ready backend on `device`; fails with `DeviceUnavailable` if the driver cannot
    /// bring the device up.
    fn init_backend(&self, device: &Device) -> BackendResult<BackendHandle>;

    fn device_buffer_type(&self, device: &Device) -> BackendResult<Arc<dyn BufferType>>;

    /// Host memory type with the fastest transfer path to this family's devices, if any.
    fn host_buffer_type(&self) -> Option<Arc<dyn BufferType>> {
        None
    }

    /// Buffer type splitting matrix rows across this family's devices by `ratios` (one weight per
    /// device, normalised before use).
    fn split_buffer_type(
        &self,
        main_device: &Device,
        ratios: &[f32],
    ) -> BackendResult<Arc<dyn BufferType>> {
        let _ = ratios;
        Err(BackendError::unsupported(
            "split buffer type",
            format!("family {} cannot split tensors (main device {main_device})", self.name()),
        ))
    }

    /// Registers caller-owned host memory for fast transfers. The registration lasts as long as
    /// the returned guard.
    fn register_host_buffer<'a>(&self, region: &'a mut [u8]) -> BackendResult<HostRegistration<'a>> {
        let _ = region;
        Err(BackendError::registration(format!(
            "family {} does not support host buffer registration",
            self.name()
        )))
    }
}
