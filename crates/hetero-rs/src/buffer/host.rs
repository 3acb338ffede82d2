use std::collections::TryReserveError;
use std::sync::{Arc, OnceLock};

use crate::device::Device;
use crate::error::{BackendError, BackendResult};

use super::{check_range, BufferKind, BufferMemory, BufferType};

/// Default alignment for host tensor data.
pub const TENSOR_ALIGNMENT: usize = 32;

static SHARED_HOST_TYPE: OnceLock<Arc<HostBufferType>> = OnceLock::new();

/// Plain, driver-agnostic host memory.
#[derive(Debug, Clone)]
pub struct HostBufferType {
    name: String,
    alignment: usize,
}

impl HostBufferType {
    pub fn new() -> Self {
        Self::with_alignment("CPU", TENSOR_ALIGNMENT)
    }

    pub fn with_alignment(name: impl Into<String>, alignment: usize) -> Self {
        assert!(
            alignment.is_power_of_two(),
            "host buffer alignment must be a power of two, got {alignment}"
        );
        Self {
            name: name.into(),
            alignment,
        }
    }

    /// Process-wide instance used when a family has no host buffer type of its own.
    pub fn shared() -> Arc<HostBufferType> {
        Arc::clone(SHARED_HOST_TYPE.get_or_init(|| Arc::new(HostBufferType::new())))
    }
}

impl Default for HostBufferType {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferType for HostBufferType {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BufferKind {
        BufferKind::Host
    }

    fn alignment(&self) -> usize {
        self.alignment
    }

    fn supports_device(&self, device: &Device) -> bool {
        device.is_cpu()
    }

    fn alloc_memory(&self, size: usize) -> BackendResult<Box<dyn BufferMemory>> {
        let memory = HostMemory::allocate(size, self.alignment)
            .map_err(|err| BackendError::allocation(&self.name, size, err.to_string()))?;
        Ok(Box::new(memory))
    }
}

/// Zero-initialised host allocation whose first byte is aligned to the requested boundary.
///
/// Allocation failure is reported instead of aborting the process.
pub struct HostMemory {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
}

impl HostMemory {
    pub fn allocate(len: usize, alignment: usize) -> Result<Self, TryReserveError> {
        let padded = len.saturating_add(alignment);
        let mut storage = Vec::new();
        storage.try_reserve_exact(padded)?;
        storage.resize(padded, 0);
        let offset = storage.as_ptr().align_offset(alignment).min(alignment);
        Ok(Self {
            storage,
            offset,
            len,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }
}

impl BufferMemory for HostMemory {
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
