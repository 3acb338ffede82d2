//! Buffer types: factories describing where tensor memory lives and how it is allocated.
//!
//! A [`BufferType`] is shared read-only by every [`Buffer`] it produces. Buffers own their memory
//! exclusively and release it on drop, so device frees and pinned-memory unregistration happen on
//! every exit path.

pub mod host;
pub mod pinned;
pub mod split;
mod tensors;

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use serde::Serialize;

use crate::device::Device;
use crate::error::{BackendError, BackendResult};
use crate::graph::TensorDesc;

pub use host::{HostBufferType, HostMemory, TENSOR_ALIGNMENT};
pub use pinned::{HostPinning, HostRegistration};
pub use split::{SplitBufferType, TensorSplit};
pub use tensors::GraphTensors;

/// Allocation strategy tag of a buffer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BufferKind {
    Host,
    PinnedHost,
    Device,
    Split,
}

/// Raw memory behind a buffer. Offsets are in bytes and bounds-checked by implementations.
pub trait BufferMemory: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> BackendResult<()>;

    fn write(&mut self, offset: usize, data: &[u8]) -> BackendResult<()>;

    fn fill(&mut self, value: u8) -> BackendResult<()>;

    /// Direct view of host-addressable memory; `None` for device memory.
    fn host_bytes(&self) -> Option<&[u8]> {
        None
    }

    fn host_bytes_mut(&mut self) -> Option<&mut [u8]> {
        None
    }
}

/// A class of allocatable memory (plain host, pinned host, single device, split across devices).
pub trait BufferType: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> BufferKind;

    /// Required alignment of every allocation, in bytes.
    fn alignment(&self) -> usize;

    fn max_size(&self) -> usize {
        usize::MAX
    }

    fn is_host(&self) -> bool {
        matches!(self.kind(), BufferKind::Host | BufferKind::PinnedHost)
    }

    /// Whether a backend running on `device` can operate on memory of this type.
    fn supports_device(&self, device: &Device) -> bool;

    /// Bytes needed to hold `tensor`; types with padding or repacking override this.
    fn alloc_size(&self, tensor: &TensorDesc) -> BackendResult<usize> {
        tensor
            .byte_len()
            .ok_or_else(|| size_overflow(self.name(), tensor))
    }

    fn alloc_memory(&self, size: usize) -> BackendResult<Box<dyn BufferMemory>>;

    /// Allocates storage laid out for `tensor`. Split types override this to partition rows.
    fn alloc_tensor_storage(&self, tensor: &TensorDesc) -> BackendResult<BufferStorage> {
        self.alloc_memory(self.alloc_size(tensor)?)
            .map(BufferStorage::Contiguous)
    }
}

/// Allocation entry points for shared buffer-type handles.
pub trait BufferTypeExt {
    fn allocate(&self, size: usize) -> BackendResult<Buffer>;

    fn allocate_tensor(&self, tensor: &TensorDesc) -> BackendResult<Buffer>;
}

impl BufferTypeExt for Arc<dyn BufferType> {
    fn allocate(&self, size: usize) -> BackendResult<Buffer> {
        check_max_size(self.as_ref(), size)?;
        let memory = self.alloc_memory(size)?;
        Ok(Buffer {
            buffer_type: Arc::clone(self),
            storage: BufferStorage::Contiguous(memory),
        })
    }

    fn allocate_tensor(&self, tensor: &TensorDesc) -> BackendResult<Buffer> {
        check_max_size(self.as_ref(), self.alloc_size(tensor)?)?;
        let storage = self.alloc_tensor_storage(tensor)?;
        Ok(Buffer {
            buffer_type: Arc::clone(self),
            storage,
        })
    }
}

/// Allocation failure for a tensor whose byte size does not fit in `usize`.
pub(crate) fn size_overflow(buffer_type: &str, tensor: &TensorDesc) -> BackendError {
    BackendError::allocation(
        buffer_type,
        usize::MAX,
        format!(
            "{} {:?} {:?} is larger than the address space",
            tensor.name, tensor.dtype, tensor.shape
        ),
    )
}

fn check_max_size(buffer_type: &dyn BufferType, size: usize) -> BackendResult<()> {
    if size > buffer_type.max_size() {
        return Err(BackendError::allocation(
            buffer_type.name(),
            size,
            format!("exceeds maximum allocation of {} bytes", buffer_type.max_size()),
        ));
    }
    Ok(())
}

pub enum BufferStorage {
    Contiguous(Box<dyn BufferMemory>),
    /// Row slices placed on different devices, ordered by device ordinal.
    Split(Vec<SplitSlice>),
}

pub struct SplitSlice {
    pub device: Device,
    pub rows: Range<usize>,
    pub memory: Box<dyn BufferMemory>,
}

/// Memory region tagged with the buffer type that produced it.
pub struct Buffer {
    buffer_type: Arc<dyn BufferType>,
    storage: BufferStorage,
}

impl Buffer {
    pub fn buffer_type(&self) -> &Arc<dyn BufferType> {
        &self.buffer_type
    }

    pub fn kind(&self) -> BufferKind {
        self.buffer_type.kind()
    }

    pub fn is_host(&self) -> bool {
        self.buffer_type.is_host()
    }

    pub fn size(&self) -> usize {
        match &self.storage {
            BufferStorage::Contiguous(memory) => memory.len(),
            BufferStorage::Split(slices) => slices.iter().map(|slice| slice.memory.len()).sum(),
        }
    }

    pub fn storage(&self) -> &BufferStorage {
        &self.storage
    }

    pub fn split_slices(&self) -> Option<&[SplitSlice]> {
        match &self.storage {
            BufferStorage::Split(slices) => Some(slices),
            BufferStorage::Contiguous(_) => None,
        }
    }

    pub fn split_slices_mut(&mut self) -> Option<&mut [SplitSlice]> {
        match &mut self.storage {
            BufferStorage::Split(slices) => Some(slices),
            BufferStorage::Contiguous(_) => None,
        }
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> BackendResult<()> {
        self.contiguous()?.read(offset, out)
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> BackendResult<()> {
        self.contiguous_mut()?.write(offset, data)
    }

    pub fn fill(&mut self, value: u8) -> BackendResult<()> {
        match &mut self.storage {
            BufferStorage::Contiguous(memory) => memory.fill(value),
            BufferStorage::Split(slices) => slices
                .iter_mut()
                .try_for_each(|slice| slice.memory.fill(value)),
        }
    }

    pub fn host_bytes(&self) -> Option<&[u8]> {
        match &self.storage {
            BufferStorage::Contiguous(memory) => memory.host_bytes(),
            BufferStorage::Split(_) => None,
        }
    }

    pub fn host_bytes_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.storage {
            BufferStorage::Contiguous(memory) => memory.host_bytes_mut(),
            BufferStorage::Split(_) => None,
        }
    }

    pub fn read_f32(&self) -> BackendResult<Vec<f32>> {
        let mut bytes = vec![0u8; self.contiguous()?.len()];
        self.read(0, &mut bytes)?;
        Ok(bytes_to_f32(&bytes))
    }

    pub fn write_f32(&mut self, values: &[f32]) -> BackendResult<()> {
        let bytes = f32_to_bytes(values);
        if bytes.len() != self.size() {
            return Err(BackendError::execution(format!(
                "f32 write of {} bytes does not match buffer size {}",
                bytes.len(),
                self.size()
            )));
        }
        self.write(0, &bytes)
    }

    fn contiguous(&self) -> BackendResult<&dyn BufferMemory> {
        match &self.storage {
            BufferStorage::Contiguous(memory) => Ok(memory.as_ref()),
            BufferStorage::Split(_) => Err(split_access_error()),
        }
    }

    fn contiguous_mut(&mut self) -> BackendResult<&mut (dyn BufferMemory + 'static)> {
        match &mut self.storage {
            BufferStorage::Contiguous(memory) => Ok(memory.as_mut()),
            BufferStorage::Split(_) => Err(split_access_error()),
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("buffer_type", &self.buffer_type.name())
            .field("kind", &self.kind())
            .field("size", &self.size())
            .finish()
    }
}

fn split_access_error() -> BackendError {
    BackendError::execution(
        "split buffers are not gathered; read and write through the per-device slices",
    )
}

/// Fails unless `offset..offset + count` lies within a region of `len` bytes.
pub fn check_range(len: usize, offset: usize, count: usize) -> BackendResult<()> {
    match offset.checked_add(count) {
        Some(end) if end <= len => Ok(()),
        _ => Err(BackendError::execution(format!(
            "access of {count} bytes at offset {offset} exceeds buffer of {len} bytes"
        ))),
    }
}

pub fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub fn f32_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}
