use std::sync::Arc;

use crate::error::{BackendError, BackendResult};
use crate::graph::{Graph, TensorDesc, TensorId};

use super::{Buffer, BufferType, BufferTypeExt};

/// One buffer per graph tensor, indexed by [`TensorId`].
#[derive(Debug)]
pub struct GraphTensors {
    buffers: Vec<Buffer>,
}

impl GraphTensors {
    /// Allocates every tensor of `graph` from a single buffer type.
    pub fn allocate(graph: &Graph, buffer_type: &Arc<dyn BufferType>) -> BackendResult<Self> {
        Self::allocate_with(graph, |_, _| Arc::clone(buffer_type))
    }

    /// Allocates each tensor from the buffer type chosen by `place`, e.g. weights in a split
    /// buffer and activations on the main device.
    pub fn allocate_with<F>(graph: &Graph, mut place: F) -> BackendResult<Self>
    where
        F: FnMut(TensorId, &TensorDesc) -> Arc<dyn BufferType>,
    {
        let buffers = graph
            .tensors()
            .iter()
            .enumerate()
            .map(|(index, desc)| place(TensorId(index as u32), desc).allocate_tensor(desc))
            .collect::<BackendResult<Vec<_>>>()?;
        Ok(Self { buffers })
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffer(&self, id: TensorId) -> BackendResult<&Buffer> {
        self.buffers
            .get(id.index())
            .ok_or_else(|| missing_tensor(id))
    }

    pub fn buffer_mut(&mut self, id: TensorId) -> BackendResult<&mut Buffer> {
        self.buffers
            .get_mut(id.index())
            .ok_or_else(|| missing_tensor(id))
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn read_f32(&self, id: TensorId) -> BackendResult<Vec<f32>> {
        self.buffer(id)?.read_f32()
    }

    pub fn write_f32(&mut self, id: TensorId, values: &[f32]) -> BackendResult<()> {
        self.buffer_mut(id)?.write_f32(values)
    }
}

fn missing_tensor(id: TensorId) -> BackendError {
    BackendError::execution(format!("tensor {} has no buffer", id.0))
}
