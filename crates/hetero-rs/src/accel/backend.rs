use std::sync::Arc;

use crate::backend::Backend;
use crate::buffer::GraphTensors;
use crate::device::Device;
use crate::error::{BackendError, BackendResult};
use crate::graph::{Graph, OpRef};

use super::driver::AcceleratorDriver;

/// State a kernel launch can touch.
pub struct KernelContext<'a> {
    pub device: &'a Device,
    pub driver: &'a dyn AcceleratorDriver,
    pub tensors: &'a mut GraphTensors,
}

/// Native kernels of an accelerator family.
pub trait KernelSet: Send + Sync {
    fn supports(&self, op: &OpRef<'_>) -> bool;

    /// Enqueues `op` on the device stream; completion is awaited by the backend's synchronize.
    fn launch(&self, ctx: &mut KernelContext<'_>, op: &OpRef<'_>) -> BackendResult<()>;
}

/// Kernel set with no kernels; every submission is reported as unsupported.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyKernelSet;

impl KernelSet for EmptyKernelSet {
    fn supports(&self, _op: &OpRef<'_>) -> bool {
        false
    }

    fn launch(&self, _ctx: &mut KernelContext<'_>, op: &OpRef<'_>) -> BackendResult<()> {
        Err(BackendError::unsupported(op.signature(), "no kernels installed"))
    }
}

/// Backend running graphs on one accelerator device through a [`KernelSet`].
pub struct AcceleratorBackend {
    name: String,
    device: Device,
    driver: Arc<dyn AcceleratorDriver>,
    kernels: Arc<dyn KernelSet>,
}

impl AcceleratorBackend {
    pub fn new(
        device: Device,
        driver: Arc<dyn AcceleratorDriver>,
        kernels: Arc<dyn KernelSet>,
    ) -> Self {
        Self {
            name: format!("{}{}", device.family().to_ascii_uppercase(), device.ordinal()),
            device,
            driver,
            kernels,
        }
    }
}

impl Backend for AcceleratorBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn submit(&mut self, graph: &Graph, tensors: &mut GraphTensors) -> BackendResult<()> {
        // Reject the whole graph up front rather than leaving it half executed.
        if let Some(op) = graph.ops().find(|op| !self.kernels.supports(op)) {
            return Err(BackendError::unsupported(
                op.signature(),
                format!("no {} kernel", self.device.family()),
            ));
        }
        let mut ctx = KernelContext {
            device: &self.device,
            driver: self.driver.as_ref(),
            tensors,
        };
        for op in graph.ops() {
            self.kernels.launch(&mut ctx, &op)?;
        }
        self.driver.synchronize(self.device.ordinal())
    }

    fn synchronize(&mut self) -> BackendResult<()> {
        self.driver.synchronize(self.device.ordinal())
    }

    fn release(&mut self) -> BackendResult<()> {
        self.driver.synchronize(self.device.ordinal())
    }
}
