use std::sync::Arc;

use hetero_rs::buffer::HostBufferType;
use hetero_rs::device::{check_ordinal, CPU_FAMILY};
use hetero_rs::extra::ExtraOpRegistry;
use hetero_rs::{
    BackendError, BackendFamily, BackendHandle, BackendResult, BufferType, Device, DeviceKind,
    DeviceQuery, MemoryInfo,
};

use crate::backend::CpuBackend;
use crate::evaluator::{GenericEvaluator, ReferenceEvaluator};
use crate::meminfo;

/// The always-present host CPU, exposed as a single device.
pub struct CpuFamily {
    thread_count: usize,
    extra: Arc<ExtraOpRegistry>,
    evaluator: Arc<dyn GenericEvaluator>,
    host_type: Arc<dyn BufferType>,
}

impl CpuFamily {
    pub fn new(thread_count: usize, extra: Arc<ExtraOpRegistry>) -> Self {
        Self::with_evaluator(thread_count, extra, Arc::new(ReferenceEvaluator))
    }

    pub fn with_evaluator(
        thread_count: usize,
        extra: Arc<ExtraOpRegistry>,
        evaluator: Arc<dyn GenericEvaluator>,
    ) -> Self {
        Self {
            thread_count: thread_count.max(1),
            extra,
            evaluator,
            host_type: HostBufferType::shared(),
        }
    }

    pub fn extra_ops(&self) -> &Arc<ExtraOpRegistry> {
        &self.extra
    }

    /// Backend with the family's thread count, providers and evaluator.
    pub fn backend(&self) -> CpuBackend {
        CpuBackend::new(
            self.thread_count,
            Arc::clone(&self.extra),
            Arc::clone(&self.evaluator),
        )
    }

    fn check_device(&self, device: &Device) -> BackendResult<()> {
        if !device.is_cpu() || device.family() != CPU_FAMILY || device.ordinal() != 0 {
            return Err(BackendError::device_unavailable(device, "not the host cpu"));
        }
        Ok(())
    }
}

impl DeviceQuery for CpuFamily {
    fn count(&self) -> usize {
        1
    }

    fn describe(&self, ordinal: usize) -> String {
        check_ordinal(CPU_FAMILY, ordinal, 1);
        format!("CPU ({} threads)", self.thread_count)
    }

    fn memory(&self, ordinal: usize) -> MemoryInfo {
        check_ordinal(CPU_FAMILY, ordinal, 1);
        meminfo::host_memory()
    }
}

impl BackendFamily for CpuFamily {
    fn name(&self) -> &str {
        CPU_FAMILY
    }

    fn device_kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn init_backend(&self, device: &Device) -> BackendResult<BackendHandle> {
        self.check_device(device)?;
        Ok(BackendHandle::new(Box::new(self.backend())))
    }

    fn device_buffer_type(&self, device: &Device) -> BackendResult<Arc<dyn BufferType>> {
        self.check_device(device)?;
        Ok(Arc::clone(&self.host_type))
    }

    fn host_buffer_type(&self) -> Option<Arc<dyn BufferType>> {
        None
    }
}
