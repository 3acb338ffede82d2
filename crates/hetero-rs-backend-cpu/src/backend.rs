use std::sync::Arc;

use hetero_rs::extra::{ComputeParams, ExtraOpRegistry};
use hetero_rs::graph::Graph;
use hetero_rs::{Backend, BackendResult, Device, GraphTensors};

use crate::evaluator::GenericEvaluator;

/// Scratch requirements of one graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPlan {
    /// Bytes requested by each node, in node order.
    pub per_node: Vec<usize>,
    /// Size of the shared work buffer: the largest per-node request.
    pub work_size: usize,
}

/// CPU backend: extra-op providers first, then the generic evaluator.
pub struct CpuBackend {
    device: Device,
    thread_count: usize,
    extra: Arc<ExtraOpRegistry>,
    evaluator: Arc<dyn GenericEvaluator>,
}

impl CpuBackend {
    pub fn new(
        thread_count: usize,
        extra: Arc<ExtraOpRegistry>,
        evaluator: Arc<dyn GenericEvaluator>,
    ) -> Self {
        Self {
            device: Device::cpu(),
            thread_count: thread_count.max(1),
            extra,
            evaluator,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn extra_ops(&self) -> &Arc<ExtraOpRegistry> {
        &self.extra
    }

    /// Sizes the work buffer. A provider that cannot size its op defers to the evaluator's
    /// estimate for that node.
    pub fn plan_work(&self, graph: &Graph) -> BackendResult<WorkPlan> {
        let per_node = graph
            .ops()
            .map(|op| -> BackendResult<usize> {
                let extra = self.extra.work_size(&self.device, self.thread_count, &op)?;
                Ok(extra.unwrap_or_else(|| self.evaluator.work_size(self.thread_count, &op)))
            })
            .collect::<BackendResult<Vec<_>>>()?;
        let work_size = per_node.iter().copied().max().unwrap_or(0);
        Ok(WorkPlan {
            per_node,
            work_size,
        })
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "CPU"
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn submit(&mut self, graph: &Graph, tensors: &mut GraphTensors) -> BackendResult<()> {
        let plan = self.plan_work(graph)?;
        let mut work = vec![0u8; plan.work_size];
        tracing::trace!(nodes = graph.len(), work_size = plan.work_size, "cpu graph compute");

        for op in graph.ops() {
            let mut params = ComputeParams {
                thread_index: 0,
                thread_count: self.thread_count,
                work: &mut work,
                tensors: &mut *tensors,
            };
            if let Some(result) = self.extra.compute_forward(&self.device, &mut params, &op) {
                result?;
                continue;
            }

            // A provider that declined may have planned less scratch than the evaluator needs.
            let needed = self.evaluator.work_size(self.thread_count, &op);
            if work.len() < needed {
                tracing::debug!(node = op.index(), needed, "growing work buffer for declined node");
                work.resize(needed, 0);
            }
            let mut params = ComputeParams {
                thread_index: 0,
                thread_count: self.thread_count,
                work: &mut work,
                tensors: &mut *tensors,
            };
            self.evaluator.compute_forward(&mut params, &op)?;
        }
        Ok(())
    }
}
