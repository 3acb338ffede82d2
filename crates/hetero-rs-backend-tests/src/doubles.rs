use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use hetero_rs::extra::{ComputeParams, ExtraBufferType, TensorTraits};
use hetero_rs::graph::{DType, OpKind, OpRef, OpSignature};
use hetero_rs::{BackendResult, Device};
use hetero_rs_backend_cpu::{GenericEvaluator, ReferenceEvaluator};

/// Which operations a [`RecordingProvider`] claims.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// Any node of this kind.
    Kind(OpKind),
    /// Nodes of this kind whose f32 operands have exactly these shapes.
    Shapes(OpKind, Vec<Vec<usize>>),
    Nothing,
}

impl Claim {
    fn matches(&self, op: &OpRef<'_>) -> bool {
        match self {
            Claim::Kind(kind) => op.kind() == *kind,
            Claim::Shapes(kind, shapes) => {
                op.kind() == *kind
                    && op.inputs().count() == shapes.len()
                    && op
                        .inputs()
                        .zip(shapes)
                        .all(|(desc, shape)| desc.dtype == DType::F32 && desc.shape == *shape)
            }
            Claim::Nothing => false,
        }
    }
}

/// Calls observed by one [`RecordingProvider`].
#[derive(Debug, Default)]
pub struct ProviderLog {
    pub supports_op: AtomicUsize,
    pub get_tensor_traits: AtomicUsize,
    pub work_size: AtomicUsize,
    pub compute_forward: AtomicUsize,
    pub computed: Mutex<Vec<OpSignature>>,
}

impl ProviderLog {
    pub fn compute_calls(&self) -> usize {
        self.compute_forward.load(Ordering::SeqCst)
    }

    pub fn work_size_calls(&self) -> usize {
        self.work_size.load(Ordering::SeqCst)
    }

    pub fn computed(&self) -> Vec<OpSignature> {
        self.computed.lock().expect("provider log poisoned").clone()
    }
}

/// Extra buffer type that records every call and computes claimed nodes with the reference
/// evaluator (or not at all, if configured to decline).
pub struct RecordingProvider {
    name: String,
    claim: Claim,
    work_size: Option<usize>,
    decline: bool,
    withhold_traits: bool,
    log: Arc<ProviderLog>,
}

impl RecordingProvider {
    pub fn new(name: impl Into<String>, claim: Claim) -> Self {
        Self {
            name: name.into(),
            claim,
            work_size: Some(0),
            decline: false,
            withhold_traits: false,
            log: Arc::new(ProviderLog::default()),
        }
    }

    /// Reports this work size; `None` means the provider cannot size its op.
    pub fn with_work_size(mut self, work_size: Option<usize>) -> Self {
        self.work_size = work_size;
        self
    }

    /// Claims ops but returns `None` from `compute_forward`.
    pub fn declining(mut self) -> Self {
        self.decline = true;
        self
    }

    /// Claims ops but produces no traits for them.
    pub fn withholding_traits(mut self) -> Self {
        self.withhold_traits = true;
        self
    }

    pub fn log(&self) -> Arc<ProviderLog> {
        Arc::clone(&self.log)
    }
}

impl ExtraBufferType for RecordingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_op(&self, _device: &Device, op: &OpRef<'_>) -> bool {
        self.log.supports_op.fetch_add(1, Ordering::SeqCst);
        self.claim.matches(op)
    }

    fn get_tensor_traits(&self, op: &OpRef<'_>) -> Option<Arc<dyn TensorTraits>> {
        self.log.get_tensor_traits.fetch_add(1, Ordering::SeqCst);
        if self.withhold_traits || !self.claim.matches(op) {
            return None;
        }
        Some(Arc::new(RecordingTraits {
            work_size: self.work_size,
            decline: self.decline,
            log: Arc::clone(&self.log),
        }))
    }
}

struct RecordingTraits {
    work_size: Option<usize>,
    decline: bool,
    log: Arc<ProviderLog>,
}

impl TensorTraits for RecordingTraits {
    fn work_size(&self, _thread_count: usize, _op: &OpRef<'_>) -> Option<usize> {
        self.log.work_size.fetch_add(1, Ordering::SeqCst);
        self.work_size
    }

    fn compute_forward(
        &self,
        params: &mut ComputeParams<'_>,
        op: &OpRef<'_>,
    ) -> Option<BackendResult<()>> {
        self.log.compute_forward.fetch_add(1, Ordering::SeqCst);
        if self.decline {
            return None;
        }
        self.log
            .computed
            .lock()
            .expect("provider log poisoned")
            .push(op.signature());
        // Scratch for the reference matmul when the provider asked for none.
        let needed = ReferenceEvaluator.work_size(params.thread_count, op);
        let mut scratch = vec![0u8; needed];
        let mut inner = ComputeParams {
            thread_index: params.thread_index,
            thread_count: params.thread_count,
            work: &mut scratch,
            tensors: &mut *params.tensors,
        };
        Some(ReferenceEvaluator.compute_forward(&mut inner, op))
    }
}

/// Generic evaluator wrapper that counts the nodes it sizes and runs.
#[derive(Default)]
pub struct CountingEvaluator {
    inner: ReferenceEvaluator,
    work_size_calls: AtomicUsize,
    compute_calls: AtomicUsize,
    computed: Mutex<Vec<OpKind>>,
}

impl CountingEvaluator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn work_size_calls(&self) -> usize {
        self.work_size_calls.load(Ordering::SeqCst)
    }

    pub fn compute_calls(&self) -> usize {
        self.compute_calls.load(Ordering::SeqCst)
    }

    pub fn computed(&self) -> Vec<OpKind> {
        self.computed.lock().expect("evaluator log poisoned").clone()
    }
}

impl GenericEvaluator for CountingEvaluator {
    fn work_size(&self, thread_count: usize, op: &OpRef<'_>) -> usize {
        self.work_size_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.work_size(thread_count, op)
    }

    fn compute_forward(&self, params: &mut ComputeParams<'_>, op: &OpRef<'_>) -> BackendResult<()> {
        self.compute_calls.fetch_add(1, Ordering::SeqCst);
        self.computed
            .lock()
            .expect("evaluator log poisoned")
            .push(op.kind());
        self.inner.compute_forward(params, op)
    }
}
