use std::sync::Arc;

use faer::linalg::matmul::matmul;
use faer::mat::{MatMut, MatRef};
use faer::{Accum, Par};
use hetero_rs::extra::{ComputeParams, ExtraBufferType, TensorTraits};
use hetero_rs::graph::{DType, OpKind, OpRef};
use hetero_rs::{BackendError, BackendResult, Device};

fn faer_parallelism() -> Par {
    let par = faer::get_global_parallelism();
    if par.degree() == 1 {
        Par::Seq
    } else {
        par
    }
}

/// Extra buffer type routing rank-2 f32 MATMUL through faer's blocked kernels.
#[derive(Debug, Default, Clone)]
pub struct FaerExtraBufferType {
    traits: Arc<FaerMatmulTraits>,
}

impl FaerExtraBufferType {
    pub const NAME: &'static str = "CPU_FAER";

    pub fn new() -> Self {
        Self::default()
    }
}

impl ExtraBufferType for FaerExtraBufferType {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn supports_op(&self, device: &Device, op: &OpRef<'_>) -> bool {
        device.is_cpu() && is_f32_matmul_2d(op)
    }

    fn get_tensor_traits(&self, op: &OpRef<'_>) -> Option<Arc<dyn TensorTraits>> {
        if !is_f32_matmul_2d(op) {
            return None;
        }
        Some(self.traits.clone())
    }
}

fn is_f32_matmul_2d(op: &OpRef<'_>) -> bool {
    op.kind() == OpKind::Matmul
        && op
            .inputs()
            .chain([op.output()])
            .all(|desc| desc.dtype == DType::F32 && desc.rank() == 2)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FaerMatmulTraits;

impl TensorTraits for FaerMatmulTraits {
    fn work_size(&self, _thread_count: usize, _op: &OpRef<'_>) -> Option<usize> {
        // faer manages its own scratch.
        Some(0)
    }

    fn compute_forward(
        &self,
        params: &mut ComputeParams<'_>,
        op: &OpRef<'_>,
    ) -> Option<BackendResult<()>> {
        if !is_f32_matmul_2d(op) {
            return None;
        }
        Some(matmul_2d(params, op))
    }
}

fn matmul_2d(params: &mut ComputeParams<'_>, op: &OpRef<'_>) -> BackendResult<()> {
    let (m, k_lhs) = (op.input(0).shape[0], op.input(0).shape[1]);
    let (k_rhs, n) = (op.input(1).shape[0], op.input(1).shape[1]);
    if k_lhs != k_rhs {
        return Err(BackendError::execution("matmul lhs/rhs contract mismatch"));
    }
    if op.output().shape != [m, n] {
        return Err(BackendError::execution("matmul output shape mismatch"));
    }

    let lhs = params.tensors.read_f32(op.input_id(0))?;
    let rhs = params.tensors.read_f32(op.input_id(1))?;
    if lhs.len() != m * k_lhs || rhs.len() != k_rhs * n {
        return Err(BackendError::execution("matmul operand size mismatch"));
    }

    let mut row_major = vec![0.0f32; m * n];
    if m != 0 && n != 0 && k_lhs != 0 {
        let lhs_view = MatRef::from_row_major_slice(&lhs, m, k_lhs);
        let rhs_view = MatRef::from_row_major_slice(&rhs, k_rhs, n);

        // Compute C^T = B^T * A^T into a column-major (n x m) view, which is row-major C.
        let a_t = lhs_view.transpose();
        let b_t = rhs_view.transpose();
        let mut out_view = MatMut::from_column_major_slice_mut(row_major.as_mut_slice(), n, m);
        matmul(&mut out_view, Accum::Replace, b_t, a_t, 1.0f32, faer_parallelism());
    }

    params.tensors.write_f32(op.output_id(), &row_major)
}
