use hetero_rs::buffer::bytes_to_f32;
use hetero_rs::extra::ComputeParams;
use hetero_rs::graph::{DType, OpKind, OpRef};
use hetero_rs::{BackendError, BackendResult};

/// Fallback executor for every node no extra-op provider handled.
pub trait GenericEvaluator: Send + Sync {
    /// Scratch bytes needed to run `op` with `thread_count` workers.
    fn work_size(&self, thread_count: usize, op: &OpRef<'_>) -> usize;

    fn compute_forward(&self, params: &mut ComputeParams<'_>, op: &OpRef<'_>) -> BackendResult<()>;
}

/// Straightforward f32 kernels for every operation kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceEvaluator;

impl ReferenceEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl GenericEvaluator for ReferenceEvaluator {
    fn work_size(&self, _thread_count: usize, op: &OpRef<'_>) -> usize {
        match op.kind() {
            // Transposed copy of the right-hand side; an operand too large to size could never
            // have been allocated.
            OpKind::Matmul => op.input(1).byte_len().unwrap_or(0),
            OpKind::Copy | OpKind::Add | OpKind::Mul => 0,
        }
    }

    fn compute_forward(&self, params: &mut ComputeParams<'_>, op: &OpRef<'_>) -> BackendResult<()> {
        if op.inputs().any(|desc| desc.dtype != DType::F32) || op.output().dtype != DType::F32 {
            return Err(BackendError::unsupported(
                op.signature(),
                "reference evaluator only handles f32",
            ));
        }

        let output = match op.kind() {
            OpKind::Copy => params.tensors.read_f32(op.input_id(0))?,
            OpKind::Add => elementwise(params, op, |a, b| a + b)?,
            OpKind::Mul => elementwise(params, op, |a, b| a * b)?,
            OpKind::Matmul => matmul(params, op)?,
        };
        params.tensors.write_f32(op.output_id(), &output)
    }
}

fn elementwise(
    params: &ComputeParams<'_>,
    op: &OpRef<'_>,
    f: impl Fn(f32, f32) -> f32,
) -> BackendResult<Vec<f32>> {
    let lhs = params.tensors.read_f32(op.input_id(0))?;
    let rhs = params.tensors.read_f32(op.input_id(1))?;
    if lhs.len() != rhs.len() {
        return Err(BackendError::execution(format!(
            "{} operand lengths differ ({} vs {})",
            op.kind(),
            lhs.len(),
            rhs.len()
        )));
    }
    Ok(lhs.iter().zip(&rhs).map(|(a, b)| f(*a, *b)).collect())
}

fn matmul(params: &mut ComputeParams<'_>, op: &OpRef<'_>) -> BackendResult<Vec<f32>> {
    let (m, k) = dims2(op, 0)?;
    let (k_rhs, n) = dims2(op, 1)?;
    if k != k_rhs {
        return Err(BackendError::execution("matmul lhs/rhs contract mismatch"));
    }
    let lhs = params.tensors.read_f32(op.input_id(0))?;
    let rhs = params.tensors.read_f32(op.input_id(1))?;

    let packed_len = k * n * 4;
    if params.work.len() < packed_len {
        return Err(BackendError::execution(format!(
            "matmul needs {packed_len} bytes of work memory, got {}",
            params.work.len()
        )));
    }
    let packed = &mut params.work[..packed_len];
    for row in 0..k {
        for col in 0..n {
            let at = (col * k + row) * 4;
            packed[at..at + 4].copy_from_slice(&rhs[row * n + col].to_le_bytes());
        }
    }
    let rhs_t = bytes_to_f32(packed);

    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        let a = &lhs[i * k..(i + 1) * k];
        for j in 0..n {
            let b = &rhs_t[j * k..(j + 1) * k];
            out[i * n + j] = a.iter().zip(b).map(|(x, y)| x * y).sum();
        }
    }
    Ok(out)
}

fn dims2(op: &OpRef<'_>, position: usize) -> BackendResult<(usize, usize)> {
    match op.input(position).shape.as_slice() {
        [rows, cols] => Ok((*rows, *cols)),
        other => Err(BackendError::unsupported(
            op.signature(),
            format!("matmul operand {position} has rank {}", other.len()),
        )),
    }
}
