//! Minimal operation-graph description consumed by backends.
//!
//! Graph construction and optimisation live outside this crate; backends only need to walk nodes
//! in submission order and inspect each node's kind and operand descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, BackendResult};

/// Element types understood by the dispatch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F16,
    I32,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::I32 => "i32",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpKind {
    Copy,
    Add,
    Mul,
    Matmul,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Copy => "COPY",
            OpKind::Add => "ADD",
            OpKind::Mul => "MUL",
            OpKind::Matmul => "MATMUL",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            OpKind::Copy => 1,
            OpKind::Add | OpKind::Mul | OpKind::Matmul => 2,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(pub u32);

impl TensorId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Row-major tensor descriptor. The last dimension is the row length; all leading dimensions
/// together form the row count.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDesc {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl TensorDesc {
    pub fn new(name: impl Into<String>, dtype: DType, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape: shape.into(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// `None` if the element count does not fit in `usize`.
    pub fn element_count(&self) -> Option<usize> {
        checked_product(&self.shape)
    }

    pub fn byte_len(&self) -> Option<usize> {
        self.element_count()?.checked_mul(self.dtype.size_in_bytes())
    }

    pub fn rows(&self) -> Option<usize> {
        match self.shape.split_last() {
            Some((_, leading)) => checked_product(leading),
            None => Some(1),
        }
    }

    pub fn row_bytes(&self) -> Option<usize> {
        self.shape
            .last()
            .copied()
            .unwrap_or(1)
            .checked_mul(self.dtype.size_in_bytes())
    }
}

fn checked_product(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpNode {
    pub kind: OpKind,
    pub inputs: Vec<TensorId>,
    pub output: TensorId,
}

/// Kind plus operand types and shapes: what extra-op providers match on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpSignature {
    pub kind: OpKind,
    pub inputs: Vec<(DType, Vec<usize>)>,
    pub output: (DType, Vec<usize>),
}

impl fmt::Display for OpSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn operand(f: &mut fmt::Formatter<'_>, (dtype, shape): &(DType, Vec<usize>)) -> fmt::Result {
            let dims = shape
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join("x");
            write!(f, "{}[{}]", dtype.as_str(), dims)
        }

        write!(f, "{}(", self.kind)?;
        for (index, input) in self.inputs.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            operand(f, input)?;
        }
        f.write_str(") -> ")?;
        operand(f, &self.output)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "GraphParts")]
pub struct Graph {
    tensors: Vec<TensorDesc>,
    nodes: Vec<OpNode>,
}

/// Unchecked wire form of [`Graph`]; deserialized graphs go through [`Graph::validate`].
#[derive(Deserialize)]
struct GraphParts {
    tensors: Vec<TensorDesc>,
    nodes: Vec<OpNode>,
}

impl TryFrom<GraphParts> for Graph {
    type Error = BackendError;

    fn try_from(parts: GraphParts) -> BackendResult<Self> {
        let graph = Graph {
            tensors: parts.tensors,
            nodes: parts.nodes,
        };
        graph.validate()?;
        Ok(graph)
    }
}

impl Graph {
    /// Re-checks every node the way [`GraphBuilder`] does when emitting it: operands and output
    /// must be defined, and the output descriptor must match what the op produces.
    pub fn validate(&self) -> BackendResult<()> {
        for (index, node) in self.nodes.iter().enumerate() {
            let (dtype, shape) = check_operands(&self.tensors, node.kind, &node.inputs)?;
            let output = self.tensors.get(node.output.index()).ok_or_else(|| {
                BackendError::execution(format!(
                    "node #{index} ({}) writes undefined tensor {}",
                    node.kind, node.output.0
                ))
            })?;
            if output.dtype != dtype || output.shape != shape {
                return Err(BackendError::execution(format!(
                    "node #{index} ({}) output {:?} {:?} does not match the inferred {:?} {:?}",
                    node.kind, output.dtype, output.shape, dtype, shape
                )));
            }
        }
        Ok(())
    }

    pub fn tensors(&self) -> &[TensorDesc] {
        &self.tensors
    }

    pub fn tensor(&self, id: TensorId) -> &TensorDesc {
        &self.tensors[id.index()]
    }

    pub fn nodes(&self) -> &[OpNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Borrowed view of node `index` together with its operand descriptors.
    pub fn op(&self, index: usize) -> OpRef<'_> {
        OpRef {
            graph: self,
            node: &self.nodes[index],
            index,
        }
    }

    pub fn ops(&self) -> impl Iterator<Item = OpRef<'_>> {
        (0..self.nodes.len()).map(move |index| self.op(index))
    }
}

#[derive(Clone, Copy)]
pub struct OpRef<'g> {
    graph: &'g Graph,
    node: &'g OpNode,
    index: usize,
}

impl<'g> OpRef<'g> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> OpKind {
        self.node.kind
    }

    pub fn node(&self) -> &'g OpNode {
        self.node
    }

    pub fn input(&self, position: usize) -> &'g TensorDesc {
        self.graph.tensor(self.node.inputs[position])
    }

    pub fn input_id(&self, position: usize) -> TensorId {
        self.node.inputs[position]
    }

    pub fn inputs(&self) -> impl Iterator<Item = &'g TensorDesc> + 'g {
        let (graph, node) = (self.graph, self.node);
        node.inputs.iter().map(move |id| graph.tensor(*id))
    }

    pub fn output(&self) -> &'g TensorDesc {
        self.graph.tensor(self.node.output)
    }

    pub fn output_id(&self) -> TensorId {
        self.node.output
    }

    pub fn signature(&self) -> OpSignature {
        let operand = |desc: &TensorDesc| (desc.dtype, desc.shape.clone());
        OpSignature {
            kind: self.node.kind,
            inputs: self.inputs().map(operand).collect(),
            output: operand(self.output()),
        }
    }
}

impl fmt::Debug for OpRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.index, self.signature())
    }
}

/// Lightweight builder for constructing graphs programmatically.
///
/// Output descriptors are inferred and operands validated as nodes are emitted.
#[derive(Default)]
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(&mut self, desc: TensorDesc) -> TensorId {
        let id = TensorId(self.graph.tensors.len() as u32);
        self.graph.tensors.push(desc);
        id
    }

    pub fn emit(
        &mut self,
        kind: OpKind,
        inputs: &[TensorId],
        name: impl Into<String>,
    ) -> BackendResult<TensorId> {
        let (dtype, shape) = check_operands(&self.graph.tensors, kind, inputs)?;
        let output = self.input(TensorDesc::new(name, dtype, shape));
        self.graph.nodes.push(OpNode {
            kind,
            inputs: inputs.to_vec(),
            output,
        });
        Ok(output)
    }

    pub fn matmul(&mut self, lhs: TensorId, rhs: TensorId) -> BackendResult<TensorId> {
        let name = format!("matmul_{}", self.graph.nodes.len());
        self.emit(OpKind::Matmul, &[lhs, rhs], name)
    }

    pub fn add(&mut self, lhs: TensorId, rhs: TensorId) -> BackendResult<TensorId> {
        let name = format!("add_{}", self.graph.nodes.len());
        self.emit(OpKind::Add, &[lhs, rhs], name)
    }

    pub fn mul(&mut self, lhs: TensorId, rhs: TensorId) -> BackendResult<TensorId> {
        let name = format!("mul_{}", self.graph.nodes.len());
        self.emit(OpKind::Mul, &[lhs, rhs], name)
    }

    pub fn copy(&mut self, src: TensorId) -> BackendResult<TensorId> {
        let name = format!("copy_{}", self.graph.nodes.len());
        self.emit(OpKind::Copy, &[src], name)
    }

    pub fn finish(self) -> Graph {
        self.graph
    }
}

/// Arity and definedness checks followed by output inference.
fn check_operands(
    tensors: &[TensorDesc],
    kind: OpKind,
    inputs: &[TensorId],
) -> BackendResult<(DType, Vec<usize>)> {
    if inputs.len() != kind.arity() {
        return Err(BackendError::execution(format!(
            "{kind} expects {} operands, got {}",
            kind.arity(),
            inputs.len()
        )));
    }
    let operands = inputs
        .iter()
        .map(|id| {
            tensors.get(id.index()).ok_or_else(|| {
                BackendError::execution(format!("{kind} operand {} is not defined", id.0))
            })
        })
        .collect::<BackendResult<Vec<_>>>()?;
    infer_output(kind, &operands)
}

fn infer_output(kind: OpKind, operands: &[&TensorDesc]) -> BackendResult<(DType, Vec<usize>)> {
    match kind {
        OpKind::Copy => Ok((operands[0].dtype, operands[0].shape.clone())),
        OpKind::Add | OpKind::Mul => {
            let (lhs, rhs) = (operands[0], operands[1]);
            if lhs.dtype != rhs.dtype || lhs.shape != rhs.shape {
                return Err(BackendError::execution(format!(
                    "{kind} operands must match: {:?} {:?} vs {:?} {:?}",
                    lhs.dtype, lhs.shape, rhs.dtype, rhs.shape
                )));
            }
            Ok((lhs.dtype, lhs.shape.clone()))
        }
        OpKind::Matmul => {
            let (lhs, rhs) = (operands[0], operands[1]);
            match (lhs.shape.as_slice(), rhs.shape.as_slice()) {
                ([m, k_lhs], [k_rhs, n]) if k_lhs == k_rhs && lhs.dtype == rhs.dtype => {
                    Ok((lhs.dtype, vec![*m, *n]))
                }
                _ => Err(BackendError::execution(format!(
                    "MATMUL expects [m, k] x [k, n] operands of one dtype, got {:?} x {:?}",
                    lhs.shape, rhs.shape
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_infers_outputs_and_signatures() {
        let mut builder = GraphBuilder::new();
        let x = builder.input(TensorDesc::new("x", DType::F32, [4, 3]));
        let w = builder.input(TensorDesc::new("w", DType::F32, [3, 2]));
        let y = builder.matmul(x, w).unwrap();
        let graph = builder.finish();

        assert_eq!(graph.tensor(y).shape, vec![4, 2]);
        assert_eq!(graph.len(), 1);
        let op = graph.op(0);
        assert_eq!(op.output_id(), y);
        assert_eq!(
            op.signature().to_string(),
            "MATMUL(f32[4x3], f32[3x2]) -> f32[4x2]"
        );
    }

    #[test]
    fn builder_rejects_mismatched_operands() {
        let mut builder = GraphBuilder::new();
        let a = builder.input(TensorDesc::new("a", DType::F32, [4, 3]));
        let b = builder.input(TensorDesc::new("b", DType::F32, [4, 3]));
        assert!(builder.matmul(a, b).is_err());
        assert!(builder.add(a, TensorId(9)).is_err());
        assert!(builder.emit(OpKind::Copy, &[a, b], "bad").is_err());
        assert!(builder.mul(a, b).is_ok());
    }

    #[test]
    fn rows_fold_leading_dimensions() {
        let desc = TensorDesc::new("t", DType::F32, [2, 5, 8]);
        assert_eq!(desc.rows(), Some(10));
        assert_eq!(desc.row_bytes(), Some(32));
        assert_eq!(desc.byte_len(), Some(320));
        assert_eq!(TensorDesc::new("s", DType::F32, Vec::<usize>::new()).rows(), Some(1));
    }

    #[test]
    fn sizes_report_overflow() {
        let huge = TensorDesc::new("huge", DType::F32, [usize::MAX / 2, 4]);
        assert_eq!(huge.element_count(), None);
        assert_eq!(huge.byte_len(), None);
        assert_eq!(huge.rows(), Some(usize::MAX / 2));

        // Elements fit, bytes do not.
        let wide = TensorDesc::new("w", DType::F32, [usize::MAX / 4 + 1]);
        assert_eq!(wide.element_count(), Some(usize::MAX / 4 + 1));
        assert_eq!(wide.byte_len(), None);
    }

    #[test]
    fn deserialized_graphs_are_validated() {
        let mut builder = GraphBuilder::new();
        let a = builder.input(TensorDesc::new("a", DType::F32, [2, 3]));
        let b = builder.input(TensorDesc::new("b", DType::F32, [3, 4]));
        builder.matmul(a, b).unwrap();
        let graph = builder.finish();
        let json = serde_json::to_string(&graph).unwrap();
        assert_eq!(serde_json::from_str::<Graph>(&json).unwrap(), graph);

        let tensors = r#"[
            {"name": "a", "dtype": "f32", "shape": [2, 3]},
            {"name": "b", "dtype": "f32", "shape": [3, 4]},
            {"name": "c", "dtype": "f32", "shape": [2, 4]}
        ]"#;
        let with_nodes = |nodes: &str| format!(r#"{{"tensors": {tensors}, "nodes": {nodes}}}"#);

        let dangling = with_nodes(r#"[{"kind": "MATMUL", "inputs": [0, 7], "output": 2}]"#);
        let err = serde_json::from_str::<Graph>(&dangling).unwrap_err();
        assert!(err.to_string().contains("operand 7 is not defined"), "{err}");

        let undefined_output = with_nodes(r#"[{"kind": "MATMUL", "inputs": [0, 1], "output": 9}]"#);
        assert!(serde_json::from_str::<Graph>(&undefined_output).is_err());

        let wrong_shape = with_nodes(r#"[{"kind": "ADD", "inputs": [0, 0], "output": 2}]"#);
        assert!(serde_json::from_str::<Graph>(&wrong_shape).is_err());

        let wrong_arity = with_nodes(r#"[{"kind": "COPY", "inputs": [0, 1], "output": 2}]"#);
        assert!(serde_json::from_str::<Graph>(&wrong_arity).is_err());
    }
}
