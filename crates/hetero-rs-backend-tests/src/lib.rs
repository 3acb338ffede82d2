pub mod conformance;
pub mod doubles;
pub mod sim;

pub use doubles::{Claim, CountingEvaluator, ProviderLog, RecordingProvider};
pub use sim::{SimDriver, SimStats};

use hetero_rs::graph::{DType, GraphBuilder, TensorDesc, TensorId};
use hetero_rs::{BackendResult, Graph};

/// Graph with a single `[m, k] x [k, n]` f32 matmul; returns the graph and its (lhs, rhs, out)
/// tensor ids.
pub fn matmul_graph(m: usize, k: usize, n: usize) -> BackendResult<(Graph, [TensorId; 3])> {
    let mut builder = GraphBuilder::new();
    let lhs = builder.input(TensorDesc::new("lhs", DType::F32, [m, k]));
    let rhs = builder.input(TensorDesc::new("rhs", DType::F32, [k, n]));
    let out = builder.matmul(lhs, rhs)?;
    Ok((builder.finish(), [lhs, rhs, out]))
}

/// Deterministic, non-trivial test data.
pub fn ramp(len: usize, scale: f32) -> Vec<f32> {
    (0..len)
        .map(|i| ((i % 17) as f32 - 8.0) * scale)
        .collect()
}

#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $family_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use $crate::conformance;
            use ::hetero_rs::DeviceQuery as _;

            fn family() -> ::std::sync::Arc<dyn ::hetero_rs::BackendFamily> {
                ($family_ctor)()
            }

            #[test]
            fn descriptions_fit_capacity() {
                conformance::descriptions_fit_capacity(family().as_ref());
            }

            #[test]
            fn memory_snapshot_is_consistent() {
                conformance::memory_snapshot_is_consistent(family().as_ref());
            }

            #[test]
            fn every_device_initialises() {
                conformance::every_device_initialises(family().as_ref());
            }

            #[test]
            fn unknown_device_is_unavailable() {
                conformance::unknown_device_is_unavailable(family().as_ref());
            }

            #[test]
            fn device_buffers_round_trip() {
                conformance::device_buffers_round_trip(family().as_ref());
            }

            #[test]
            fn buffer_type_lookups_are_memoized() {
                conformance::buffer_type_lookups_are_memoized(family().as_ref());
            }

            #[test]
            #[should_panic(expected = "out of range")]
            fn describe_out_of_range_panics() {
                let family = family();
                let _ = family.describe(family.count());
            }
        }
    };
}
