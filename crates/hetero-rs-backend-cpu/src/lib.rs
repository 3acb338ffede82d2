pub mod backend;
pub mod evaluator;
pub mod family;
pub mod matmul;
pub mod meminfo;

use std::sync::Arc;

use hetero_rs::device::CPU_FAMILY;
use hetero_rs::extra::{ExtraOpRegistry, ExtraOpRegistryBuilder};
use hetero_rs::{BackendConfig, BackendError, BackendRegistry, BackendResult};

pub use backend::{CpuBackend, WorkPlan};
pub use evaluator::{GenericEvaluator, ReferenceEvaluator};
pub use family::CpuFamily;
pub use matmul::{FaerExtraBufferType, FaerMatmulTraits};

/// Providers installed by default, in priority order.
pub fn default_extra_ops(config: &BackendConfig) -> BackendResult<Arc<ExtraOpRegistry>> {
    let mut builder = ExtraOpRegistryBuilder::new().policy(config.overlap_policy);
    if config.extra_ops {
        builder.register(Arc::new(FaerExtraBufferType::new()))?;
    }
    Ok(builder.build())
}

/// Register the CPU family with `registry`.
///
/// Calling this again once the family is present is a no-op.
pub fn register_cpu_backend(registry: &BackendRegistry, config: &BackendConfig) -> BackendResult<()> {
    if registry.has_family(CPU_FAMILY) {
        return Ok(());
    }
    let family = CpuFamily::new(config.cpu_threads, default_extra_ops(config)?);
    match registry.register_family(Arc::new(family)) {
        // Lost a race with another initialiser.
        Err(BackendError::DuplicateFamily(_)) => Ok(()),
        other => other,
    }
}

/// Registers the CPU family with the global registry using the process configuration.
pub fn init_global_registry() -> BackendResult<&'static BackendRegistry> {
    let registry = hetero_rs::backend::global_registry();
    register_cpu_backend(registry, hetero_rs::env::process_config())?;
    Ok(registry)
}
