//! CUDA accelerator family.
//!
//! The driver library is opened at runtime; on machines without CUDA the family simply is not
//! registered.

pub mod driver;

use std::sync::Arc;

use hetero_rs::accel::AcceleratorFamily;
use hetero_rs::{BackendConfig, BackendError, BackendRegistry, BackendResult, DeviceQuery};

pub use driver::{is_available, CudaDriver};

pub const CUDA_FAMILY: &str = "cuda";

/// Builds the CUDA family over the process-wide driver.
pub fn cuda_family(config: &BackendConfig) -> BackendResult<AcceleratorFamily> {
    AcceleratorFamily::new(driver::driver()?, config)
}

/// Register the CUDA family with `registry` when a driver and at least one device are present.
///
/// Returns whether the family is registered afterwards.
pub fn register_cuda_backend(
    registry: &BackendRegistry,
    config: &BackendConfig,
) -> BackendResult<bool> {
    if registry.has_family(CUDA_FAMILY) {
        return Ok(true);
    }
    let family = match cuda_family(config) {
        Ok(family) => family,
        Err(err) => {
            tracing::info!("CUDA backend not registered: {err}");
            return Ok(false);
        }
    };
    if family.count() == 0 {
        tracing::info!("CUDA driver found no devices");
        return Ok(false);
    }
    match registry.register_family(Arc::new(family)) {
        Ok(()) | Err(BackendError::DuplicateFamily(_)) => Ok(true),
        Err(err) => Err(err),
    }
}
