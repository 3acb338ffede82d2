use std::sync::Arc;

use anyhow::Result;
use hetero_rs::backend::BackendFamily;
use hetero_rs::{BackendConfig, BackendRegistry, BufferTypeExt, DeviceQuery};
use hetero_rs_backend_cuda::{cuda_family, is_available, register_cuda_backend, CUDA_FAMILY};
use hetero_rs_backend_tests::conformance;

fn family_or_skip() -> Option<Arc<dyn BackendFamily>> {
    if !is_available() {
        eprintln!("skipping cuda family test: CUDA driver unavailable");
        return None;
    }
    match cuda_family(&BackendConfig::default()) {
        Ok(family) if family.count() > 0 => Some(Arc::new(family)),
        Ok(_) => {
            eprintln!("skipping cuda family test: no CUDA devices");
            None
        }
        Err(err) => {
            eprintln!("skipping cuda family test: {err}");
            None
        }
    }
}

#[test]
fn registration_matches_availability() -> Result<()> {
    let registry = BackendRegistry::new();
    let registered = register_cuda_backend(&registry, &BackendConfig::default())?;
    assert_eq!(registered, registry.has_family(CUDA_FAMILY));
    if registered {
        assert!(registry.get_count() > 0);
    } else {
        assert_eq!(registry.get_count(), 0);
    }
    Ok(())
}

#[test]
fn conforms_to_the_family_contract() {
    let Some(family) = family_or_skip() else {
        return;
    };
    conformance::descriptions_fit_capacity(family.as_ref());
    conformance::memory_snapshot_is_consistent(family.as_ref());
    conformance::every_device_initialises(family.as_ref());
    conformance::unknown_device_is_unavailable(family.as_ref());
    conformance::device_buffers_round_trip(family.as_ref());
    conformance::buffer_type_lookups_are_memoized(family.as_ref());
}

#[test]
fn pinned_host_memory_round_trips() -> Result<()> {
    let Some(family) = family_or_skip() else {
        return Ok(());
    };
    let host_type = family.host_buffer_type().expect("cuda offers pinned memory");
    assert_eq!(host_type.name(), "CUDA_Host");
    let mut staging = host_type.allocate(4096)?;
    staging.write(0, &[3u8; 4096])?;
    assert!(staging.host_bytes().is_some_and(|bytes| bytes.iter().all(|b| *b == 3)));
    Ok(())
}
