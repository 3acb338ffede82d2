use std::ops::Range;
use std::sync::Arc;

use anyhow::Result;
use hetero_rs::accel::{AcceleratorFamily, KernelContext, KernelSet, MAX_DEVICES};
use hetero_rs::graph::{DType, GraphBuilder, OpKind, OpRef, TensorDesc};
use hetero_rs::{
    BackendConfig, BackendError, BackendFamily, BackendRegistry, BackendResult, Buffer,
    BufferKind, BufferTypeExt, Device, DeviceKind, DeviceQuery, GraphTensors,
};
use hetero_rs_backend_tests::{define_backend_tests, SimDriver};

const MIB: usize = 1 << 20;

fn sim_family() -> Arc<dyn BackendFamily> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(2, MIB));
    Arc::new(AcceleratorFamily::new(driver, &BackendConfig::default()).expect("sim family"))
}

define_backend_tests!(sim_conformance, sim_family);

fn gpu(ordinal: usize) -> Device {
    Device::new("sim", ordinal, DeviceKind::Gpu)
}

fn registry_with(driver: &Arc<SimDriver>) -> Result<BackendRegistry> {
    let registry = BackendRegistry::new();
    let family = AcceleratorFamily::new(Arc::clone(driver) as _, &BackendConfig::default())?;
    registry.register_family(Arc::new(family))?;
    Ok(registry)
}

/// Copies between host-visible staging buffers and device memory one tensor at a time.
struct StagedCopyKernels;

impl KernelSet for StagedCopyKernels {
    fn supports(&self, op: &OpRef<'_>) -> bool {
        op.kind() == OpKind::Copy
    }

    fn launch(&self, ctx: &mut KernelContext<'_>, op: &OpRef<'_>) -> BackendResult<()> {
        let src = ctx.tensors.buffer(op.input_id(0))?;
        let mut staging = vec![0u8; src.size()];
        src.read(0, &mut staging)?;
        ctx.tensors.buffer_mut(op.output_id())?.write(0, &staging)
    }
}

#[test]
fn enumerates_devices_with_snapshot_names() -> Result<()> {
    let driver = Arc::new(
        SimDriver::new("sim")
            .with_device("Sim Big", 8 * MIB)
            .with_device("Sim Small", MIB),
    );
    let registry = registry_with(&driver)?;

    assert_eq!(registry.get_count(), 2);
    assert_eq!(registry.devices(), vec![gpu(0), gpu(1)]);

    let mut out = [0u8; 32];
    let written = registry.device_description(&gpu(0), &mut out);
    assert_eq!(&out[..written], b"Sim Big");

    let memory = registry.device_memory(&gpu(1));
    assert_eq!(memory.total, MIB);
    assert_eq!(memory.free, MIB);
    Ok(())
}

#[test]
fn device_count_is_clamped() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(MAX_DEVICES + 3, MIB));
    let family = AcceleratorFamily::new(driver, &BackendConfig::default())?;
    assert_eq!(family.count(), MAX_DEVICES);
    Ok(())
}

#[test]
fn split_buffer_partitions_rows_by_ratio() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(2, MIB));
    let registry = registry_with(&driver)?;

    let split_type = registry.get_split_buffer_type(&gpu(0), &[0.25, 0.75])?;
    assert_eq!(split_type.kind(), BufferKind::Split);
    let weights = TensorDesc::new("weights", DType::F32, [100, 16]);
    let buffer = split_type.allocate_tensor(&weights)?;

    let slices = buffer.split_slices().expect("split storage");
    let layout: Vec<_> = slices
        .iter()
        .map(|slice| (slice.device.ordinal(), slice.rows.clone()))
        .collect();
    assert_eq!(layout, vec![(0, 0..25), (1, 25..100)]);
    assert_eq!(driver.live_allocations(0), vec![25 * 16 * 4]);
    assert_eq!(driver.live_allocations(1), vec![75 * 16 * 4]);

    drop(buffer);
    assert!(driver.live_allocations(0).is_empty());
    assert!(driver.live_allocations(1).is_empty());
    Ok(())
}

#[test]
fn split_rows_always_cover_the_tensor() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(3, MIB));
    let registry = registry_with(&driver)?;
    let split_type = registry.get_split_buffer_type(&gpu(0), &[1.0, 1.0, 1.0])?;

    for rows in 2..40 {
        let desc = TensorDesc::new("w", DType::F32, [rows, 3]);
        let buffer = split_type.allocate_tensor(&desc)?;
        let slices = buffer.split_slices().expect("split storage");
        let mut next = 0;
        for slice in slices {
            assert_eq!(slice.rows.start, next, "gap before {:?}", slice.rows);
            assert!(!slice.rows.is_empty());
            next = slice.rows.end;
        }
        assert_eq!(next, rows);
        assert_eq!(Some(buffer.size()), desc.byte_len());
    }
    Ok(())
}

/// `(ordinal, rows)` for every slice of a split allocation.
fn split_layout(buffer: &Buffer) -> Vec<(usize, Range<usize>)> {
    buffer
        .split_slices()
        .expect("split storage")
        .iter()
        .map(|slice| (slice.device.ordinal(), slice.rows.clone()))
        .collect()
}

#[test]
fn rounded_shares_are_capped_and_the_last_device_takes_the_rest() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(3, MIB));
    let registry = registry_with(&driver)?;

    // round(3.35) = 3 for the first two devices; the last absorbs the remaining four rows.
    let even = registry.get_split_buffer_type(&gpu(0), &[0.335, 0.335, 0.33])?;
    let buffer = even.allocate_tensor(&TensorDesc::new("w", DType::F32, [10, 2]))?;
    assert_eq!(split_layout(&buffer), vec![(0, 0..3), (1, 3..6), (2, 6..10)]);
    assert_eq!(driver.live_allocations(2), vec![4 * 2 * 4]);
    drop(buffer);

    // round(1.6) = 2 twice overshoots four rows: the second share is capped at what is left
    // and the last device ends up with nothing.
    let skewed = registry.get_split_buffer_type(&gpu(0), &[0.4, 0.4, 0.2])?;
    let buffer = skewed.allocate_tensor(&TensorDesc::new("w", DType::F32, [4, 2]))?;
    assert_eq!(split_layout(&buffer), vec![(0, 0..2), (1, 2..4)]);
    assert!(driver.live_allocations(2).is_empty());
    Ok(())
}

#[test]
fn oversized_split_tensors_fail_without_allocating() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(2, MIB));
    let registry = registry_with(&driver)?;
    let split_type = registry.get_split_buffer_type(&gpu(0), &[0.5, 0.5])?;

    for shape in [vec![usize::MAX / 2, 4], vec![0, usize::MAX]] {
        let huge = TensorDesc::new("huge", DType::F32, shape);
        assert!(matches!(
            split_type.allocate_tensor(&huge),
            Err(BackendError::AllocationFailure { .. })
        ));
    }
    assert!(driver.live_allocations(0).is_empty());
    assert!(driver.live_allocations(1).is_empty());
    Ok(())
}

#[test]
fn zero_ratio_devices_get_no_slice() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(3, MIB));
    let registry = registry_with(&driver)?;
    // Short ratio lists leave trailing devices idle.
    let split_type = registry.get_split_buffer_type(&gpu(0), &[1.0, 0.0])?;
    let buffer = split_type.allocate_tensor(&TensorDesc::new("w", DType::F32, [10, 2]))?;
    let devices: Vec<_> = buffer
        .split_slices()
        .expect("split storage")
        .iter()
        .map(|slice| slice.device.ordinal())
        .collect();
    assert_eq!(devices, vec![0]);
    assert!(driver.live_allocations(1).is_empty());
    assert!(driver.live_allocations(2).is_empty());
    Ok(())
}

#[test]
fn vectors_stay_on_the_main_device() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(2, MIB));
    let registry = registry_with(&driver)?;
    let split_type = registry.get_split_buffer_type(&gpu(1), &[0.5, 0.5])?;

    let bias = split_type.allocate_tensor(&TensorDesc::new("bias", DType::F32, [64]))?;
    let slices = bias.split_slices().expect("split storage");
    assert_eq!(slices.len(), 1);
    assert_eq!(slices[0].device, gpu(1));
    assert_eq!(driver.live_allocations(1), vec![256]);
    assert!(driver.live_allocations(0).is_empty());
    Ok(())
}

#[test]
fn split_types_are_memoized_by_normalized_ratios() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(2, MIB));
    let registry = registry_with(&driver)?;

    let a = registry.get_split_buffer_type(&gpu(0), &[0.25, 0.75])?;
    let b = registry.get_split_buffer_type(&gpu(0), &[1.0, 3.0])?;
    let c = registry.get_split_buffer_type(&gpu(1), &[0.25, 0.75])?;
    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    Ok(())
}

#[test]
fn malformed_splits_are_rejected() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(2, MIB));
    let registry = registry_with(&driver)?;

    let too_many = registry.get_split_buffer_type(&gpu(0), &[0.2, 0.3, 0.5]);
    assert!(matches!(too_many, Err(BackendError::InvalidSplit { .. })));
    let all_zero = registry.get_split_buffer_type(&gpu(0), &[0.0, 0.0]);
    assert!(matches!(all_zero, Err(BackendError::InvalidSplit { .. })));
    let unknown_main = registry.get_split_buffer_type(&gpu(7), &[0.5, 0.5]);
    assert!(matches!(unknown_main, Err(BackendError::DeviceUnavailable { .. })));
    Ok(())
}

#[test]
fn split_types_refuse_flat_allocations() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(2, MIB));
    let registry = registry_with(&driver)?;
    let split_type = registry.get_split_buffer_type(&gpu(0), &[0.5, 0.5])?;
    assert!(matches!(
        split_type.allocate(1024),
        Err(BackendError::AllocationFailure { .. })
    ));
    Ok(())
}

#[test]
fn device_out_of_memory_is_recoverable() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_device("Tiny", 4096));
    let registry = registry_with(&driver)?;
    let device_type = registry.get_device_buffer_type(&gpu(0))?;

    let held = device_type.allocate(3000)?;
    assert_eq!(registry.device_memory(&gpu(0)).free, 4096 - 3000);
    let err = device_type.allocate(2000).expect_err("allocation should not fit");
    assert!(matches!(err, BackendError::AllocationFailure { size: 2000, .. }));
    assert!(err.is_recoverable());

    drop(held);
    assert_eq!(registry.device_memory(&gpu(0)).free, 4096);
    device_type.allocate(4096)?;
    Ok(())
}

#[test]
fn pinned_host_memory_is_freed_with_its_buffer() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(1, MIB));
    let registry = registry_with(&driver)?;

    let host_type = registry.get_host_buffer_type();
    assert_eq!(host_type.name(), "SIM_Host");
    assert_eq!(host_type.kind(), BufferKind::PinnedHost);
    assert!(host_type.supports_device(&Device::cpu()));
    assert!(host_type.supports_device(&gpu(0)));

    let mut staging = host_type.allocate(100)?;
    staging.write(0, &[7u8; 100])?;
    assert_eq!(staging.host_bytes().map(|bytes| bytes[99]), Some(7));
    assert_eq!(driver.stats().pinned_allocs, 1);

    drop(staging);
    assert_eq!(driver.stats().pinned_frees, 1);
    Ok(())
}

#[test]
fn handles_synchronize_and_release_once() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(2, MIB));
    let registry = registry_with(&driver)?;

    let mut handle = registry.backend_init(&gpu(1))?;
    assert_eq!(handle.name(), "SIM1");
    assert!(handle.is_family("sim"));
    assert!(!handle.is_family("cpu"));
    assert_eq!(driver.stats().init_calls, 1);

    handle.synchronize()?;
    assert_eq!(driver.stats().synchronize_calls, 1);
    handle.release()?;
    assert_eq!(driver.stats().synchronize_calls, 2);

    // Dropping an unreleased handle releases it exactly once.
    let dropped = registry.backend_init(&gpu(0))?;
    drop(dropped);
    assert_eq!(driver.stats().synchronize_calls, 3);
    Ok(())
}

#[test]
fn failed_device_init_reports_unavailable() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(1, MIB).failing_init());
    let registry = registry_with(&driver)?;

    let err = registry.backend_init(&gpu(0)).expect_err("init should fail");
    assert!(matches!(err, BackendError::DeviceUnavailable { .. }));
    assert!(err.is_recoverable());
    assert_eq!(driver.stats().init_calls, 1);
    Ok(())
}

#[test]
fn submit_without_kernels_is_unsupported() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(1, MIB));
    let registry = registry_with(&driver)?;

    let mut builder = GraphBuilder::new();
    let a = builder.input(TensorDesc::new("a", DType::F32, [4]));
    let b = builder.input(TensorDesc::new("b", DType::F32, [4]));
    builder.add(a, b)?;
    let graph = builder.finish();

    let device_type = registry.get_device_buffer_type(&gpu(0))?;
    let mut tensors = GraphTensors::allocate(&graph, &device_type)?;
    let mut handle = registry.backend_init(&gpu(0))?;
    let err = handle
        .submit(&graph, &mut tensors)
        .expect_err("no kernels are installed");
    assert!(matches!(err, BackendError::UnsupportedOperation { .. }));
    assert_eq!(driver.stats().synchronize_calls, 0);
    Ok(())
}

#[test]
fn installed_kernels_run_and_synchronize() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(1, MIB));
    let family = AcceleratorFamily::new(Arc::clone(&driver) as _, &BackendConfig::default())?
        .with_kernels(Arc::new(StagedCopyKernels));

    let mut builder = GraphBuilder::new();
    let src = builder.input(TensorDesc::new("src", DType::F32, [2, 3]));
    let dst = builder.copy(src)?;
    let graph = builder.finish();

    let device_type = family.device_buffer_type(&gpu(0))?;
    let mut tensors = GraphTensors::allocate(&graph, &device_type)?;
    tensors.write_f32(src, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;

    let mut handle = family.init_backend(&gpu(0))?;
    handle.submit(&graph, &mut tensors)?;
    assert_eq!(tensors.read_f32(dst)?, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert_eq!(driver.stats().synchronize_calls, 1);
    Ok(())
}

#[test]
fn config_document_drives_the_split() -> Result<()> {
    let document = serde_json::json!({
        "main_device": 1,
        "tensor_split": [3.0, 1.0],
        "overlap_policy": "reject",
    });
    let config = BackendConfig::from_json_str(&document.to_string())?;
    assert!(!config.register_host);

    let driver = Arc::new(SimDriver::new("sim").with_devices(2, MIB));
    let registry = registry_with(&driver)?;
    let ratios = config.split_ratios(registry.get_count())?.expect("split configured");
    let split_type = registry.get_split_buffer_type(&gpu(config.main_device), &ratios)?;
    let buffer = split_type.allocate_tensor(&TensorDesc::new("w", DType::F32, [8, 8]))?;
    let rows: Vec<_> = buffer
        .split_slices()
        .expect("split storage")
        .iter()
        .map(|slice| slice.rows.len())
        .collect();
    assert_eq!(rows, vec![6, 2]);
    Ok(())
}
