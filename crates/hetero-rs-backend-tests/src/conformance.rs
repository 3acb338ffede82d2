//! Checks every backend family must pass, instantiated per family by `define_backend_tests!`.

use std::sync::Arc;

use hetero_rs::{BackendError, BackendFamily, BufferTypeExt, Device, DeviceQuery};

const SENTINEL: u8 = 0xA5;

pub fn descriptions_fit_capacity(family: &dyn BackendFamily) {
    for ordinal in 0..family.count() {
        for capacity in [1usize, 2, 5, 16, 256] {
            let mut out = vec![SENTINEL; capacity + 8];
            let written = family.write_description(ordinal, &mut out[..capacity]);
            assert!(written < capacity, "description overflowed capacity {capacity}");
            assert_eq!(out[written], 0, "description not NUL-terminated");
            assert!(
                out[capacity..].iter().all(|b| *b == SENTINEL),
                "description wrote past capacity {capacity}"
            );
        }
        let mut empty: [u8; 0] = [];
        assert_eq!(family.write_description(ordinal, &mut empty), 0);
    }
}

pub fn memory_snapshot_is_consistent(family: &dyn BackendFamily) {
    for ordinal in 0..family.count() {
        let info = family.memory(ordinal);
        assert!(info.free <= info.total, "free {} > total {}", info.free, info.total);
    }
}

pub fn every_device_initialises(family: &dyn BackendFamily) {
    for device in family.devices() {
        let handle = family
            .init_backend(&device)
            .unwrap_or_else(|err| panic!("init {device}: {err}"));
        assert!(handle.is_family(family.name()));
        assert_eq!(handle.device(), &device);
        handle.release().expect("release backend");
    }
}

pub fn unknown_device_is_unavailable(family: &dyn BackendFamily) {
    let missing = Device::new(family.name(), family.count(), family.device_kind());
    assert!(matches!(
        family.init_backend(&missing),
        Err(BackendError::DeviceUnavailable { .. })
    ));
    assert!(matches!(
        family.device_buffer_type(&missing),
        Err(BackendError::DeviceUnavailable { .. })
    ));
}

pub fn device_buffers_round_trip(family: &dyn BackendFamily) {
    for device in family.devices() {
        let buffer_type = family.device_buffer_type(&device).expect("device buffer type");
        assert!(buffer_type.supports_device(&device));
        let mut buffer = buffer_type.allocate(64).expect("allocate");
        assert_eq!(buffer.size(), 64);
        let pattern: Vec<u8> = (0..16).collect();
        buffer.write(24, &pattern).expect("write");
        let mut back = vec![0u8; 16];
        buffer.read(24, &mut back).expect("read");
        assert_eq!(back, pattern);
        assert!(buffer.write(60, &pattern).is_err());
    }
}

pub fn buffer_type_lookups_are_memoized(family: &dyn BackendFamily) {
    for device in family.devices() {
        let first = family.device_buffer_type(&device).expect("device buffer type");
        let second = family.device_buffer_type(&device).expect("device buffer type");
        assert!(Arc::ptr_eq(&first, &second));
    }
    if let (Some(first), Some(second)) = (family.host_buffer_type(), family.host_buffer_type()) {
        assert!(Arc::ptr_eq(&first, &second));
    }
}
