use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::Arc;

use anyhow::Result;
use hetero_rs::accel::{AcceleratorFamily, HOST_PAGE_SIZE};
use hetero_rs::buffer::HostPinning;
use hetero_rs::{BackendConfig, BackendError, BackendFamily, BackendRegistry};
use hetero_rs_backend_tests::SimDriver;

/// Page-aligned, caller-owned host memory.
struct PageRegion {
    ptr: *mut u8,
    layout: Layout,
}

impl PageRegion {
    fn new(len: usize) -> Self {
        let layout = Layout::from_size_align(len, HOST_PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }

    fn bytes(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.layout.size()) }
    }
}

impl Drop for PageRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) }
    }
}

fn enabled() -> BackendConfig {
    BackendConfig {
        register_host: true,
        ..BackendConfig::default()
    }
}

fn sim_family(driver: &Arc<SimDriver>, config: &BackendConfig) -> Result<AcceleratorFamily> {
    Ok(AcceleratorFamily::new(Arc::clone(driver) as _, config)?)
}

#[test]
fn registration_is_disabled_by_default() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(1, 1 << 20));
    let family = sim_family(&driver, &BackendConfig::default())?;
    let mut region = PageRegion::new(2 * HOST_PAGE_SIZE);

    let err = family
        .register_host_buffer(region.bytes())
        .expect_err("registration must be opt-in");
    assert!(matches!(err, BackendError::RegistrationFailure { .. }));
    assert_eq!(driver.stats().host_registrations, 0);
    Ok(())
}

#[test]
fn guard_unregisters_on_drop() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(1, 1 << 20));
    let family = sim_family(&driver, &enabled())?;
    let mut region = PageRegion::new(2 * HOST_PAGE_SIZE);

    {
        let mut registered = family.register_host_buffer(region.bytes())?;
        assert_eq!(registered.len(), 2 * HOST_PAGE_SIZE);
        registered[0] = 42;
        assert_eq!(driver.registered_regions(), 1);
        assert_eq!(family.host_pins().registered_count(), 1);
    }
    assert_eq!(driver.registered_regions(), 0);
    assert_eq!(family.host_pins().registered_count(), 0);
    assert_eq!(driver.stats().host_unregistrations, 1);
    assert_eq!(region.bytes()[0], 42);

    // The same region can be registered again once released.
    let again = family.register_host_buffer(region.bytes())?;
    again.unregister()?;
    assert_eq!(driver.stats().host_registrations, 2);
    assert_eq!(driver.stats().host_unregistrations, 2);
    Ok(())
}

#[test]
fn double_registration_fails() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(1, 1 << 20));
    let family = sim_family(&driver, &enabled())?;
    let mut region = PageRegion::new(HOST_PAGE_SIZE);

    let first = family.register_host_buffer(region.bytes())?;
    let addr = first.addr();
    std::mem::forget(first);

    let err = family
        .register_host_buffer(region.bytes())
        .expect_err("address is still registered");
    assert!(matches!(err, BackendError::RegistrationFailure { .. }));
    assert_eq!(driver.stats().host_registrations, 1);

    family.host_pins().unpin(addr, HOST_PAGE_SIZE)?;
    assert_eq!(driver.registered_regions(), 0);
    Ok(())
}

#[test]
fn misaligned_and_empty_regions_fail() -> Result<()> {
    let driver = Arc::new(SimDriver::new("sim").with_devices(1, 1 << 20));
    let family = sim_family(&driver, &enabled())?;
    let mut region = PageRegion::new(2 * HOST_PAGE_SIZE);

    assert!(matches!(
        family.register_host_buffer(&mut region.bytes()[1..]),
        Err(BackendError::RegistrationFailure { .. })
    ));
    assert!(matches!(
        family.register_host_buffer(&mut region.bytes()[..0]),
        Err(BackendError::RegistrationFailure { .. })
    ));
    assert_eq!(driver.stats().host_registrations, 0);
    Ok(())
}

#[test]
fn driver_refusal_is_a_recoverable_failure() -> Result<()> {
    let driver = Arc::new(
        SimDriver::new("sim")
            .with_devices(1, 1 << 20)
            .with_register_capacity(HOST_PAGE_SIZE),
    );
    let family = sim_family(&driver, &enabled())?;
    let mut region = PageRegion::new(4 * HOST_PAGE_SIZE);

    let err = family
        .register_host_buffer(region.bytes())
        .expect_err("region exceeds the pinning capacity");
    assert!(matches!(err, BackendError::RegistrationFailure { .. }));
    assert!(err.is_recoverable());
    assert_eq!(family.host_pins().registered_count(), 0);

    // A region that fits still works afterwards.
    let fits = family.register_host_buffer(&mut region.bytes()[..HOST_PAGE_SIZE])?;
    drop(fits);
    assert_eq!(driver.registered_regions(), 0);
    Ok(())
}

#[test]
fn registry_routes_to_the_first_pinning_family() -> Result<()> {
    let registry = BackendRegistry::new();
    let mut region = PageRegion::new(HOST_PAGE_SIZE);
    let err = registry
        .register_host_buffer(region.bytes())
        .expect_err("nothing can register host memory yet");
    assert!(matches!(err, BackendError::RegistrationFailure { .. }));

    let driver = Arc::new(SimDriver::new("sim").with_devices(1, 1 << 20));
    registry.register_family(Arc::new(sim_family(&driver, &enabled())?))?;
    let registered = registry.register_host_buffer(region.bytes())?;
    assert_eq!(driver.registered_regions(), 1);
    drop(registered);
    assert_eq!(driver.registered_regions(), 0);
    Ok(())
}
