use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use hetero_rs::accel::{AcceleratorDriver, DevicePtr, HOST_PAGE_SIZE};
use hetero_rs::{BackendError, BackendResult, MemoryInfo};

const SIM_ALLOC_GRANULARITY: u64 = 256;

struct SimDevice {
    name: String,
    total: usize,
}

struct SimAllocation {
    ordinal: usize,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct SimState {
    next_ptr: u64,
    allocations: BTreeMap<u64, SimAllocation>,
    used: Vec<usize>,
    registered: HashMap<usize, usize>,
    registered_bytes: usize,
}

/// Counters exposed for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub init_calls: usize,
    pub device_allocs: usize,
    pub device_frees: usize,
    pub pinned_allocs: usize,
    pub pinned_frees: usize,
    pub host_registrations: usize,
    pub host_unregistrations: usize,
    pub synchronize_calls: usize,
}

/// In-memory accelerator driver: device memory lives in host vectors.
///
/// Device allocations are bounded by each device's configured total memory, and host
/// registration by a shared capacity, so failure paths can be exercised without hardware.
pub struct SimDriver {
    family: String,
    devices: Vec<SimDevice>,
    register_capacity: usize,
    fail_init: bool,
    state: Mutex<SimState>,
    init_calls: AtomicUsize,
    device_allocs: AtomicUsize,
    device_frees: AtomicUsize,
    pinned_allocs: AtomicUsize,
    pinned_frees: AtomicUsize,
    host_registrations: AtomicUsize,
    host_unregistrations: AtomicUsize,
    synchronize_calls: AtomicUsize,
}

impl SimDriver {
    pub fn new(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            devices: Vec::new(),
            register_capacity: usize::MAX,
            fail_init: false,
            state: Mutex::new(SimState {
                next_ptr: 0x1000,
                ..SimState::default()
            }),
            init_calls: AtomicUsize::new(0),
            device_allocs: AtomicUsize::new(0),
            device_frees: AtomicUsize::new(0),
            pinned_allocs: AtomicUsize::new(0),
            pinned_frees: AtomicUsize::new(0),
            host_registrations: AtomicUsize::new(0),
            host_unregistrations: AtomicUsize::new(0),
            synchronize_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_device(mut self, name: impl Into<String>, total_memory: usize) -> Self {
        self.devices.push(SimDevice {
            name: name.into(),
            total: total_memory,
        });
        self.state.get_mut().expect("sim state poisoned").used.push(0);
        self
    }

    /// Adds `count` identical devices named "Sim GPU <ordinal>".
    pub fn with_devices(mut self, count: usize, total_memory: usize) -> Self {
        for _ in 0..count {
            let ordinal = self.devices.len();
            self = self.with_device(format!("Sim GPU {ordinal}"), total_memory);
        }
        self
    }

    /// Caps the bytes that may be registered at once.
    pub fn with_register_capacity(mut self, bytes: usize) -> Self {
        self.register_capacity = bytes;
        self
    }

    /// Makes every `init_device` call fail.
    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn stats(&self) -> SimStats {
        SimStats {
            init_calls: self.init_calls.load(Ordering::SeqCst),
            device_allocs: self.device_allocs.load(Ordering::SeqCst),
            device_frees: self.device_frees.load(Ordering::SeqCst),
            pinned_allocs: self.pinned_allocs.load(Ordering::SeqCst),
            pinned_frees: self.pinned_frees.load(Ordering::SeqCst),
            host_registrations: self.host_registrations.load(Ordering::SeqCst),
            host_unregistrations: self.host_unregistrations.load(Ordering::SeqCst),
            synchronize_calls: self.synchronize_calls.load(Ordering::SeqCst),
        }
    }

    /// Sizes of live allocations on `ordinal`, in allocation order.
    pub fn live_allocations(&self, ordinal: usize) -> Vec<usize> {
        self.lock()
            .allocations
            .values()
            .filter(|alloc| alloc.ordinal == ordinal)
            .map(|alloc| alloc.bytes.len())
            .collect()
    }

    pub fn registered_regions(&self) -> usize {
        self.lock().registered.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("sim state poisoned")
    }

    fn check_ordinal(&self, ordinal: usize) -> BackendResult<()> {
        if ordinal >= self.devices.len() {
            return Err(BackendError::execution(format!(
                "sim device {ordinal} does not exist"
            )));
        }
        Ok(())
    }

    fn with_allocation<R>(
        &self,
        ordinal: usize,
        ptr: DevicePtr,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> BackendResult<R> {
        let mut state = self.lock();
        let (base, alloc) = state
            .allocations
            .range_mut(..=ptr)
            .next_back()
            .ok_or_else(|| BackendError::execution(format!("{ptr:#x} is not a device pointer")))?;
        let offset = (ptr - *base) as usize;
        if alloc.ordinal != ordinal || offset + len > alloc.bytes.len() {
            return Err(BackendError::execution(format!(
                "access of {len} bytes at {ptr:#x} is outside its allocation"
            )));
        }
        Ok(f(&mut alloc.bytes[offset..offset + len]))
    }
}

impl AcceleratorDriver for SimDriver {
    fn name(&self) -> &str {
        &self.family
    }

    fn device_count(&self) -> BackendResult<usize> {
        Ok(self.devices.len())
    }

    fn device_name(&self, ordinal: usize) -> BackendResult<String> {
        self.check_ordinal(ordinal)?;
        Ok(self.devices[ordinal].name.clone())
    }

    fn memory_info(&self, ordinal: usize) -> BackendResult<MemoryInfo> {
        self.check_ordinal(ordinal)?;
        let total = self.devices[ordinal].total;
        let used = self.lock().used[ordinal];
        Ok(MemoryInfo {
            free: total.saturating_sub(used),
            total,
        })
    }

    fn init_device(&self, ordinal: usize) -> BackendResult<()> {
        self.check_ordinal(ordinal)?;
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_init {
            return Err(BackendError::execution("simulated init failure"));
        }
        Ok(())
    }

    fn alloc_device(&self, ordinal: usize, size: usize) -> BackendResult<DevicePtr> {
        self.check_ordinal(ordinal)?;
        let mut state = self.lock();
        if state.used[ordinal] + size > self.devices[ordinal].total {
            return Err(BackendError::execution(format!(
                "out of memory on sim device {ordinal}: {size} bytes requested, {} free",
                self.devices[ordinal].total - state.used[ordinal]
            )));
        }
        let ptr = state.next_ptr;
        let span = (size as u64).div_ceil(SIM_ALLOC_GRANULARITY).max(1) * SIM_ALLOC_GRANULARITY;
        state.next_ptr += span;
        state.used[ordinal] += size;
        state.allocations.insert(
            ptr,
            SimAllocation {
                ordinal,
                bytes: vec![0; size],
            },
        );
        self.device_allocs.fetch_add(1, Ordering::SeqCst);
        Ok(ptr)
    }

    fn free_device(&self, ordinal: usize, ptr: DevicePtr) -> BackendResult<()> {
        let mut state = self.lock();
        match state.allocations.get(&ptr) {
            Some(alloc) if alloc.ordinal == ordinal => {}
            _ => {
                return Err(BackendError::execution(format!(
                    "{ptr:#x} is not a live allocation on sim device {ordinal}"
                )))
            }
        }
        if let Some(alloc) = state.allocations.remove(&ptr) {
            state.used[ordinal] -= alloc.bytes.len();
        }
        self.device_frees.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn copy_to_device(&self, ordinal: usize, dst: DevicePtr, src: &[u8]) -> BackendResult<()> {
        self.with_allocation(ordinal, dst, src.len(), |bytes| bytes.copy_from_slice(src))
    }

    fn copy_from_device(
        &self,
        ordinal: usize,
        dst: &mut [u8],
        src: DevicePtr,
    ) -> BackendResult<()> {
        self.with_allocation(ordinal, src, dst.len(), |bytes| dst.copy_from_slice(bytes))
    }

    fn memset(&self, ordinal: usize, dst: DevicePtr, value: u8, len: usize) -> BackendResult<()> {
        self.with_allocation(ordinal, dst, len, |bytes| bytes.fill(value))
    }

    fn alloc_pinned(&self, size: usize) -> BackendResult<NonNull<u8>> {
        let layout = Layout::from_size_align(size, HOST_PAGE_SIZE)
            .map_err(|err| BackendError::execution(err.to_string()))?;
        // SAFETY: `layout` has non-zero size; callers never request zero bytes.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| BackendError::execution("sim pinned allocation failed"))?;
        self.pinned_allocs.fetch_add(1, Ordering::SeqCst);
        Ok(ptr)
    }

    unsafe fn free_pinned(&self, ptr: NonNull<u8>, size: usize) -> BackendResult<()> {
        let layout = Layout::from_size_align(size, HOST_PAGE_SIZE)
            .map_err(|err| BackendError::execution(err.to_string()))?;
        dealloc(ptr.as_ptr(), layout);
        self.pinned_frees.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn register_host(&self, addr: usize, len: usize) -> BackendResult<()> {
        let mut state = self.lock();
        if state.registered.contains_key(&addr) {
            return Err(BackendError::execution(format!(
                "host memory at {addr:#x} is already registered"
            )));
        }
        if state.registered_bytes + len > self.register_capacity {
            return Err(BackendError::execution(format!(
                "registering {len} bytes exceeds the pinning capacity of {} bytes",
                self.register_capacity
            )));
        }
        state.registered.insert(addr, len);
        state.registered_bytes += len;
        self.host_registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unregister_host(&self, addr: usize) -> BackendResult<()> {
        let mut state = self.lock();
        let len = state
            .registered
            .remove(&addr)
            .ok_or_else(|| BackendError::execution(format!("{addr:#x} is not registered")))?;
        state.registered_bytes -= len;
        self.host_unregistrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn synchronize(&self, ordinal: usize) -> BackendResult<()> {
        self.check_ordinal(ordinal)?;
        self.synchronize_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
