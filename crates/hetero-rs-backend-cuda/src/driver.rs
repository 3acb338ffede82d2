use std::ffi::{c_char, c_void, CStr};
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use hetero_rs::accel::{AcceleratorDriver, DevicePtr};
use hetero_rs::{BackendError, BackendResult, MemoryInfo};
use libloading::Library;

use crate::CUDA_FAMILY;

type CUresult = i32;
type CUdevice = i32;
type CUcontext = *mut c_void;
type CUdeviceptr = u64;

const CUDA_SUCCESS: CUresult = 0;
const CU_MEMHOSTALLOC_PORTABLE: u32 = 0x01;
const CU_MEMHOSTREGISTER_PORTABLE: u32 = 0x01;
const DEVICE_NAME_CAPACITY: usize = 256;

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetCountFn = unsafe extern "C" fn(count: *mut i32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuDeviceGetNameFn =
    unsafe extern "C" fn(name: *mut c_char, len: i32, dev: CUdevice) -> CUresult;
type CuDeviceTotalMemV2Fn = unsafe extern "C" fn(bytes: *mut usize, dev: CUdevice) -> CUresult;
type CuDevicePrimaryCtxRetainFn =
    unsafe extern "C" fn(ctx: *mut CUcontext, dev: CUdevice) -> CUresult;
type CuDevicePrimaryCtxReleaseV2Fn = unsafe extern "C" fn(dev: CUdevice) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSynchronizeFn = unsafe extern "C" fn() -> CUresult;
type CuMemGetInfoV2Fn = unsafe extern "C" fn(free: *mut usize, total: *mut usize) -> CUresult;
type CuMemAllocV2Fn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeV2Fn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemcpyHtoDV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
) -> CUresult;
type CuMemcpyDtoHV2Fn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
) -> CUresult;
type CuMemsetD8V2Fn =
    unsafe extern "C" fn(dst_device: CUdeviceptr, value: u8, count: usize) -> CUresult;
type CuMemHostAllocFn =
    unsafe extern "C" fn(pp: *mut *mut c_void, bytesize: usize, flags: u32) -> CUresult;
type CuMemFreeHostFn = unsafe extern "C" fn(p: *mut c_void) -> CUresult;
type CuMemHostRegisterV2Fn =
    unsafe extern "C" fn(p: *mut c_void, bytesize: usize, flags: u32) -> CUresult;
type CuMemHostUnregisterFn = unsafe extern "C" fn(p: *mut c_void) -> CUresult;

struct DriverFns {
    cu_init: CuInitFn,
    cu_device_get_count: CuDeviceGetCountFn,
    cu_device_get: CuDeviceGetFn,
    cu_device_get_name: CuDeviceGetNameFn,
    cu_device_total_mem_v2: CuDeviceTotalMemV2Fn,
    cu_device_primary_ctx_retain: CuDevicePrimaryCtxRetainFn,
    cu_device_primary_ctx_release_v2: CuDevicePrimaryCtxReleaseV2Fn,
    cu_ctx_set_current: CuCtxSetCurrentFn,
    cu_ctx_synchronize: CuCtxSynchronizeFn,
    cu_mem_get_info_v2: CuMemGetInfoV2Fn,
    cu_mem_alloc_v2: CuMemAllocV2Fn,
    cu_mem_free_v2: CuMemFreeV2Fn,
    cu_memcpy_hto_d_v2: CuMemcpyHtoDV2Fn,
    cu_memcpy_dto_h_v2: CuMemcpyDtoHV2Fn,
    cu_memset_d8_v2: CuMemsetD8V2Fn,
    cu_mem_host_alloc: CuMemHostAllocFn,
    cu_mem_free_host: CuMemFreeHostFn,
    cu_mem_host_register_v2: CuMemHostRegisterV2Fn,
    cu_mem_host_unregister: CuMemHostUnregisterFn,
}

/// CUDA driver API loaded at runtime, so binaries run on machines without CUDA installed.
///
/// Each device uses its primary context, retained on first use and released on drop.
pub struct CudaDriver {
    _lib: Library,
    fns: DriverFns,
    devices: Vec<CUdevice>,
    // Stored as usize so CudaDriver can satisfy Send/Sync requirements for driver traits.
    contexts: Vec<OnceLock<Result<usize, String>>>,
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        for (device, context) in self.devices.iter().zip(&self.contexts) {
            if let Some(Ok(_)) = context.get() {
                // SAFETY: The primary context was retained exactly once by this driver.
                let _ = unsafe { (self.fns.cu_device_primary_ctx_release_v2)(*device) };
            }
        }
    }
}

static CUDA_DRIVER: OnceLock<Result<Arc<CudaDriver>, String>> = OnceLock::new();

pub fn is_available() -> bool {
    driver().is_ok()
}

/// Process-wide driver instance; loading is attempted once.
pub fn driver() -> BackendResult<Arc<CudaDriver>> {
    let init = CUDA_DRIVER.get_or_init(|| match CudaDriver::new() {
        Ok(driver) => Ok(Arc::new(driver)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(BackendError::device_unavailable(
            CUDA_FAMILY,
            format!("CUDA driver unavailable: {msg}"),
        )),
    }
}

impl CudaDriver {
    fn new() -> BackendResult<Self> {
        let lib = load_cuda_library()?;
        let fns = DriverFns {
            cu_init: load_symbol(&lib, b"cuInit\0")?,
            cu_device_get_count: load_symbol(&lib, b"cuDeviceGetCount\0")?,
            cu_device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            cu_device_get_name: load_symbol(&lib, b"cuDeviceGetName\0")?,
            cu_device_total_mem_v2: load_symbol(&lib, b"cuDeviceTotalMem_v2\0")?,
            cu_device_primary_ctx_retain: load_symbol(&lib, b"cuDevicePrimaryCtxRetain\0")?,
            cu_device_primary_ctx_release_v2: load_symbol(
                &lib,
                b"cuDevicePrimaryCtxRelease_v2\0",
            )?,
            cu_ctx_set_current: load_symbol(&lib, b"cuCtxSetCurrent\0")?,
            cu_ctx_synchronize: load_symbol(&lib, b"cuCtxSynchronize\0")?,
            cu_mem_get_info_v2: load_symbol(&lib, b"cuMemGetInfo_v2\0")?,
            cu_mem_alloc_v2: load_symbol(&lib, b"cuMemAlloc_v2\0")?,
            cu_mem_free_v2: load_symbol(&lib, b"cuMemFree_v2\0")?,
            cu_memcpy_hto_d_v2: load_symbol(&lib, b"cuMemcpyHtoD_v2\0")?,
            cu_memcpy_dto_h_v2: load_symbol(&lib, b"cuMemcpyDtoH_v2\0")?,
            cu_memset_d8_v2: load_symbol(&lib, b"cuMemsetD8_v2\0")?,
            cu_mem_host_alloc: load_symbol(&lib, b"cuMemHostAlloc\0")?,
            cu_mem_free_host: load_symbol(&lib, b"cuMemFreeHost\0")?,
            cu_mem_host_register_v2: load_symbol(&lib, b"cuMemHostRegister_v2\0")?,
            cu_mem_host_unregister: load_symbol(&lib, b"cuMemHostUnregister\0")?,
        };

        // SAFETY: Calls are made with valid out pointers and follow the CUDA driver API contract.
        let devices = unsafe {
            check_cuda((fns.cu_init)(0), "cuInit")?;
            let mut count = 0i32;
            check_cuda((fns.cu_device_get_count)(&mut count), "cuDeviceGetCount")?;
            let mut devices = Vec::with_capacity(count.max(0) as usize);
            for ordinal in 0..count.max(0) {
                let mut dev: CUdevice = 0;
                check_cuda((fns.cu_device_get)(&mut dev, ordinal), "cuDeviceGet")?;
                devices.push(dev);
            }
            devices
        };
        tracing::debug!(devices = devices.len(), "loaded CUDA driver");

        Ok(Self {
            _lib: lib,
            fns,
            contexts: devices.iter().map(|_| OnceLock::new()).collect(),
            devices,
        })
    }

    fn device(&self, ordinal: usize) -> BackendResult<CUdevice> {
        self.devices.get(ordinal).copied().ok_or_else(|| {
            BackendError::device_unavailable(
                format!("{CUDA_FAMILY}:{ordinal}"),
                format!("driver enumerates {} devices", self.devices.len()),
            )
        })
    }

    /// Makes the primary context of `ordinal` current on the calling thread.
    fn ensure_current(&self, ordinal: usize) -> BackendResult<()> {
        let device = self.device(ordinal)?;
        let context = self.contexts[ordinal].get_or_init(|| {
            let mut ctx: CUcontext = std::ptr::null_mut();
            // SAFETY: `ctx` is a valid out pointer and `device` came from cuDeviceGet.
            unsafe {
                check_cuda(
                    (self.fns.cu_device_primary_ctx_retain)(&mut ctx, device),
                    "cuDevicePrimaryCtxRetain",
                )
            }
            .map(|()| ctx as usize)
            .map_err(|err| err.to_string())
        });
        match context {
            Ok(ctx) => {
                // SAFETY: The context is retained for the lifetime of this driver.
                unsafe { check_cuda((self.fns.cu_ctx_set_current)(*ctx as CUcontext), "cuCtxSetCurrent") }
            }
            Err(msg) => Err(BackendError::execution(msg.clone())),
        }
    }
}

impl AcceleratorDriver for CudaDriver {
    fn name(&self) -> &str {
        CUDA_FAMILY
    }

    fn device_count(&self) -> BackendResult<usize> {
        Ok(self.devices.len())
    }

    fn device_name(&self, ordinal: usize) -> BackendResult<String> {
        let device = self.device(ordinal)?;
        let mut name = [0 as c_char; DEVICE_NAME_CAPACITY];
        // SAFETY: `name` is writable for its full length, which is passed to the driver.
        unsafe {
            check_cuda(
                (self.fns.cu_device_get_name)(name.as_mut_ptr(), name.len() as i32, device),
                "cuDeviceGetName",
            )?;
            Ok(CStr::from_ptr(name.as_ptr()).to_string_lossy().into_owned())
        }
    }

    fn memory_info(&self, ordinal: usize) -> BackendResult<MemoryInfo> {
        self.ensure_current(ordinal)?;
        let (mut free, mut total) = (0usize, 0usize);
        // SAFETY: Both out pointers are valid; a context is current.
        unsafe {
            check_cuda(
                (self.fns.cu_mem_get_info_v2)(&mut free, &mut total),
                "cuMemGetInfo_v2",
            )?;
        }
        if total == 0 {
            // SAFETY: Valid out pointer and device handle.
            unsafe {
                check_cuda(
                    (self.fns.cu_device_total_mem_v2)(&mut total, self.device(ordinal)?),
                    "cuDeviceTotalMem_v2",
                )?;
            }
        }
        Ok(MemoryInfo { free, total })
    }

    fn init_device(&self, ordinal: usize) -> BackendResult<()> {
        self.ensure_current(ordinal)
    }

    fn device_alignment(&self) -> usize {
        128
    }

    fn alloc_device(&self, ordinal: usize, size: usize) -> BackendResult<DevicePtr> {
        self.ensure_current(ordinal)?;
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: `ptr` is a valid out pointer for CUDA allocation.
        unsafe {
            check_cuda(
                (self.fns.cu_mem_alloc_v2)(&mut ptr, size),
                "cuMemAlloc_v2",
            )?;
        }
        Ok(ptr)
    }

    fn free_device(&self, ordinal: usize, ptr: DevicePtr) -> BackendResult<()> {
        self.ensure_current(ordinal)?;
        // SAFETY: Device pointer was allocated by this driver and is released once by its owner.
        unsafe { check_cuda((self.fns.cu_mem_free_v2)(ptr), "cuMemFree_v2") }
    }

    fn copy_to_device(&self, ordinal: usize, dst: DevicePtr, src: &[u8]) -> BackendResult<()> {
        self.ensure_current(ordinal)?;
        // SAFETY: Destination range was bounds-checked by the caller; source slice is valid.
        unsafe {
            check_cuda(
                (self.fns.cu_memcpy_hto_d_v2)(dst, src.as_ptr() as *const c_void, src.len()),
                "cuMemcpyHtoD_v2",
            )
        }
    }

    fn copy_from_device(
        &self,
        ordinal: usize,
        dst: &mut [u8],
        src: DevicePtr,
    ) -> BackendResult<()> {
        self.ensure_current(ordinal)?;
        // SAFETY: Source range was bounds-checked by the caller; destination slice is writable.
        unsafe {
            check_cuda(
                (self.fns.cu_memcpy_dto_h_v2)(dst.as_mut_ptr() as *mut c_void, src, dst.len()),
                "cuMemcpyDtoH_v2",
            )
        }
    }

    fn memset(&self, ordinal: usize, dst: DevicePtr, value: u8, len: usize) -> BackendResult<()> {
        self.ensure_current(ordinal)?;
        // SAFETY: Destination is a valid allocation of at least `len` bytes.
        unsafe { check_cuda((self.fns.cu_memset_d8_v2)(dst, value, len), "cuMemsetD8_v2") }
    }

    fn alloc_pinned(&self, size: usize) -> BackendResult<NonNull<u8>> {
        self.ensure_current(0)?;
        let mut ptr: *mut c_void = std::ptr::null_mut();
        // SAFETY: `ptr` is a valid out pointer; portable allocations are visible to all contexts.
        unsafe {
            check_cuda(
                (self.fns.cu_mem_host_alloc)(&mut ptr, size, CU_MEMHOSTALLOC_PORTABLE),
                "cuMemHostAlloc",
            )?;
        }
        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| BackendError::execution("cuMemHostAlloc returned null"))
    }

    unsafe fn free_pinned(&self, ptr: NonNull<u8>, _size: usize) -> BackendResult<()> {
        self.ensure_current(0)?;
        // SAFETY: `ptr` came from `alloc_pinned` and is freed exactly once.
        unsafe {
            check_cuda(
                (self.fns.cu_mem_free_host)(ptr.as_ptr().cast::<c_void>()),
                "cuMemFreeHost",
            )
        }
    }

    fn register_host(&self, addr: usize, len: usize) -> BackendResult<()> {
        self.ensure_current(0)?;
        // SAFETY: The caller keeps `addr..addr + len` borrowed until it is unregistered.
        unsafe {
            check_cuda(
                (self.fns.cu_mem_host_register_v2)(
                    addr as *mut c_void,
                    len,
                    CU_MEMHOSTREGISTER_PORTABLE,
                ),
                "cuMemHostRegister_v2",
            )
        }
    }

    fn unregister_host(&self, addr: usize) -> BackendResult<()> {
        self.ensure_current(0)?;
        // SAFETY: `addr` was registered through `register_host`.
        unsafe {
            check_cuda(
                (self.fns.cu_mem_host_unregister)(addr as *mut c_void),
                "cuMemHostUnregister",
            )
        }
    }

    fn synchronize(&self, ordinal: usize) -> BackendResult<()> {
        self.ensure_current(ordinal)?;
        // SAFETY: A context is current on this thread.
        unsafe { check_cuda((self.fns.cu_ctx_synchronize)(), "cuCtxSynchronize") }
    }
}

fn load_cuda_library() -> BackendResult<Library> {
    let candidates = ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"];

    for candidate in candidates {
        // SAFETY: Dynamic library probe only; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }

    Err(BackendError::execution(
        "failed to load CUDA driver library (tried libcuda.so.1, libcuda.so, nvcuda.dll, libcuda.dylib)",
    ))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> BackendResult<T> {
    // SAFETY: Caller provides expected symbol type from CUDA driver API.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        BackendError::execution(format!(
            "failed to resolve CUDA symbol {}: {err}",
            String::from_utf8_lossy(name)
        ))
    })?;
    Ok(*sym)
}

fn check_cuda(code: CUresult, op: &str) -> BackendResult<()> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(BackendError::execution(format!(
            "CUDA driver call {op} failed with code {code}"
        )))
    }
}
