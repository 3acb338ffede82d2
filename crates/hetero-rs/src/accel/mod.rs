//! Generic accelerator family built on a vendor driver seam.
//!
//! A driver crate implements [`AcceleratorDriver`] and wraps it in an [`AcceleratorFamily`]; the
//! family provides device, pinned-host and split buffer types, host registration and backends.

pub mod backend;
pub mod buffer;
pub mod driver;
pub mod family;

pub use backend::{AcceleratorBackend, EmptyKernelSet, KernelContext, KernelSet};
pub use buffer::{DeviceBufferType, DeviceMemory, HostPins, PinnedHostBufferType, PinnedMemory};
pub use driver::{AcceleratorDriver, DevicePtr, HOST_PAGE_SIZE, MAX_DEVICES};
pub use family::AcceleratorFamily;
