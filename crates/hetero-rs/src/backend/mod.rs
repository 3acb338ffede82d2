//! Backend handles, backend families and the registry that ties them together.

pub mod family;
pub mod handle;
pub mod registry;

pub use family::BackendFamily;
pub use handle::{backend_is_family, Backend, BackendHandle, HandleState};
pub use registry::{
    backend_init, buffer_type_for_device, device_count, device_description, device_memory,
    devices, global_registry, has_family, host_buffer_type, list_families, register_family,
    register_host_buffer, split_buffer_type, BackendRegistry,
};
