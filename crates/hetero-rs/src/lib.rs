extern crate self as hetero_rs;

pub mod accel;
pub mod backend;
pub mod buffer;
pub mod device;
pub mod env;
pub mod error;
pub mod extra;
pub mod graph;

pub use backend::{Backend, BackendFamily, BackendHandle, BackendRegistry};
pub use buffer::{Buffer, BufferKind, BufferType, BufferTypeExt, GraphTensors, HostRegistration};
pub use device::{Device, DeviceKind, DeviceQuery, MemoryInfo};
pub use env::BackendConfig;
pub use error::{BackendError, BackendResult};
pub use extra::{ExtraBufferType, ExtraOpRegistry, OverlapPolicy, TensorTraits};
pub use graph::{DType, Graph, GraphBuilder, OpKind, OpRef, TensorDesc, TensorId};
