//! Tensor metadata, device tensors and strided iteration

pub mod device_tensor;
pub mod dtype;
pub mod layout;
pub mod strided;

pub use device_tensor::DeviceTensor;
pub use dtype::DType;
pub use layout::{TensorLayout, MAX_KERNEL_DIMS};
pub use strided::{Run, Runs, StridedCursor};
