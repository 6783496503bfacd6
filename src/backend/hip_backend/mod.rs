//! ROCm/HIP driver (feature `rocm`)

mod device;
mod driver;
mod ffi;
mod hiprtc;

pub use device::{get_error_string, HipDeviceProp};
pub use driver::HipDriver;
pub use hiprtc::Hiprtc;
