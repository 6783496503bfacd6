//! HIP device properties

use std::ffi::CStr;

// Opaque buffer for hipDeviceProp_t; must be exactly sizeof(hipDeviceProp_t)
// (1472 bytes on ROCm 6.x/7.x). Fields are read at fixed offsets.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct HipDeviceProp {
    _buffer: [u8; 1472],
}

impl HipDeviceProp {
    const NAME_OFFSET: usize = 0;
    const TOTAL_GLOBAL_MEM_OFFSET: usize = 288;
    const SHARED_MEM_PER_BLOCK_OFFSET: usize = 296;
    const WARP_SIZE_OFFSET: usize = 308;
    const MAX_THREADS_PER_BLOCK_OFFSET: usize = 320;
    const MULTI_PROCESSOR_COUNT_OFFSET: usize = 388;

    pub fn name(&self) -> String {
        let name_bytes = &self._buffer[Self::NAME_OFFSET..Self::NAME_OFFSET + 256];
        let len = name_bytes.iter().position(|&c| c == 0).unwrap_or(256);
        String::from_utf8_lossy(&name_bytes[..len]).into_owned()
    }

    pub fn total_global_mem(&self) -> u64 {
        self.read_u64(Self::TOTAL_GLOBAL_MEM_OFFSET).unwrap_or(0)
    }

    pub fn shared_mem_per_block(&self) -> usize {
        self.read_u64(Self::SHARED_MEM_PER_BLOCK_OFFSET)
            .unwrap_or(65536) as usize
    }

    pub fn warp_size(&self) -> i32 {
        self.read_i32(Self::WARP_SIZE_OFFSET).unwrap_or(32)
    }

    pub fn max_threads_per_block(&self) -> i32 {
        self.read_i32(Self::MAX_THREADS_PER_BLOCK_OFFSET).unwrap_or(1024)
    }

    /// Number of compute units
    pub fn multi_processor_count(&self) -> i32 {
        self.read_i32(Self::MULTI_PROCESSOR_COUNT_OFFSET).unwrap_or_else(|| {
            tracing::error!("FFI struct field access failed: multi_processor_count");
            0
        })
    }

    fn read_u64(&self, offset: usize) -> Option<u64> {
        self._buffer[offset..offset + 8]
            .try_into()
            .ok()
            .map(u64::from_ne_bytes)
    }

    fn read_i32(&self, offset: usize) -> Option<i32> {
        self._buffer[offset..offset + 4]
            .try_into()
            .ok()
            .map(i32::from_ne_bytes)
    }
}

impl Default for HipDeviceProp {
    fn default() -> Self {
        HipDeviceProp {
            _buffer: [0u8; 1472],
        }
    }
}

/// HIP error string for an error code
pub fn get_error_string(error: i32) -> String {
    unsafe {
        let error_ptr = super::ffi::hipGetErrorString(error);
        if error_ptr.is_null() {
            "Unknown error".to_string()
        } else {
            CStr::from_ptr(error_ptr).to_string_lossy().into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_prop_reads_zeroes() {
        let props = HipDeviceProp::default();
        assert_eq!(props.name(), "");
        assert_eq!(props.total_global_mem(), 0);
        assert_eq!(props.multi_processor_count(), 0);
        assert_eq!(std::mem::size_of::<HipDeviceProp>(), 1472);
    }
}
