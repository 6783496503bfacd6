//! HIP sources for the built-in templates
//!
//! Every template is rendered behind a `#define` block that sets
//! `INDEX_TYPE`, one `DIMS<letter>` macro per operand (`-2` contiguous,
//! `-1` generic) and `KERNEL_SUFFIX`. Entry points are declared through
//! `TF_KERNEL(name)` so each specialization exports distinct symbols.

use crate::tensor::DType;

pub(crate) const PRELUDE: &str = r#"
#include <hip/hip_runtime.h>
#include <stdint.h>

#define TF_CONCAT_(a, b) a##b
#define TF_CONCAT(a, b) TF_CONCAT_(a, b)
#define TF_KERNEL(name) TF_CONCAT(name, KERNEL_SUFFIX)
#define TF_MAX_DIMS 16
#define TF_CONTIGUOUS -2

typedef INDEX_TYPE index_t;

// Mirrors the host-side encoding: offset, dims, then sizes and strides
struct TensorInfo {
    index_t offset;
    uint32_t dims;
    index_t sizes[TF_MAX_DIMS];
    index_t strides[TF_MAX_DIMS];
};

template <int Dims>
__device__ __forceinline__ index_t element_offset(const TensorInfo& info, index_t linear) {
    if (Dims == TF_CONTIGUOUS) {
        return info.offset + linear;
    }
    index_t offset = info.offset;
    for (int d = (int)info.dims - 1; d >= 0; --d) {
        index_t cur = linear % info.sizes[d];
        offset += cur * info.strides[d];
        linear /= info.sizes[d];
    }
    return offset;
}
"#;

const REDUCE_BODY: &str = r#"
// Tree reduction over blockDim.x slots, valid for any block width
template <typename T>
__device__ void block_reduce(T* shm) {
    unsigned int tid = threadIdx.x;
    __syncthreads();
    for (unsigned int s = 1; s < blockDim.x; s <<= 1) {
        if (tid % (2 * s) == 0 && tid + s < blockDim.x) {
            shm[tid] = ReduceOp::apply(shm[tid], shm[tid + s]);
        }
        __syncthreads();
    }
}

template <typename T>
__device__ void reduce_strided(T* dst, const T* in, const TensorInfo& info, index_t n, T init) {
    extern __shared__ unsigned char tf_shared[];
    T* shm = reinterpret_cast<T*>(tf_shared);
    T acc = init;
    index_t step = (index_t)blockDim.x * gridDim.x;
    for (index_t i = (index_t)blockIdx.x * blockDim.x + threadIdx.x; i < n; i += step) {
        acc = ReduceOp::apply(acc, in[element_offset<DIMSA>(info, i)]);
    }
    shm[threadIdx.x] = acc;
    block_reduce(shm);
    if (threadIdx.x == 0) {
        dst[blockIdx.x] = shm[0];
    }
}

template <typename T>
__device__ void reduce_partials(T* out, const T* scratch, index_t count, T init) {
    extern __shared__ unsigned char tf_shared[];
    T* shm = reinterpret_cast<T*>(tf_shared);
    shm[threadIdx.x] = threadIdx.x < count ? scratch[threadIdx.x] : init;
    block_reduce(shm);
    if (threadIdx.x == 0) {
        out[0] = shm[0];
    }
}
"#;

const FILL_BODY: &str = r#"
template <typename T>
__device__ void fill_body(T* out, TensorInfo out_info, index_t n, T value) {
    index_t step = (index_t)blockDim.x * gridDim.x;
    for (index_t i = (index_t)blockIdx.x * blockDim.x + threadIdx.x; i < n; i += step) {
        out[element_offset<DIMSA>(out_info, i)] = value;
    }
}
"#;

const COPY_BODY: &str = r#"
template <typename T>
__device__ void copy_body(T* dst, TensorInfo dst_info, const T* src, TensorInfo src_info, index_t n) {
    index_t step = (index_t)blockDim.x * gridDim.x;
    for (index_t i = (index_t)blockIdx.x * blockDim.x + threadIdx.x; i < n; i += step) {
        dst[element_offset<DIMSA>(dst_info, i)] = src[element_offset<DIMSB>(src_info, i)];
    }
}
"#;

const ADD_BODY: &str = r#"
template <typename T>
__device__ void add_body(T* out, TensorInfo out_info, const T* a, TensorInfo a_info,
                         const T* b, TensorInfo b_info, index_t n) {
    index_t step = (index_t)blockDim.x * gridDim.x;
    for (index_t i = (index_t)blockIdx.x * blockDim.x + threadIdx.x; i < n; i += step) {
        out[element_offset<DIMSA>(out_info, i)] =
            a[element_offset<DIMSB>(a_info, i)] + b[element_offset<DIMSC>(b_info, i)];
    }
}
"#;

fn c_type(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "float",
        DType::F64 => "double",
        DType::I32 => "int32_t",
    }
}

/// Whole-tensor reduction with `combine` as the body of `apply(a, b)`
pub(crate) fn reduce_source(name: &str, combine: &str) -> String {
    let mut src = String::from(PRELUDE);
    src.push_str(&format!(
        "\nstruct ReduceOp {{\n    template <typename T>\n    __device__ __forceinline__ static T apply(T a, T b) {{ return {}; }}\n}};\n",
        combine
    ));
    src.push_str(REDUCE_BODY);
    for dtype in DType::ALL {
        let (t, d) = (c_type(dtype), dtype.name());
        src.push_str(&format!(
            r#"
extern "C" __global__ void TF_KERNEL({name}_single_{d})({t}* out, const {t}* in, TensorInfo info, index_t n, {t} init) {{
    reduce_strided<{t}>(out, in, info, n, init);
}}

extern "C" __global__ void TF_KERNEL({name}_pass1_{d})({t}* scratch, const {t}* in, TensorInfo info, index_t n, {t} init) {{
    reduce_strided<{t}>(scratch, in, info, n, init);
}}

extern "C" __global__ void TF_KERNEL({name}_pass2_{d})({t}* out, const {t}* scratch, index_t count, {t} init) {{
    reduce_partials<{t}>(out, scratch, count, init);
}}
"#
        ));
    }
    src
}

pub(crate) fn fill_source() -> String {
    apply_source("fill", FILL_BODY, |t, d| {
        format!(
            "extern \"C\" __global__ void TF_KERNEL(fill_{d})({t}* out, TensorInfo out_info, index_t n, {t} value) {{\n    fill_body<{t}>(out, out_info, n, value);\n}}\n"
        )
    })
}

pub(crate) fn copy_source() -> String {
    apply_source("copy", COPY_BODY, |t, d| {
        format!(
            "extern \"C\" __global__ void TF_KERNEL(copy_{d})({t}* dst, TensorInfo dst_info, const {t}* src, TensorInfo src_info, index_t n) {{\n    copy_body<{t}>(dst, dst_info, src, src_info, n);\n}}\n"
        )
    })
}

pub(crate) fn add_source() -> String {
    apply_source("add", ADD_BODY, |t, d| {
        format!(
            "extern \"C\" __global__ void TF_KERNEL(add_{d})({t}* out, TensorInfo out_info, const {t}* a, TensorInfo a_info, const {t}* b, TensorInfo b_info, index_t n) {{\n    add_body<{t}>(out, out_info, a, a_info, b, b_info, n);\n}}\n"
        )
    })
}

fn apply_source<F>(name: &str, body: &str, entry: F) -> String
where
    F: Fn(&str, &str) -> String,
{
    let mut src = String::from(PRELUDE);
    src.push_str(&format!("\n// {}\n", name));
    src.push_str(body);
    for dtype in DType::ALL {
        src.push('\n');
        src.push_str(&entry(c_type(dtype), dtype.name()));
    }
    src
}
