//! Device-side Adasum kernels, compiled at runtime with NVRTC.
//!
//! `adasum_dot_norms_*` accumulates `a.b`, `a.a` and `b.b` in `f64` into the
//! scratch triple (which must be zeroed first); `adasum_scaled_add_*` reads
//! the triple back on the device and applies `a = coeff * b + a`. Both run on
//! the caller's stream, so nothing is copied to the host between them.

use adasum::{AdasumError, DataType};

/// Threads per block. The block reduction assumes a power of two.
pub const BLOCK_SIZE: u32 = 256;

/// Upper bound on the grid; larger buffers use the grid-stride loop.
pub const MAX_BLOCKS: u32 = 1024;

pub const DOT_NORMS: &str = "adasum_dot_norms";
pub const SCALED_ADD: &str = "adasum_scaled_add";

pub const SOURCE: &str = r#"
struct f16_t { unsigned short bits; };
struct bf16_t { unsigned short bits; };

__device__ __forceinline__ double load(const double* p, unsigned long long i) { return p[i]; }
__device__ __forceinline__ double load(const float* p, unsigned long long i) {
    return (double)p[i];
}

__device__ __forceinline__ double load(const f16_t* p, unsigned long long i) {
    float f;
    asm("cvt.f32.f16 %0, %1;" : "=f"(f) : "h"(p[i].bits));
    return (double)f;
}

__device__ __forceinline__ double load(const bf16_t* p, unsigned long long i) {
    return (double)__uint_as_float(((unsigned int)p[i].bits) << 16);
}

__device__ __forceinline__ void store(double* p, unsigned long long i, double v) { p[i] = v; }
__device__ __forceinline__ void store(float* p, unsigned long long i, double v) { p[i] = (float)v; }

__device__ __forceinline__ void store(f16_t* p, unsigned long long i, double v) {
    unsigned short h;
    asm("cvt.rn.f16.f64 %0, %1;" : "=h"(h) : "d"(v));
    p[i].bits = h;
}

__device__ __forceinline__ void store(bf16_t* p, unsigned long long i, double v) {
    unsigned int u = __float_as_uint((float)v);
    if ((u & 0x7fffffffu) > 0x7f800000u) {
        p[i].bits = 0x7fc0;
    } else {
        u += 0x7fffu + ((u >> 16) & 1u);
        p[i].bits = (unsigned short)(u >> 16);
    }
}

// CAS loop: double atomicAdd is missing before sm_60.
__device__ void atomic_add_f64(double* addr, double v) {
    unsigned long long* p = (unsigned long long*)addr;
    unsigned long long old = *p, assumed;
    do {
        assumed = old;
        old = atomicCAS(p, assumed,
                        __double_as_longlong(__longlong_as_double(assumed) + v));
    } while (assumed != old);
}

template <typename T>
__device__ void dot_norms(const T* a, const T* b, unsigned long long n,
                          double* dot, double* norm_a, double* norm_b) {
    __shared__ double s_dot[256];
    __shared__ double s_na[256];
    __shared__ double s_nb[256];

    double d = 0.0, na = 0.0, nb = 0.0;
    unsigned long long stride = (unsigned long long)gridDim.x * blockDim.x;
    for (unsigned long long i = (unsigned long long)blockIdx.x * blockDim.x + threadIdx.x;
         i < n; i += stride) {
        double x = load(a, i);
        double y = load(b, i);
        d += x * y;
        na += x * x;
        nb += y * y;
    }

    unsigned int t = threadIdx.x;
    s_dot[t] = d;
    s_na[t] = na;
    s_nb[t] = nb;
    __syncthreads();
    for (unsigned int s = blockDim.x / 2; s > 0; s >>= 1) {
        if (t < s) {
            s_dot[t] += s_dot[t + s];
            s_na[t] += s_na[t + s];
            s_nb[t] += s_nb[t + s];
        }
        __syncthreads();
    }
    if (t == 0) {
        atomic_add_f64(dot, s_dot[0]);
        atomic_add_f64(norm_a, s_na[0]);
        atomic_add_f64(norm_b, s_nb[0]);
    }
}

template <typename T>
__device__ void scaled_add(T* a, const T* b, unsigned long long n,
                           const double* dot, const double* norm_b, double eps) {
    double nb = *norm_b;
    double coeff = fabs(nb) < eps ? 1.0 : 1.0 - *dot / nb;
    unsigned long long stride = (unsigned long long)gridDim.x * blockDim.x;
    for (unsigned long long i = (unsigned long long)blockIdx.x * blockDim.x + threadIdx.x;
         i < n; i += stride) {
        store(a, i, coeff * load(b, i) + load(a, i));
    }
}

#define ADASUM_KERNELS(T, SUFFIX)                                                   \
extern "C" __global__ void adasum_dot_norms_##SUFFIX(                             \
    const T* a, const T* b, unsigned long long n,                                 \
    double* dot, double* norm_a, double* norm_b) {                                \
    dot_norms(a, b, n, dot, norm_a, norm_b);                                      \
}                                                                                 \
extern "C" __global__ void adasum_scaled_add_##SUFFIX(                            \
    T* a, const T* b, unsigned long long n,                                       \
    const double* dot, const double* norm_b, double eps) {                        \
    scaled_add(a, b, n, dot, norm_b, eps);                                        \
}

ADASUM_KERNELS(f16_t, f16)
ADASUM_KERNELS(bf16_t, bf16)
ADASUM_KERNELS(float, f32)
ADASUM_KERNELS(double, f64)
"#;

/// Symbol of `kernel` instantiated for `dtype`.
pub fn symbol(kernel: &'static str, dtype: DataType) -> adasum::Result<String> {
    let suffix = match dtype {
        DataType::F16 => "f16",
        DataType::BF16 => "bf16",
        DataType::F32 => "f32",
        DataType::F64 => "f64",
        _ => return Err(AdasumError::UnsupportedDType { dtype, op: kernel }),
    };
    Ok(format!("{kernel}_{suffix}"))
}

/// Grid size covering `count` elements, capped at [`MAX_BLOCKS`].
pub fn grid_size(count: usize) -> u32 {
    count
        .div_ceil(BLOCK_SIZE as usize)
        .clamp(1, MAX_BLOCKS as usize) as u32
}
