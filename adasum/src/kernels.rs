//! Element kernels: the only floating-point-sensitive code in the engine.
//!
//! Every kernel accumulates in `f64` regardless of the storage type and
//! rounds once when writing back. Dispatch from a runtime `DataType` goes
//! through a single `match` that instantiates the generic kernel for the
//! matching element type; anything without a kernel is rejected with
//! `UnsupportedDType`.

use half::{bf16, f16};

use crate::error::{AdasumError, Result};
use crate::types::{DataType, NORM_EPSILON};

/// Storage types the Adasum kernels operate on.
pub trait AdasumElement: Copy + Send + Sync + 'static {
    const DTYPE: DataType;

    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;

    /// Read one element from a little-endian byte slice (alignment-safe).
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_adasum_element {
    ($($ty:ty => $dtype:expr, $size:literal, |$x:ident| $to:expr, |$v:ident| $from:expr;)*) => {
        $(
            impl AdasumElement for $ty {
                const DTYPE: DataType = $dtype;

                #[inline]
                fn to_f64(self) -> f64 {
                    let $x = self;
                    $to
                }

                #[inline]
                fn from_f64($v: f64) -> Self {
                    $from
                }

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; $size];
                    raw.copy_from_slice(&bytes[..$size]);
                    <$ty>::from_le_bytes(raw)
                }

                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes[..$size].copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_adasum_element! {
    f32 => DataType::F32, 4, |x| x as f64, |v| v as f32;
    f64 => DataType::F64, 8, |x| x, |v| v;
    f16 => DataType::F16, 2, |x| x.to_f64(), |v| f16::from_f64(v);
    bf16 => DataType::BF16, 2, |x| x.to_f64(), |v| bf16::from_f64(v);
}

/// Instantiate a generic kernel for the element type behind `dtype`.
macro_rules! dispatch_element {
    ($dtype:expr, $op:literal, $t:ident => $body:expr) => {
        match $dtype {
            DataType::F32 => {
                type $t = f32;
                $body
            }
            DataType::F64 => {
                type $t = f64;
                $body
            }
            DataType::F16 => {
                type $t = f16;
                $body
            }
            DataType::BF16 => {
                type $t = bf16;
                $body
            }
            dtype => {
                return Err(AdasumError::UnsupportedDType { dtype, op: $op });
            }
        }
    };
}

/// Dot product and squared norms of a buffer pair, accumulated in `f64`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PairStats {
    /// `sum a[i] * b[i]`
    pub dot: f64,
    /// `sum a[i] * a[i]`
    pub norm_a: f64,
    /// `sum b[i] * b[i]`
    pub norm_b: f64,
}

impl PairStats {
    /// Merge partial statistics computed over disjoint index ranges.
    pub fn accumulate(&mut self, other: PairStats) {
        self.dot += other.dot;
        self.norm_a += other.norm_a;
        self.norm_b += other.norm_b;
    }

    /// Adasum coefficient for folding `b` into `a`.
    pub fn coefficient(&self) -> f64 {
        adasum_coefficient(self.dot, self.norm_b)
    }
}

/// `1 - dot/normB`, or `1` when `b` is numerically zero.
///
/// Equal buffers give 0 (the received copy adds nothing) and orthogonal
/// buffers give exactly 1 (plain sum).
#[inline]
pub fn adasum_coefficient(dot: f64, norm_b: f64) -> f64 {
    if norm_b.abs() < NORM_EPSILON {
        1.0
    } else {
        1.0 - dot / norm_b
    }
}

fn check_len(buf_len: usize, count: usize, dtype: DataType) -> Result<()> {
    let expected = count * dtype.size_in_bytes();
    if buf_len < expected {
        return Err(AdasumError::BufferSizeMismatch {
            expected,
            actual: buf_len,
        });
    }
    Ok(())
}

// ── typed slices ───────────────────────────────────────────────────────

/// `reduce_stats` over typed slices. Both slices must have the same length.
pub fn reduce_stats_typed<T: AdasumElement>(a: &[T], b: &[T]) -> PairStats {
    debug_assert_eq!(a.len(), b.len());
    let mut stats = PairStats::default();
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x.to_f64(), y.to_f64());
        stats.dot += x * y;
        stats.norm_a += x * x;
        stats.norm_b += y * y;
    }
    stats
}

/// `a[i] = coeff * b[i] + a[i]` over typed slices.
pub fn combine_typed<T: AdasumElement>(coeff: f64, b: &[T], a: &mut [T]) {
    debug_assert_eq!(a.len(), b.len());
    for (dst, &src) in a.iter_mut().zip(b) {
        *dst = T::from_f64(coeff * src.to_f64() + dst.to_f64());
    }
}

// ── byte slices ────────────────────────────────────────────────────────

fn stats_bytes<T: AdasumElement>(a: &[u8], b: &[u8], count: usize) -> PairStats {
    let size = std::mem::size_of::<T>();
    let mut stats = PairStats::default();
    for (xa, xb) in a
        .chunks_exact(size)
        .zip(b.chunks_exact(size))
        .take(count)
    {
        let x = T::read_le(xa).to_f64();
        let y = T::read_le(xb).to_f64();
        stats.dot += x * y;
        stats.norm_a += x * x;
        stats.norm_b += y * y;
    }
    stats
}

fn combine_bytes<T: AdasumElement>(count: usize, coeff: f64, b: &[u8], a: &mut [u8]) {
    let size = std::mem::size_of::<T>();
    for (xa, xb) in a
        .chunks_exact_mut(size)
        .zip(b.chunks_exact(size))
        .take(count)
    {
        let v = coeff * T::read_le(xb).to_f64() + T::read_le(xa).to_f64();
        T::from_f64(v).write_le(xa);
    }
}

/// Dot product of `a` and `b` plus both squared norms over `count`
/// elements of `dtype`.
pub fn reduce_stats(a: &[u8], b: &[u8], count: usize, dtype: DataType) -> Result<PairStats> {
    check_len(a.len(), count, dtype)?;
    check_len(b.len(), count, dtype)?;
    let stats = dispatch_element!(dtype, "reduce_stats", T => stats_bytes::<T>(a, b, count));
    Ok(stats)
}

/// In-place weighted accumulate: `a[i] = coeff * b[i] + a[i]`.
pub fn combine(count: usize, coeff: f64, b: &[u8], a: &mut [u8], dtype: DataType) -> Result<()> {
    check_len(a.len(), count, dtype)?;
    check_len(b.len(), count, dtype)?;
    dispatch_element!(dtype, "combine", T => combine_bytes::<T>(count, coeff, b, a));
    Ok(())
}

/// Fold `b` into `a` with the Adasum rule and return the coefficient used.
pub fn pairwise_adasum(a: &mut [u8], b: &[u8], count: usize, dtype: DataType) -> Result<f64> {
    let stats = reduce_stats(a, b, count, dtype)?;
    let coeff = stats.coefficient();
    combine(count, coeff, b, a, dtype)?;
    Ok(coeff)
}

/// Plain elementwise sum `dst[i] += src[i]`, used for device-collective
/// sum reductions on host-backed devices.
pub fn sum_into(dst: &mut [u8], src: &[u8], count: usize, dtype: DataType) -> Result<()> {
    combine(count, 1.0, src, dst, dtype)
}

// ── raw pointers ───────────────────────────────────────────────────────

/// `reduce_stats` over raw host pointers.
///
/// # Safety
/// `a` and `b` must each be valid for reads of `count * dtype.size_in_bytes()` bytes.
pub unsafe fn reduce_stats_ptr(a: u64, b: u64, count: usize, dtype: DataType) -> Result<PairStats> {
    let len = count * dtype.size_in_bytes();
    let a = unsafe { std::slice::from_raw_parts(a as *const u8, len) };
    let b = unsafe { std::slice::from_raw_parts(b as *const u8, len) };
    reduce_stats(a, b, count, dtype)
}

/// `combine` over raw host pointers. `a` and `b` may alias.
///
/// # Safety
/// `a` must be valid for reads and writes, and `b` for reads, of
/// `count * dtype.size_in_bytes()` bytes.
pub unsafe fn combine_ptr(count: usize, coeff: f64, b: u64, a: u64, dtype: DataType) -> Result<()> {
    let len = count * dtype.size_in_bytes();
    let src = if a == b {
        unsafe { std::slice::from_raw_parts(b as *const u8, len) }.to_vec()
    } else {
        Vec::new()
    };
    let dst = unsafe { std::slice::from_raw_parts_mut(a as *mut u8, len) };
    if a == b {
        combine(count, coeff, &src, dst, dtype)
    } else {
        let b = unsafe { std::slice::from_raw_parts(b as *const u8, len) };
        combine(count, coeff, b, dst, dtype)
    }
}
