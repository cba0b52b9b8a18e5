/// Rank of a participant in a communicator group (0-indexed).
pub type Rank = u32;

/// Message tag for point-to-point traffic. Entry tags double as the tree
/// rotation seed, so every peer must derive them identically.
pub type Tag = u32;

/// Device ordinal as reported by the host framework.
pub type DeviceId = i32;

/// Device id the host framework uses for tensors that live in host memory.
pub const CPU_DEVICE_ID: DeviceId = -1;

/// Index selecting one of several independent stream groups so unrelated
/// batches can overlap on the same device.
pub type StreamSet = usize;

/// Norm-squared values below this are treated as a zero vector when
/// computing the Adasum coefficient.
pub const NORM_EPSILON: f64 = 1e-18;

/// Explicit identity of the execution context issuing device work.
///
/// Scratch memory is keyed by this id; callers pass it along with every
/// entry instead of the engine inspecting the current thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// Element types a host framework can hand to the engine.
///
/// Only the floating-point kinds have Adasum kernels; the rest exist so that
/// an unsupported tensor is reported as such instead of being misread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    F16 = 2,
    BF16 = 3,
    I8 = 4,
    I32 = 5,
    I64 = 6,
    U8 = 7,
    U32 = 8,
    U64 = 9,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }

    /// True if an Adasum kernel exists for this element type.
    pub const fn is_adasum_supported(self) -> bool {
        matches!(
            self,
            DataType::F16 | DataType::BF16 | DataType::F32 | DataType::F64
        )
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
