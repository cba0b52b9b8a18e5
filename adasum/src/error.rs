use crate::types::{DataType, DeviceId, Rank};

pub type Result<T> = std::result::Result<T, AdasumError>;

#[derive(Debug, thiserror::Error)]
pub enum AdasumError {
    #[error("unsupported data type: {dtype:?} for operation {op}")]
    UnsupportedDType { dtype: DataType, op: &'static str },

    #[error("unsupported adasum algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("invalid entry {index}: {reason}")]
    InvalidEntry { index: usize, reason: String },

    #[error("invalid rank {rank}: communicator size is {size}")]
    InvalidRank { rank: Rank, size: u32 },

    #[error("{call} failed on device {device}: {message}")]
    Device {
        call: &'static str,
        device: DeviceId,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("device collective {call} failed: {message}")]
    DeviceCollective { call: &'static str, message: String },

    #[error("{operation} with rank {rank} failed: {reason}")]
    Transport {
        operation: &'static str,
        rank: Rank,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("resource manager is closed")]
    ResourcesClosed,

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl AdasumError {
    /// Create a `Device` error with just a message.
    pub fn device(call: &'static str, device: DeviceId, msg: impl Into<String>) -> Self {
        Self::Device {
            call,
            device,
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Device` error with a message and a source error.
    pub fn device_with_source(
        call: &'static str,
        device: DeviceId,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Device {
            call,
            device,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `Transport` error for a failed point-to-point step.
    pub fn transport(operation: &'static str, rank: Rank, reason: impl Into<String>) -> Self {
        Self::Transport {
            operation,
            rank,
            reason: reason.into(),
        }
    }

    /// Whether the process must stop after this error.
    ///
    /// Device, collective and transport failures leave a tree or collective
    /// protocol half-executed on the peers, so there is no safe way to carry
    /// on with the next batch. Argument errors are detected before any
    /// traffic and can be reported back to the caller.
    pub fn is_fatal(&self) -> bool {
        match self {
            AdasumError::UnsupportedDType { .. }
            | AdasumError::BufferSizeMismatch { .. }
            | AdasumError::InvalidEntry { .. }
            | AdasumError::InvalidRank { .. } => false,
            AdasumError::UnsupportedAlgorithm(_)
            | AdasumError::Device { .. }
            | AdasumError::DeviceCollective { .. }
            | AdasumError::Transport { .. }
            | AdasumError::Config(_)
            | AdasumError::ResourcesClosed
            | AdasumError::LockPoisoned(_) => true,
        }
    }
}
