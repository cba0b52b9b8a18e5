use crate::error::{AdasumError, Result};
use crate::types::{CPU_DEVICE_ID, ContextId, DataType, DeviceId};

/// One tensor in a batch, as handed over by the host framework.
///
/// Pointers are raw addresses in the memory space of `device` (host memory
/// for `CPU_DEVICE_ID`). The engine dereferences them only while the call
/// that received the entry is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub input: u64,
    pub output: u64,
    pub size_bytes: usize,
    pub count: usize,
    pub dtype: DataType,
    pub device: DeviceId,
    pub context: ContextId,
}

impl Entry {
    pub fn new(
        input: u64,
        output: u64,
        count: usize,
        dtype: DataType,
        device: DeviceId,
        context: ContextId,
    ) -> Self {
        Self {
            input,
            output,
            size_bytes: count * dtype.size_in_bytes(),
            count,
            dtype,
            device,
            context,
        }
    }

    /// In-place entry: the result overwrites the input.
    pub fn in_place(
        ptr: u64,
        count: usize,
        dtype: DataType,
        device: DeviceId,
        context: ContextId,
    ) -> Self {
        Self::new(ptr, ptr, count, dtype, device, context)
    }

    /// True if input and output are the same buffer.
    pub fn aliased(&self) -> bool {
        self.input == self.output
    }

    pub fn on_host(&self) -> bool {
        self.device == CPU_DEVICE_ID
    }

    /// Reject entries the kernels cannot handle, before any traffic.
    pub fn validate(&self, index: usize) -> Result<()> {
        if !self.dtype.is_adasum_supported() {
            return Err(AdasumError::UnsupportedDType {
                dtype: self.dtype,
                op: "adasum",
            });
        }
        let expected = self.count * self.dtype.size_in_bytes();
        if self.size_bytes != expected {
            return Err(AdasumError::InvalidEntry {
                index,
                reason: format!(
                    "{} bytes for {} x {}, expected {expected}",
                    self.size_bytes, self.count, self.dtype
                ),
            });
        }
        if self.count > 0 && (self.input == 0 || self.output == 0) {
            return Err(AdasumError::InvalidEntry {
                index,
                reason: "null buffer".into(),
            });
        }
        Ok(())
    }
}

/// Per-batch metadata from the dispatch layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// Device id of every global rank, indexed by rank.
    pub devices: Vec<DeviceId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_ok() {
        let e = Entry::in_place(0x1000, 4, DataType::F32, 0, ContextId(0));
        assert_eq!(e.size_bytes, 16);
        assert!(e.aliased());
        assert!(e.validate(0).is_ok());
    }

    #[test]
    fn test_validate_size_mismatch() {
        let mut e = Entry::new(0x1000, 0x2000, 4, DataType::F64, 0, ContextId(0));
        e.size_bytes = 30;
        assert!(!e.aliased());
        let err = e.validate(3).unwrap_err();
        assert!(matches!(err, AdasumError::InvalidEntry { index: 3, .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_validate_dtype() {
        let e = Entry::in_place(0x1000, 4, DataType::I64, 0, ContextId(0));
        assert!(matches!(
            e.validate(0),
            Err(AdasumError::UnsupportedDType { .. })
        ));
    }

    #[test]
    fn test_validate_null() {
        let e = Entry::in_place(0, 4, DataType::F32, 0, ContextId(0));
        assert!(matches!(
            e.validate(1),
            Err(AdasumError::InvalidEntry { index: 1, .. })
        ));
    }
}
