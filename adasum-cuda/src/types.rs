use std::ffi::{c_char, c_int};

use adasum::device::{COLLECTIVE_ID_BYTES, CollectiveId};
use adasum::{AdasumError, DataType, DeviceId};
use cudarc::nccl::sys;

/// Convert an engine DataType to the NCCL data type.
pub fn to_nccl_dtype(dt: DataType) -> sys::ncclDataType_t {
    match dt {
        DataType::F32 => sys::ncclDataType_t::ncclFloat32,
        DataType::F64 => sys::ncclDataType_t::ncclFloat64,
        DataType::F16 => sys::ncclDataType_t::ncclFloat16,
        DataType::BF16 => sys::ncclDataType_t::ncclBfloat16,
        DataType::I8 => sys::ncclDataType_t::ncclInt8,
        DataType::I32 => sys::ncclDataType_t::ncclInt32,
        DataType::I64 => sys::ncclDataType_t::ncclInt64,
        DataType::U8 => sys::ncclDataType_t::ncclUint8,
        DataType::U32 => sys::ncclDataType_t::ncclUint32,
        DataType::U64 => sys::ncclDataType_t::ncclUint64,
    }
}

/// CUDA device ordinal for `device`; the CPU id has none.
pub fn device_ordinal(call: &'static str, device: DeviceId) -> adasum::Result<c_int> {
    if device < 0 {
        return Err(AdasumError::device(call, device, "not a CUDA device ordinal"));
    }
    Ok(device as c_int)
}

pub fn id_to_sys(id: &CollectiveId) -> sys::ncclUniqueId {
    let mut internal = [0 as c_char; COLLECTIVE_ID_BYTES];
    for (dst, &b) in internal.iter_mut().zip(&id.0) {
        *dst = b as c_char;
    }
    sys::ncclUniqueId { internal }
}

pub fn id_from_sys(id: &sys::ncclUniqueId) -> CollectiveId {
    let mut bytes = [0u8; COLLECTIVE_ID_BYTES];
    for (dst, &c) in bytes.iter_mut().zip(&id.internal) {
        *dst = c as u8;
    }
    CollectiveId(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_device_has_no_ordinal() {
        assert!(device_ordinal("set_device", adasum::CPU_DEVICE_ID).is_err());
        assert_eq!(device_ordinal("set_device", 3).unwrap(), 3);
    }
}
