use adasum::{AdasumError, DeviceId};
use cudarc::driver::DriverError;
use cudarc::nccl::result::NcclError;

/// Raw failure from the CUDA driver or NCCL, carried as the source of an
/// [`AdasumError`].
#[derive(Debug, thiserror::Error)]
pub enum CudaRuntimeError {
    #[error("CUDA driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("NCCL error: {0:?}")]
    Nccl(NcclError),

    #[error("NVRTC compile error: {0}")]
    Compile(String),
}

impl From<NcclError> for CudaRuntimeError {
    fn from(e: NcclError) -> Self {
        CudaRuntimeError::Nccl(e)
    }
}

/// Map a driver error from `call` on `device` into the engine's error type.
pub(crate) fn driver(
    call: &'static str,
    device: DeviceId,
) -> impl FnOnce(DriverError) -> AdasumError {
    move |e| AdasumError::device_with_source(call, device, CudaRuntimeError::Driver(e))
}

/// Map a kernel compile or load failure on `device` into the engine's error
/// type.
pub(crate) fn compile(
    call: &'static str,
    device: DeviceId,
) -> impl FnOnce(String) -> AdasumError {
    move |log| AdasumError::device_with_source(call, device, CudaRuntimeError::Compile(log))
}

/// Map an NCCL error from `call` into the engine's error type.
pub(crate) fn nccl(call: &'static str) -> impl FnOnce(NcclError) -> AdasumError {
    move |e| AdasumError::DeviceCollective {
        call,
        message: CudaRuntimeError::Nccl(e).to_string(),
    }
}
