//! CUDA driver and NCCL backend for the adasum engine.

pub mod error;
pub mod kernels;
pub mod runtime;
pub mod types;

pub use error::CudaRuntimeError;
pub use runtime::CudaRuntime;
pub use types::to_nccl_dtype;
