//! Seam between the engine and an asynchronous device API.
//!
//! The orchestrators never call a driver directly; they go through
//! [`DeviceRuntime`], which speaks in raw `u64` device addresses and opaque
//! stream/event/communicator handles. [`HostRuntime`] backs "device" memory
//! with host memory so every orchestrator can run without a GPU; the CUDA
//! implementation lives in the `adasum-cuda` crate.

mod host;

pub use host::HostRuntime;

use crate::error::Result;
use crate::types::{DataType, DeviceId, Rank};

/// Size of a device-collective bootstrap id in bytes (NCCL's `ncclUniqueId`).
pub const COLLECTIVE_ID_BYTES: usize = 128;

/// Opaque stream handle issued by a [`DeviceRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// Opaque event handle issued by a [`DeviceRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

/// Opaque device-collective communicator handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectiveHandle(pub u64);

/// Bootstrap id shared by every member of a device-collective group.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectiveId(pub [u8; COLLECTIVE_ID_BYTES]);

impl std::fmt::Debug for CollectiveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CollectiveId(")?;
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Device memory holding the dot product and both squared norms of one
/// pairwise combine, each stored as an `f64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchTriple {
    pub device: DeviceId,
    pub norm_a: u64,
    pub norm_b: u64,
    pub dot: u64,
}

/// Asynchronous device API used by the orchestrators.
///
/// Work issued on a stream completes in issue order; the engine only waits at
/// `synchronize_stream` / `synchronize_event`. Every handle belongs to the
/// device it was created on and must not be used with another.
pub trait DeviceRuntime: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Numerically greatest (highest-priority) stream priority on `device`.
    fn greatest_stream_priority(&self, device: DeviceId) -> Result<i32>;

    /// Create a non-blocking stream with the given priority.
    fn create_stream(&self, device: DeviceId, priority: i32) -> Result<StreamHandle>;
    fn synchronize_stream(&self, device: DeviceId, stream: StreamHandle) -> Result<()>;
    fn destroy_stream(&self, device: DeviceId, stream: StreamHandle) -> Result<()>;

    fn create_event(&self, device: DeviceId) -> Result<EventHandle>;
    fn record_event(
        &self,
        device: DeviceId,
        event: EventHandle,
        stream: StreamHandle,
    ) -> Result<()>;
    fn synchronize_event(&self, device: DeviceId, event: EventHandle) -> Result<()>;
    fn destroy_event(&self, device: DeviceId, event: EventHandle) -> Result<()>;

    /// Allocate `bytes` of device memory, returning its address.
    fn alloc(&self, device: DeviceId, bytes: usize) -> Result<u64>;

    /// # Safety
    /// `ptr` must come from `alloc` on the same device and not be in use by
    /// any pending stream work.
    unsafe fn free(&self, device: DeviceId, ptr: u64) -> Result<()>;

    /// Copy `bytes` from device `src` to host `dst` on `stream`.
    ///
    /// # Safety
    /// `src` must be valid device memory and `dst` valid host memory for
    /// `bytes` bytes, both until `stream` is synchronised.
    unsafe fn memcpy_dtoh_async(
        &self,
        device: DeviceId,
        dst: u64,
        src: u64,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Copy `bytes` from host `src` to device `dst` on `stream`.
    ///
    /// # Safety
    /// As for [`memcpy_dtoh_async`](Self::memcpy_dtoh_async) with the roles swapped.
    unsafe fn memcpy_htod_async(
        &self,
        device: DeviceId,
        dst: u64,
        src: u64,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Device-to-device copy on `stream`.
    ///
    /// # Safety
    /// Both ranges must be valid device memory for `bytes` bytes until
    /// `stream` is synchronised.
    unsafe fn memcpy_dtod_async(
        &self,
        device: DeviceId,
        dst: u64,
        src: u64,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Write `a.b`, `a.a` and `b.b` over `count` elements into `scratch`.
    ///
    /// # Safety
    /// `a` and `b` must be valid device memory for `count` elements of `dtype`.
    #[allow(clippy::too_many_arguments)]
    unsafe fn dot_and_norms(
        &self,
        device: DeviceId,
        a: u64,
        b: u64,
        count: usize,
        dtype: DataType,
        scratch: &ScratchTriple,
        stream: StreamHandle,
    ) -> Result<()>;

    /// `a[i] = coeff * b[i] + a[i]` with the Adasum coefficient computed on
    /// the device from the values `dot_and_norms` left in `scratch`.
    ///
    /// # Safety
    /// As for [`dot_and_norms`](Self::dot_and_norms); `a` must also be writable.
    #[allow(clippy::too_many_arguments)]
    unsafe fn scaled_add(
        &self,
        device: DeviceId,
        a: u64,
        b: u64,
        count: usize,
        dtype: DataType,
        scratch: &ScratchTriple,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Generate a fresh device-collective bootstrap id.
    fn collective_unique_id(&self) -> Result<CollectiveId>;

    /// Join the device-collective group named by `id`. Blocks until every
    /// member has joined.
    fn collective_init(
        &self,
        id: &CollectiveId,
        nranks: u32,
        rank: Rank,
        device: DeviceId,
    ) -> Result<CollectiveHandle>;

    /// Sum-reduce `send` across the group into `recv` on `root`.
    ///
    /// # Safety
    /// `send` (and `recv` on the root) must be valid device memory for
    /// `count` elements of `dtype` until `stream` is synchronised.
    #[allow(clippy::too_many_arguments)]
    unsafe fn collective_reduce_sum(
        &self,
        comm: CollectiveHandle,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
        root: Rank,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Broadcast `buf` from `root` to every member, in place.
    ///
    /// # Safety
    /// `buf` must be valid device memory for `count` elements of `dtype`
    /// until `stream` is synchronised.
    unsafe fn collective_broadcast(
        &self,
        comm: CollectiveHandle,
        buf: u64,
        count: usize,
        dtype: DataType,
        root: Rank,
        stream: StreamHandle,
    ) -> Result<()>;

    fn collective_destroy(&self, comm: CollectiveHandle) -> Result<()>;
}
