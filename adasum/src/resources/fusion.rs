use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;

use crate::device::DeviceRuntime;
use crate::error::{AdasumError, Result};
use crate::types::{ContextId, DeviceId, StreamSet};

/// A region of device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBuffer {
    pub ptr: u64,
    pub bytes: usize,
    pub device: DeviceId,
}

/// Fusion buffer contract shared with the host framework's fusion layer.
pub trait FusionBufferManager: Send {
    /// Make sure a buffer of at least `size` bytes exists for `device`.
    ///
    /// `on_start` / `on_end` bracket an actual (re)allocation and are not
    /// called when the current buffer is already large enough.
    /// `growth_policy` maps the requested size to the size to allocate.
    #[allow(clippy::too_many_arguments)]
    fn initialize_buffer(
        &mut self,
        size: usize,
        device: DeviceId,
        context: ContextId,
        stream_set: StreamSet,
        on_start: &mut dyn FnMut(),
        on_end: &mut dyn FnMut(),
        growth_policy: &dyn Fn(usize) -> usize,
    ) -> Result<()>;

    /// The buffer set up by the last `initialize_buffer`.
    fn buffer(&self, device: DeviceId, stream_set: StreamSet) -> Result<DeviceBuffer>;
}

/// Round `size` up to a multiple of `step` bytes.
pub fn round_up_policy(step: usize) -> impl Fn(usize) -> usize {
    let step = step.max(1);
    move |size| size.div_ceil(step) * step
}

/// Growable device buffer owned by one user at a time.
pub struct DeviceFusionBuffer {
    runtime: Arc<dyn DeviceRuntime>,
    current: Option<DeviceBuffer>,
    stream_set: StreamSet,
    context: Option<ContextId>,
    allocations: usize,
}

impl DeviceFusionBuffer {
    pub fn new(runtime: Arc<dyn DeviceRuntime>) -> Self {
        Self {
            runtime,
            current: None,
            stream_set: 0,
            context: None,
            allocations: 0,
        }
    }

    /// Capacity in bytes, 0 before the first allocation.
    pub fn capacity(&self) -> usize {
        self.current.map_or(0, |b| b.bytes)
    }

    /// Number of device allocations made over this buffer's lifetime.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    pub fn context(&self) -> Option<ContextId> {
        self.context
    }

    fn release(&mut self) -> Result<()> {
        if let Some(buf) = self.current.take() {
            unsafe { self.runtime.free(buf.device, buf.ptr)? };
        }
        Ok(())
    }
}

impl FusionBufferManager for DeviceFusionBuffer {
    fn initialize_buffer(
        &mut self,
        size: usize,
        device: DeviceId,
        context: ContextId,
        stream_set: StreamSet,
        on_start: &mut dyn FnMut(),
        on_end: &mut dyn FnMut(),
        growth_policy: &dyn Fn(usize) -> usize,
    ) -> Result<()> {
        self.stream_set = stream_set;
        self.context = Some(context);
        if let Some(buf) = self.current
            && buf.device == device
            && buf.bytes >= size
        {
            return Ok(());
        }

        on_start();
        self.release()?;
        let bytes = growth_policy(size).max(size);
        let ptr = self.runtime.alloc(device, bytes)?;
        self.current = Some(DeviceBuffer { ptr, bytes, device });
        self.allocations += 1;
        on_end();
        tracing::debug!(device, bytes, %context, "fusion buffer allocated");
        Ok(())
    }

    fn buffer(&self, device: DeviceId, stream_set: StreamSet) -> Result<DeviceBuffer> {
        match self.current {
            Some(buf) if buf.device == device && self.stream_set == stream_set => Ok(buf),
            Some(buf) => Err(AdasumError::device(
                "fusion_buffer",
                device,
                format!(
                    "buffer is set up for device {} stream set {}",
                    buf.device, self.stream_set
                ),
            )),
            None => Err(AdasumError::device(
                "fusion_buffer",
                device,
                "buffer not initialised",
            )),
        }
    }
}

impl Drop for DeviceFusionBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(error = %e, "failed to free fusion buffer");
        }
    }
}

/// Process-wide pool of temporary fusion buffers.
///
/// Buffers keep their allocation while parked, so a steady workload stops
/// allocating once the pool has warmed up.
pub struct TempBufferPool {
    runtime: Arc<dyn DeviceRuntime>,
    free: SegQueue<DeviceFusionBuffer>,
    growth_bytes: usize,
    created: AtomicUsize,
}

impl TempBufferPool {
    pub fn new(runtime: Arc<dyn DeviceRuntime>, growth_bytes: usize) -> Self {
        Self {
            runtime,
            free: SegQueue::new(),
            growth_bytes,
            created: AtomicUsize::new(0),
        }
    }

    /// Borrow a buffer holding at least `size` bytes on `device`. It goes
    /// back to the pool when the guard drops.
    pub fn acquire(
        &self,
        size: usize,
        device: DeviceId,
        context: ContextId,
        stream_set: StreamSet,
    ) -> Result<PooledFusionBuffer<'_>> {
        let mut buf = self.free.pop().unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            DeviceFusionBuffer::new(self.runtime.clone())
        });
        let policy = round_up_policy(self.growth_bytes);
        buf.initialize_buffer(
            size,
            device,
            context,
            stream_set,
            &mut || {},
            &mut || {},
            &policy,
        )?;
        Ok(PooledFusionBuffer {
            pool: self,
            inner: ManuallyDrop::new(buf),
        })
    }

    /// Buffers constructed over the pool's lifetime.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Buffers currently parked in the pool.
    pub fn idle(&self) -> usize {
        self.free.len()
    }

    /// Free every parked buffer.
    pub fn drain(&self) {
        while let Some(buf) = self.free.pop() {
            drop(buf);
        }
    }
}

/// A temporary fusion buffer on loan from a [`TempBufferPool`].
pub struct PooledFusionBuffer<'a> {
    pool: &'a TempBufferPool,
    inner: ManuallyDrop<DeviceFusionBuffer>,
}

impl Deref for PooledFusionBuffer<'_> {
    type Target = DeviceFusionBuffer;

    fn deref(&self) -> &DeviceFusionBuffer {
        &self.inner
    }
}

impl DerefMut for PooledFusionBuffer<'_> {
    fn deref_mut(&mut self) -> &mut DeviceFusionBuffer {
        &mut self.inner
    }
}

impl Drop for PooledFusionBuffer<'_> {
    fn drop(&mut self) {
        // `inner` is never touched again after this.
        let buf = unsafe { ManuallyDrop::take(&mut self.inner) };
        self.pool.free.push(buf);
    }
}
