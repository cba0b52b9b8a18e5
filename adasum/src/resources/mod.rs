//! Device resources shared by every batch: streams, pooled events, scratch
//! memory and device-collective communicators.
//!
//! All registries are owned by a [`ResourceManager`] and populated lazily.
//! Lookups of existing entries go straight to the `DashMap`; creating an
//! entry is serialised per registry so two callers never both create the
//! same resource.

mod fusion;

pub use fusion::{
    DeviceBuffer, DeviceFusionBuffer, FusionBufferManager, PooledFusionBuffer, TempBufferPool,
    round_up_policy,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::comm::{Controller, Scope};
use crate::config::AdasumConfig;
use crate::device::{
    CollectiveHandle, CollectiveId, DeviceRuntime, EventHandle, ScratchTriple, StreamHandle,
};
use crate::error::{AdasumError, Result};
use crate::types::{ContextId, DeviceId, Rank, StreamSet};

/// A pooled event, tagged with the device it was created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub handle: EventHandle,
    pub device: DeviceId,
}

/// This rank's membership in a device-collective group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectiveComm {
    pub handle: CollectiveHandle,
    pub rank: Rank,
    pub nranks: u32,
    pub device: DeviceId,
}

/// Snapshot of how many resources each creation path has produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceStats {
    pub streams_created: usize,
    pub events_created: usize,
    pub scratch_created: usize,
    pub collectives_created: usize,
}

#[derive(Default)]
struct StatCounters {
    streams: AtomicUsize,
    events: AtomicUsize,
    scratch: AtomicUsize,
    collectives: AtomicUsize,
}

type CollectiveKey = (StreamSet, Vec<DeviceId>);

/// Owner of every long-lived device resource.
///
/// Resources live until [`close`](Self::close) (or drop); after that every
/// accessor returns `ResourcesClosed`.
pub struct ResourceManager {
    runtime: Arc<dyn DeviceRuntime>,
    streams: DashMap<(StreamSet, DeviceId), StreamHandle>,
    stream_insert: Mutex<()>,
    event_pools: Mutex<HashMap<DeviceId, Vec<Event>>>,
    scratch: DashMap<ContextId, ScratchTriple>,
    scratch_insert: Mutex<()>,
    collectives: DashMap<CollectiveKey, CollectiveComm>,
    collective_insert: Mutex<()>,
    temp_buffers: TempBufferPool,
    counters: StatCounters,
    closed: AtomicBool,
}

impl ResourceManager {
    pub fn open(runtime: Arc<dyn DeviceRuntime>, config: &AdasumConfig) -> Self {
        tracing::debug!(runtime = runtime.name(), "opening resource manager");
        Self {
            temp_buffers: TempBufferPool::new(runtime.clone(), config.fusion_growth_bytes),
            runtime,
            streams: DashMap::new(),
            stream_insert: Mutex::new(()),
            event_pools: Mutex::new(HashMap::new()),
            scratch: DashMap::new(),
            scratch_insert: Mutex::new(()),
            collectives: DashMap::new(),
            collective_insert: Mutex::new(()),
            counters: StatCounters::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    pub fn temp_buffers(&self) -> &TempBufferPool {
        &self.temp_buffers
    }

    pub fn stats(&self) -> ResourceStats {
        ResourceStats {
            streams_created: self.counters.streams.load(Ordering::Relaxed),
            events_created: self.counters.events.load(Ordering::Relaxed),
            scratch_created: self.counters.scratch.load(Ordering::Relaxed),
            collectives_created: self.counters.collectives.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(AdasumError::ResourcesClosed);
        }
        Ok(())
    }

    // ── streams ────────────────────────────────────────────────────────

    /// Stream for `(stream_set, device)`, created on first use with the
    /// device's greatest priority.
    pub fn stream(&self, stream_set: StreamSet, device: DeviceId) -> Result<StreamHandle> {
        self.check_open()?;
        if let Some(s) = self.streams.get(&(stream_set, device)) {
            return Ok(*s);
        }

        let _guard = self.stream_insert.lock();
        if let Some(s) = self.streams.get(&(stream_set, device)) {
            return Ok(*s);
        }
        let priority = self.runtime.greatest_stream_priority(device)?;
        let stream = self.runtime.create_stream(device, priority)?;
        self.streams.insert((stream_set, device), stream);
        self.counters.streams.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(stream_set, device, priority, "created stream");
        Ok(stream)
    }

    /// Make sure every device in `devices` has a stream in `stream_set`.
    pub fn ensure_streams(&self, stream_set: StreamSet, devices: &[DeviceId]) -> Result<()> {
        for &device in devices {
            self.stream(stream_set, device)?;
        }
        Ok(())
    }

    // ── events ─────────────────────────────────────────────────────────

    /// Take an event from `device`'s pool, creating one if the pool is empty.
    pub fn acquire_event(&self, device: DeviceId) -> Result<Event> {
        self.check_open()?;
        if let Some(event) = self
            .event_pools
            .lock()
            .get_mut(&device)
            .and_then(|pool| pool.pop())
        {
            return Ok(event);
        }
        let handle = self.runtime.create_event(device)?;
        self.counters.events.fetch_add(1, Ordering::Relaxed);
        Ok(Event { handle, device })
    }

    /// Return an event to the pool of the device it was created on.
    pub fn release_event(&self, event: Event) {
        self.event_pools
            .lock()
            .entry(event.device)
            .or_default()
            .push(event);
    }

    // ── scratch ────────────────────────────────────────────────────────

    /// Scratch triple for `context`, allocated on `device` on first use.
    pub fn scratch(&self, context: ContextId, device: DeviceId) -> Result<ScratchTriple> {
        self.check_open()?;
        if let Some(s) = self.scratch.get(&context) {
            return Self::scratch_on(*s, context, device);
        }

        let _guard = self.scratch_insert.lock();
        if let Some(s) = self.scratch.get(&context) {
            return Self::scratch_on(*s, context, device);
        }
        let bytes = std::mem::size_of::<f64>();
        let mut ptrs = Vec::with_capacity(3);
        for _ in 0..3 {
            match self.runtime.alloc(device, bytes) {
                Ok(ptr) => ptrs.push(ptr),
                Err(e) => {
                    for ptr in ptrs {
                        if let Err(free) = unsafe { self.runtime.free(device, ptr) } {
                            tracing::warn!(device, error = %free, "failed to free partial scratch");
                        }
                    }
                    return Err(e);
                }
            }
        }
        let triple = ScratchTriple {
            device,
            norm_a: ptrs[0],
            norm_b: ptrs[1],
            dot: ptrs[2],
        };
        self.scratch.insert(context, triple);
        self.counters.scratch.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%context, device, "allocated scratch triple");
        Ok(triple)
    }

    fn scratch_on(
        s: ScratchTriple,
        context: ContextId,
        device: DeviceId,
    ) -> Result<ScratchTriple> {
        if s.device != device {
            return Err(AdasumError::device(
                "scratch",
                device,
                format!("{context} owns scratch on device {}", s.device),
            ));
        }
        Ok(s)
    }

    // ── device collectives ─────────────────────────────────────────────

    /// Device-collective communicator for the node-local group `devices`
    /// (indexed by local rank), bootstrapped on first use.
    ///
    /// Bootstrap is collective: every local rank must call this for the same
    /// key, and every global rank must reach it since it ends with a global
    /// barrier.
    pub fn collective(
        &self,
        stream_set: StreamSet,
        devices: &[DeviceId],
        controller: &dyn Controller,
    ) -> Result<CollectiveComm> {
        self.check_open()?;
        let key: CollectiveKey = (stream_set, devices.to_vec());
        if let Some(c) = self.collectives.get(&key) {
            return Ok(*c);
        }

        let _guard = self.collective_insert.lock();
        if let Some(c) = self.collectives.get(&key) {
            return Ok(*c);
        }
        let comm = self.bootstrap_collective(devices, controller).inspect_err(|e| {
            tracing::error!(
                rank = controller.rank(),
                stream_set,
                error = %e,
                "device collective bootstrap failed"
            );
        })?;
        self.collectives.insert(key, comm);
        self.counters.collectives.fetch_add(1, Ordering::Relaxed);
        Ok(comm)
    }

    fn bootstrap_collective(
        &self,
        devices: &[DeviceId],
        controller: &dyn Controller,
    ) -> Result<CollectiveComm> {
        let local_rank = controller.local_rank();
        let nranks = controller.local_size();
        let device = *devices
            .get(local_rank as usize)
            .ok_or(AdasumError::InvalidRank {
                rank: local_rank,
                size: devices.len() as u32,
            })?;

        let mut id = if local_rank == 0 {
            self.runtime.collective_unique_id()?
        } else {
            CollectiveId([0u8; crate::device::COLLECTIVE_ID_BYTES])
        };
        controller.broadcast(&mut id.0, 0, Scope::Local)?;

        let handle = self.runtime.collective_init(&id, nranks, local_rank, device)?;
        controller.barrier(Scope::Global)?;

        tracing::info!(
            rank = controller.rank(),
            local_rank,
            nranks,
            device,
            "device collective communicator ready"
        );
        Ok(CollectiveComm {
            handle,
            rank: local_rank,
            nranks,
            device,
        })
    }

    // ── lifecycle ──────────────────────────────────────────────────────

    /// Release every resource. Idempotent; the first error is returned after
    /// all releases have been attempted.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_err: Option<AdasumError> = None;
        let mut note = |r: Result<()>| {
            if let Err(e) = r {
                tracing::warn!(error = %e, "resource release failed");
                first_err.get_or_insert(e);
            }
        };

        let collectives: Vec<CollectiveComm> = self.collectives.iter().map(|c| *c).collect();
        self.collectives.clear();
        for c in collectives {
            note(self.runtime.collective_destroy(c.handle));
        }

        let pools = std::mem::take(&mut *self.event_pools.lock());
        for event in pools.into_values().flatten() {
            note(self.runtime.destroy_event(event.device, event.handle));
        }

        let scratch: Vec<ScratchTriple> = self.scratch.iter().map(|s| *s).collect();
        self.scratch.clear();
        for s in scratch {
            for ptr in [s.norm_a, s.norm_b, s.dot] {
                note(unsafe { self.runtime.free(s.device, ptr) });
            }
        }

        self.temp_buffers.drain();

        let streams: Vec<((StreamSet, DeviceId), StreamHandle)> =
            self.streams.iter().map(|e| (*e.key(), *e.value())).collect();
        self.streams.clear();
        for ((_, device), stream) in streams {
            note(self.runtime.destroy_stream(device, stream));
        }

        tracing::debug!("resource manager closed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "resource manager close failed on drop");
        }
    }
}
