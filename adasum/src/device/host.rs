use std::alloc::Layout;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::device::{
    COLLECTIVE_ID_BYTES, CollectiveHandle, CollectiveId, DeviceRuntime, EventHandle,
    ScratchTriple, StreamHandle,
};
use crate::error::{AdasumError, Result};
use crate::kernels;
use crate::types::{DataType, DeviceId, Rank};

const ALLOC_ALIGN: usize = 16;

/// Members of one device-collective group rendezvous here.
struct HostCollectiveGroup {
    nranks: u32,
    barrier: Barrier,
    /// Buffer address published by each member for the current call.
    slots: Mutex<Vec<u64>>,
}

impl HostCollectiveGroup {
    fn new(nranks: u32) -> Self {
        Self {
            nranks,
            barrier: Barrier::new(nranks as usize),
            slots: Mutex::new(vec![0; nranks as usize]),
        }
    }

    /// Publish `ptr`, wait for every member, run `f` with all addresses, and
    /// wait again so no member reuses its buffer while a peer still reads it.
    fn exchange<F>(&self, rank: Rank, ptr: u64, f: F) -> Result<()>
    where
        F: FnOnce(&[u64]) -> Result<()>,
    {
        self.slots.lock()[rank as usize] = ptr;
        self.barrier.wait();
        let slots = self.slots.lock().clone();
        let result = f(&slots);
        self.barrier.wait();
        result
    }
}

struct HostCollectiveMember {
    group: Arc<HostCollectiveGroup>,
    rank: Rank,
    device: DeviceId,
}

/// [`DeviceRuntime`] where "device" memory is host memory.
///
/// Stream work runs eagerly on the calling thread, so synchronisation is a
/// validity check only. Device collectives rendezvous between the threads of
/// one process: every rank of a local cluster must share the same
/// `HostRuntime`.
pub struct HostRuntime {
    next_handle: AtomicU64,
    streams: DashMap<u64, DeviceId>,
    events: DashMap<u64, DeviceId>,
    /// Recorded events nobody has waited on yet, with their stream and
    /// record order.
    unwaited: DashMap<u64, (u64, u64)>,
    allocations: DashMap<u64, (DeviceId, Layout)>,
    allocated_bytes: AtomicUsize,
    /// Device memory limit shared by all devices, if any.
    capacity: Option<usize>,
    groups: Mutex<HashMap<CollectiveId, Arc<HostCollectiveGroup>>>,
    members: DashMap<u64, HostCollectiveMember>,
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            streams: DashMap::new(),
            events: DashMap::new(),
            unwaited: DashMap::new(),
            allocations: DashMap::new(),
            allocated_bytes: AtomicUsize::new(0),
            capacity: None,
            groups: Mutex::new(HashMap::new()),
            members: DashMap::new(),
        }
    }
}

impl HostRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runtime whose allocations fail once `bytes` are live.
    pub fn with_capacity(bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: Some(bytes),
            ..Self::default()
        })
    }

    /// Streams created and not yet destroyed.
    pub fn live_streams(&self) -> usize {
        self.streams.len()
    }

    /// Events created and not yet destroyed.
    pub fn live_events(&self) -> usize {
        self.events.len()
    }

    /// Allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    /// Events recorded on a stream that were never waited on: not directly,
    /// not through a later event on the same stream, and not by
    /// synchronising the stream. Destroying an event does not count as
    /// waiting.
    pub fn unwaited_events(&self) -> usize {
        self.unwaited.len()
    }

    fn next(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn check_device(call: &'static str, device: DeviceId) -> Result<()> {
        if device < 0 {
            return Err(AdasumError::device(call, device, "not a device ordinal"));
        }
        Ok(())
    }

    fn check_stream(
        &self,
        call: &'static str,
        device: DeviceId,
        stream: StreamHandle,
    ) -> Result<()> {
        match self.streams.get(&stream.0) {
            Some(owner) if *owner == device => Ok(()),
            Some(owner) => Err(AdasumError::device(
                call,
                device,
                format!("stream {} belongs to device {}", stream.0, *owner),
            )),
            None => Err(AdasumError::device(
                call,
                device,
                format!("unknown stream {}", stream.0),
            )),
        }
    }

    fn check_event(
        &self,
        call: &'static str,
        device: DeviceId,
        event: EventHandle,
    ) -> Result<()> {
        match self.events.get(&event.0) {
            Some(owner) if *owner == device => Ok(()),
            Some(owner) => Err(AdasumError::device(
                call,
                device,
                format!("event {} belongs to device {}", event.0, *owner),
            )),
            None => Err(AdasumError::device(
                call,
                device,
                format!("unknown event {}", event.0),
            )),
        }
    }

    fn member(
        &self,
        call: &'static str,
        comm: CollectiveHandle,
    ) -> Result<(Arc<HostCollectiveGroup>, Rank, DeviceId)> {
        let m = self
            .members
            .get(&comm.0)
            .ok_or_else(|| AdasumError::DeviceCollective {
                call,
                message: format!("unknown communicator {}", comm.0),
            })?;
        Ok((m.group.clone(), m.rank, m.device))
    }

    unsafe fn copy(&self, dst: u64, src: u64, bytes: usize) {
        if bytes > 0 && dst != src {
            unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, bytes) };
        }
    }
}

impl DeviceRuntime for HostRuntime {
    fn name(&self) -> &'static str {
        "host"
    }

    fn greatest_stream_priority(&self, device: DeviceId) -> Result<i32> {
        Self::check_device("stream_priority_range", device)?;
        // Same convention as CUDA: lower numbers are higher priority.
        Ok(-1)
    }

    fn create_stream(&self, device: DeviceId, _priority: i32) -> Result<StreamHandle> {
        Self::check_device("stream_create", device)?;
        let id = self.next();
        self.streams.insert(id, device);
        Ok(StreamHandle(id))
    }

    fn synchronize_stream(&self, device: DeviceId, stream: StreamHandle) -> Result<()> {
        self.check_stream("stream_synchronize", device, stream)?;
        self.unwaited.retain(|_, (s, _)| *s != stream.0);
        Ok(())
    }

    fn destroy_stream(&self, device: DeviceId, stream: StreamHandle) -> Result<()> {
        self.check_stream("stream_destroy", device, stream)?;
        self.streams.remove(&stream.0);
        Ok(())
    }

    fn create_event(&self, device: DeviceId) -> Result<EventHandle> {
        Self::check_device("event_create", device)?;
        let id = self.next();
        self.events.insert(id, device);
        Ok(EventHandle(id))
    }

    fn record_event(
        &self,
        device: DeviceId,
        event: EventHandle,
        stream: StreamHandle,
    ) -> Result<()> {
        self.check_event("event_record", device, event)?;
        self.check_stream("event_record", device, stream)?;
        self.unwaited.insert(event.0, (stream.0, self.next()));
        Ok(())
    }

    fn synchronize_event(&self, device: DeviceId, event: EventHandle) -> Result<()> {
        self.check_event("event_synchronize", device, event)?;
        // Stream order: earlier events on the same stream are complete too.
        if let Some((_, (stream, seq))) = self.unwaited.remove(&event.0) {
            self.unwaited.retain(|_, (s, n)| !(*s == stream && *n < seq));
        }
        Ok(())
    }

    fn destroy_event(&self, device: DeviceId, event: EventHandle) -> Result<()> {
        self.check_event("event_destroy", device, event)?;
        self.events.remove(&event.0);
        Ok(())
    }

    fn alloc(&self, device: DeviceId, bytes: usize) -> Result<u64> {
        Self::check_device("malloc", device)?;
        let layout = Layout::from_size_align(bytes.max(1), ALLOC_ALIGN)
            .map_err(|e| AdasumError::device_with_source("malloc", device, e))?;
        let live = self.allocated_bytes.fetch_add(layout.size(), Ordering::Relaxed);
        if self.capacity.is_some_and(|cap| live + layout.size() > cap) {
            self.allocated_bytes.fetch_sub(layout.size(), Ordering::Relaxed);
            return Err(AdasumError::device(
                "malloc",
                device,
                format!("out of memory allocating {bytes} bytes"),
            ));
        }
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            self.allocated_bytes.fetch_sub(layout.size(), Ordering::Relaxed);
            return Err(AdasumError::device(
                "malloc",
                device,
                format!("out of memory allocating {bytes} bytes"),
            ));
        }
        self.allocations.insert(ptr as u64, (device, layout));
        Ok(ptr as u64)
    }

    unsafe fn free(&self, device: DeviceId, ptr: u64) -> Result<()> {
        let Some((_, (owner, layout))) = self.allocations.remove(&ptr) else {
            return Err(AdasumError::device(
                "free",
                device,
                format!("{ptr:#x} was not allocated by this runtime"),
            ));
        };
        if owner != device {
            self.allocations.insert(ptr, (owner, layout));
            return Err(AdasumError::device(
                "free",
                device,
                format!("{ptr:#x} belongs to device {owner}"),
            ));
        }
        unsafe { std::alloc::dealloc(ptr as *mut u8, layout) };
        self.allocated_bytes.fetch_sub(layout.size(), Ordering::Relaxed);
        Ok(())
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        device: DeviceId,
        dst: u64,
        src: u64,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<()> {
        self.check_stream("memcpy_dtoh", device, stream)?;
        unsafe { self.copy(dst, src, bytes) };
        Ok(())
    }

    unsafe fn memcpy_htod_async(
        &self,
        device: DeviceId,
        dst: u64,
        src: u64,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<()> {
        self.check_stream("memcpy_htod", device, stream)?;
        unsafe { self.copy(dst, src, bytes) };
        Ok(())
    }

    unsafe fn memcpy_dtod_async(
        &self,
        device: DeviceId,
        dst: u64,
        src: u64,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<()> {
        self.check_stream("memcpy_dtod", device, stream)?;
        unsafe { self.copy(dst, src, bytes) };
        Ok(())
    }

    unsafe fn dot_and_norms(
        &self,
        device: DeviceId,
        a: u64,
        b: u64,
        count: usize,
        dtype: DataType,
        scratch: &ScratchTriple,
        stream: StreamHandle,
    ) -> Result<()> {
        self.check_stream("dot_and_norms", device, stream)?;
        let stats = unsafe { kernels::reduce_stats_ptr(a, b, count, dtype)? };
        unsafe {
            (scratch.dot as *mut f64).write_unaligned(stats.dot);
            (scratch.norm_a as *mut f64).write_unaligned(stats.norm_a);
            (scratch.norm_b as *mut f64).write_unaligned(stats.norm_b);
        }
        Ok(())
    }

    unsafe fn scaled_add(
        &self,
        device: DeviceId,
        a: u64,
        b: u64,
        count: usize,
        dtype: DataType,
        scratch: &ScratchTriple,
        stream: StreamHandle,
    ) -> Result<()> {
        self.check_stream("scaled_add", device, stream)?;
        let (dot, norm_b) = unsafe {
            (
                (scratch.dot as *const f64).read_unaligned(),
                (scratch.norm_b as *const f64).read_unaligned(),
            )
        };
        let coeff = kernels::adasum_coefficient(dot, norm_b);
        unsafe { kernels::combine_ptr(count, coeff, b, a, dtype) }
    }

    fn collective_unique_id(&self) -> Result<CollectiveId> {
        let mut id = [0u8; COLLECTIVE_ID_BYTES];
        id[..8].copy_from_slice(&self.next().to_le_bytes());
        id[8..16].copy_from_slice(&(self as *const Self as u64).to_le_bytes());
        Ok(CollectiveId(id))
    }

    fn collective_init(
        &self,
        id: &CollectiveId,
        nranks: u32,
        rank: Rank,
        device: DeviceId,
    ) -> Result<CollectiveHandle> {
        Self::check_device("comm_init_rank", device)?;
        if rank >= nranks {
            return Err(AdasumError::DeviceCollective {
                call: "comm_init_rank",
                message: format!("rank {rank} out of range for {nranks} ranks"),
            });
        }
        let group = {
            let mut groups = self.groups.lock();
            let group = groups
                .entry(*id)
                .or_insert_with(|| Arc::new(HostCollectiveGroup::new(nranks)))
                .clone();
            if group.nranks != nranks {
                return Err(AdasumError::DeviceCollective {
                    call: "comm_init_rank",
                    message: format!(
                        "group {id:?} has {} ranks, joined with {nranks}",
                        group.nranks
                    ),
                });
            }
            group
        };

        let handle = self.next();
        self.members.insert(
            handle,
            HostCollectiveMember {
                group: group.clone(),
                rank,
                device,
            },
        );
        // Initialisation is collective.
        group.barrier.wait();
        Ok(CollectiveHandle(handle))
    }

    unsafe fn collective_reduce_sum(
        &self,
        comm: CollectiveHandle,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
        root: Rank,
        stream: StreamHandle,
    ) -> Result<()> {
        let (group, rank, device) = self.member("reduce", comm)?;
        self.check_stream("reduce", device, stream)?;
        let bytes = count * dtype.size_in_bytes();
        group.exchange(rank, send, |sends| {
            if rank != root {
                return Ok(());
            }
            unsafe { self.copy(recv, send, bytes) };
            let dst = unsafe { std::slice::from_raw_parts_mut(recv as *mut u8, bytes) };
            for (peer, &src) in sends.iter().enumerate() {
                if peer as Rank != root {
                    let src = unsafe { std::slice::from_raw_parts(src as *const u8, bytes) };
                    kernels::sum_into(dst, src, count, dtype)?;
                }
            }
            Ok(())
        })
    }

    unsafe fn collective_broadcast(
        &self,
        comm: CollectiveHandle,
        buf: u64,
        count: usize,
        dtype: DataType,
        root: Rank,
        stream: StreamHandle,
    ) -> Result<()> {
        let (group, rank, device) = self.member("broadcast", comm)?;
        self.check_stream("broadcast", device, stream)?;
        let bytes = count * dtype.size_in_bytes();
        group.exchange(rank, buf, |bufs| {
            if rank != root {
                unsafe { self.copy(buf, bufs[root as usize], bytes) };
            }
            Ok(())
        })
    }

    fn collective_destroy(&self, comm: CollectiveHandle) -> Result<()> {
        self.members
            .remove(&comm.0)
            .map(|_| ())
            .ok_or_else(|| AdasumError::DeviceCollective {
                call: "comm_destroy",
                message: format!("unknown communicator {}", comm.0),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_and_event_belong_to_device() {
        let rt = HostRuntime::new();
        let s0 = rt.create_stream(0, -1).unwrap();
        let e1 = rt.create_event(1).unwrap();
        assert!(rt.synchronize_stream(0, s0).is_ok());
        assert!(rt.synchronize_stream(1, s0).is_err());
        assert!(rt.record_event(1, e1, s0).is_err());
        assert!(rt.create_stream(-1, 0).is_err());

        rt.destroy_stream(0, s0).unwrap();
        rt.destroy_event(1, e1).unwrap();
        assert_eq!(rt.live_streams(), 0);
        assert_eq!(rt.live_events(), 0);
    }

    #[test]
    fn test_alloc_free() {
        let rt = HostRuntime::new();
        let p = rt.alloc(0, 64).unwrap();
        assert_eq!(rt.live_allocations(), 1);
        assert!(unsafe { rt.free(1, p) }.is_err());
        unsafe { rt.free(0, p).unwrap() };
        assert_eq!(rt.live_allocations(), 0);
        assert!(unsafe { rt.free(0, p) }.is_err());
    }

    #[test]
    fn test_capacity_limits_live_bytes() {
        let rt = HostRuntime::with_capacity(16);
        let a = rt.alloc(0, 8).unwrap();
        let b = rt.alloc(1, 8).unwrap();
        assert!(rt.alloc(0, 1).is_err());
        assert_eq!(rt.live_allocations(), 2);
        unsafe { rt.free(0, a).unwrap() };
        let c = rt.alloc(0, 8).unwrap();
        unsafe {
            rt.free(1, b).unwrap();
            rt.free(0, c).unwrap();
        }
    }

    #[test]
    fn test_unwaited_events() {
        let rt = HostRuntime::new();
        let s = rt.create_stream(0, -1).unwrap();
        let (e1, e2) = (rt.create_event(0).unwrap(), rt.create_event(0).unwrap());
        rt.record_event(0, e1, s).unwrap();
        rt.record_event(0, e2, s).unwrap();
        assert_eq!(rt.unwaited_events(), 2);

        rt.synchronize_event(0, e1).unwrap();
        assert_eq!(rt.unwaited_events(), 1);
        rt.synchronize_stream(0, s).unwrap();
        assert_eq!(rt.unwaited_events(), 0);

        // Waiting on the later event covers the earlier one.
        rt.record_event(0, e1, s).unwrap();
        rt.record_event(0, e2, s).unwrap();
        rt.synchronize_event(0, e2).unwrap();
        assert_eq!(rt.unwaited_events(), 0);

        rt.record_event(0, e1, s).unwrap();
        rt.destroy_event(0, e1).unwrap();
        assert_eq!(rt.unwaited_events(), 1);
    }

    #[test]
    fn test_dot_norms_then_scaled_add() {
        let rt = HostRuntime::new();
        let s = rt.create_stream(0, -1).unwrap();
        let scratch = ScratchTriple {
            device: 0,
            norm_a: rt.alloc(0, 8).unwrap(),
            norm_b: rt.alloc(0, 8).unwrap(),
            dot: rt.alloc(0, 8).unwrap(),
        };
        let mut a = [2.0f32, 2.0];
        let b = [2.0f32, 2.0];
        let (pa, pb) = (a.as_mut_ptr() as u64, b.as_ptr() as u64);
        unsafe {
            rt.dot_and_norms(0, pa, pb, 2, DataType::F32, &scratch, s).unwrap();
            assert_eq!((scratch.dot as *const f64).read_unaligned(), 8.0);
            assert_eq!((scratch.norm_a as *const f64).read_unaligned(), 8.0);
            rt.scaled_add(0, pa, pb, 2, DataType::F32, &scratch, s).unwrap();
        }
        // Identical inputs: coefficient 0, `a` unchanged.
        assert_eq!(a, [2.0, 2.0]);
    }

    #[test]
    fn test_collective_reduce_and_broadcast() {
        let rt = HostRuntime::new();
        let id = rt.collective_unique_id().unwrap();
        std::thread::scope(|s| {
            for rank in 0..3u32 {
                let rt = &rt;
                s.spawn(move || {
                    let device = rank as DeviceId;
                    let stream = rt.create_stream(device, -1).unwrap();
                    let comm = rt.collective_init(&id, 3, rank, device).unwrap();
                    let send = [rank as f32 + 1.0; 4];
                    let mut recv = [0.0f32; 4];
                    unsafe {
                        rt.collective_reduce_sum(
                            comm,
                            send.as_ptr() as u64,
                            recv.as_mut_ptr() as u64,
                            4,
                            DataType::F32,
                            0,
                            stream,
                        )
                        .unwrap();
                    }
                    if rank == 0 {
                        assert_eq!(recv, [6.0; 4]);
                    }
                    unsafe {
                        rt.collective_broadcast(
                            comm,
                            recv.as_mut_ptr() as u64,
                            4,
                            DataType::F32,
                            0,
                            stream,
                        )
                        .unwrap();
                    }
                    assert_eq!(recv, [6.0; 4]);
                    rt.collective_destroy(comm).unwrap();
                });
            }
        });
    }

    #[test]
    fn test_unique_ids_differ() {
        let rt = HostRuntime::new();
        assert_ne!(
            rt.collective_unique_id().unwrap(),
            rt.collective_unique_id().unwrap()
        );
    }
}
