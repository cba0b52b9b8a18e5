//! Ring reduce and broadcast between the devices of one node.
//!
//! The reduce runs as a chain from the last local rank down to rank 0: each
//! rank receives its successor's partial result, folds it into its own
//! buffer with the device-side Adasum combine, and passes the result on. The
//! broadcast walks the ring the other way. Messages for different buffers
//! are independent and matched by tag, so a rank streams through its whole
//! batch without waiting on the rest of the ring.
//!
//! Device buffers are staged through host memory around each transfer, since
//! the communicator moves host bytes.

use crate::comm::Communicator;
use crate::device::DeviceRuntime;
use crate::error::Result;
use crate::resources::ResourceManager;
use crate::types::{ContextId, DataType, DeviceId, StreamSet, Tag};

/// One buffer travelling around the ring.
#[derive(Debug, Clone, Copy)]
pub struct RingMessage {
    /// Device buffer holding this rank's contribution, and the result.
    pub buffer: u64,
    /// Device buffer the predecessor's data lands in before combining.
    /// Unused by the broadcast.
    pub recv: u64,
    pub count: usize,
    pub dtype: DataType,
    pub device: DeviceId,
    pub context: ContextId,
    pub tag: Tag,
}

impl RingMessage {
    fn bytes(&self) -> usize {
        self.count * self.dtype.size_in_bytes()
    }
}

/// Ring over a node-local communicator.
pub struct Ring<'a> {
    comm: &'a dyn Communicator,
    resources: &'a ResourceManager,
    stream_set: StreamSet,
}

impl<'a> Ring<'a> {
    pub fn new(
        comm: &'a dyn Communicator,
        resources: &'a ResourceManager,
        stream_set: StreamSet,
    ) -> Self {
        Self {
            comm,
            resources,
            stream_set,
        }
    }

    fn runtime(&self) -> &dyn DeviceRuntime {
        self.resources.runtime().as_ref()
    }

    /// Chain-reduce every message so local rank 0's `buffer` holds the
    /// node result.
    pub fn reduce(&self, messages: &[RingMessage]) -> Result<()> {
        let (rank, size) = (self.comm.rank(), self.comm.size());
        if size <= 1 {
            return Ok(());
        }
        let rt = self.runtime();

        for msg in messages {
            let stream = self.resources.stream(self.stream_set, msg.device)?;
            let mut host = vec![0u8; msg.bytes()];

            if rank + 1 < size {
                self.comm
                    .recv(&mut host, msg.count, msg.dtype, rank + 1, msg.tag)?;
                let scratch = self.resources.scratch(msg.context, msg.device)?;
                unsafe {
                    rt.memcpy_htod_async(
                        msg.device,
                        msg.recv,
                        host.as_ptr() as u64,
                        host.len(),
                        stream,
                    )?;
                    rt.dot_and_norms(
                        msg.device, msg.buffer, msg.recv, msg.count, msg.dtype, &scratch, stream,
                    )?;
                    rt.scaled_add(
                        msg.device, msg.buffer, msg.recv, msg.count, msg.dtype, &scratch, stream,
                    )?;
                }
            }

            if rank > 0 {
                unsafe {
                    rt.memcpy_dtoh_async(
                        msg.device,
                        host.as_mut_ptr() as u64,
                        msg.buffer,
                        host.len(),
                        stream,
                    )?;
                }
                rt.synchronize_stream(msg.device, stream)?;
                self.comm
                    .send(&host, msg.count, msg.dtype, rank - 1, msg.tag)?;
            } else {
                rt.synchronize_stream(msg.device, stream)?;
            }
        }
        Ok(())
    }

    /// Fan local rank 0's `buffer` out to every rank's `buffer`.
    pub fn broadcast(&self, messages: &[RingMessage]) -> Result<()> {
        let (rank, size) = (self.comm.rank(), self.comm.size());
        if size <= 1 {
            return Ok(());
        }
        let rt = self.runtime();

        for msg in messages {
            let stream = self.resources.stream(self.stream_set, msg.device)?;
            let mut host = vec![0u8; msg.bytes()];

            if rank == 0 {
                unsafe {
                    rt.memcpy_dtoh_async(
                        msg.device,
                        host.as_mut_ptr() as u64,
                        msg.buffer,
                        host.len(),
                        stream,
                    )?;
                }
                rt.synchronize_stream(msg.device, stream)?;
            } else {
                self.comm
                    .recv(&mut host, msg.count, msg.dtype, rank - 1, msg.tag)?;
                unsafe {
                    rt.memcpy_htod_async(
                        msg.device,
                        msg.buffer,
                        host.as_ptr() as u64,
                        host.len(),
                        stream,
                    )?;
                }
            }

            if rank + 1 < size {
                self.comm
                    .send(&host, msg.count, msg.dtype, rank + 1, msg.tag)?;
            }
            rt.synchronize_stream(msg.device, stream)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::MeshComm;
    use crate::config::AdasumConfig;
    use crate::device::HostRuntime;
    use std::sync::Arc;
    use std::time::Duration;

    fn message(buffer: &mut [f32], recv: &mut [f32], tag: Tag) -> RingMessage {
        RingMessage {
            buffer: buffer.as_mut_ptr() as u64,
            recv: recv.as_mut_ptr() as u64,
            count: buffer.len(),
            dtype: DataType::F32,
            device: 0,
            context: ContextId(0),
            tag,
        }
    }

    #[test]
    fn test_single_rank_is_noop() {
        let comms = MeshComm::group(1, Duration::from_secs(5)).unwrap();
        let rt = HostRuntime::new();
        let res = ResourceManager::open(rt, &AdasumConfig::default());
        let mut buf = [1.0f32, 2.0];
        let mut recv = [0.0f32; 2];
        let ring = Ring::new(comms[0].as_ref(), &res, 0);
        ring.reduce(&[message(&mut buf, &mut recv, 0)]).unwrap();
        ring.broadcast(&[message(&mut buf, &mut recv, 0)]).unwrap();
        assert_eq!(buf, [1.0, 2.0]);
        assert_eq!(res.stats().streams_created, 0);
    }

    #[test]
    fn test_orthogonal_ring_sums() {
        // One-hot contributions are pairwise orthogonal, so every fold is a
        // plain sum and the chain order does not matter.
        let comms = MeshComm::group(3, Duration::from_secs(5)).unwrap();
        let rt: Arc<HostRuntime> = HostRuntime::new();
        std::thread::scope(|s| {
            for comm in &comms {
                let rt = rt.clone();
                s.spawn(move || {
                    let res = ResourceManager::open(rt, &AdasumConfig::default());
                    let rank = comm.rank() as usize;
                    let mut buf = [0.0f32; 3];
                    buf[rank] = (rank + 1) as f32;
                    let mut recv = [0.0f32; 3];
                    let ring = Ring::new(comm.as_ref(), &res, 0);
                    ring.reduce(&[message(&mut buf, &mut recv, 0)]).unwrap();
                    if rank == 0 {
                        assert_eq!(buf, [1.0, 2.0, 3.0]);
                    }
                    ring.broadcast(&[message(&mut buf, &mut recv, 0)]).unwrap();
                    assert_eq!(buf, [1.0, 2.0, 3.0]);
                });
            }
        });
    }
}
