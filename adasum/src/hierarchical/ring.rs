use crate::entry::Entry;
use crate::error::Result;
use crate::hierarchical::{BatchContext, IntraNodeStrategy, Staging};
use crate::resources::{FusionBufferManager, PooledFusionBuffer};
use crate::ring::{Ring, RingMessage};
use crate::types::Tag;

/// Ring reduce/broadcast between the node's devices.
///
/// The ring accumulates into each entry's input buffer. In-place entries
/// borrow a temporary fusion buffer as the receive target; the others use
/// their output buffer, which gets the final result by a device-to-device
/// copy at the end. Empty entries have nothing to receive and borrow no
/// buffer.
pub struct RingStrategy;

fn messages(entries: &[Entry], recv: impl Fn(usize, &Entry) -> u64) -> Vec<RingMessage> {
    entries
        .iter()
        .enumerate()
        .map(|(i, e)| RingMessage {
            buffer: e.input,
            recv: recv(i, e),
            count: e.count,
            dtype: e.dtype,
            device: e.device,
            context: e.context,
            tag: i as Tag,
        })
        .collect()
}

impl IntraNodeStrategy for RingStrategy {
    fn name(&self) -> &'static str {
        "gpu_ring"
    }

    fn reduce_local(
        &self,
        cx: &BatchContext,
        entries: &[Entry],
        staging: &mut Staging,
    ) -> Result<()> {
        let pool = cx.resources.temp_buffers();
        let mut borrowed: Vec<PooledFusionBuffer<'_>> = Vec::new();
        let mut recv = Vec::with_capacity(entries.len());
        for e in entries {
            if e.aliased() && e.size_bytes > 0 {
                let buf = pool.acquire(e.size_bytes, e.device, e.context, cx.stream_set)?;
                recv.push(buf.buffer(e.device, cx.stream_set)?.ptr);
                borrowed.push(buf);
            } else {
                recv.push(e.output);
            }
        }

        let msgs = messages(entries, |i, _| recv[i]);
        Ring::new(cx.comms.local.as_ref(), cx.resources, cx.stream_set).reduce(&msgs)?;
        drop(borrowed);

        if cx.crosses_nodes() {
            for (i, entry) in entries.iter().enumerate() {
                staging.stage(cx, i, entry, entry.input)?;
            }
        }
        Ok(())
    }

    fn broadcast_local(
        &self,
        cx: &BatchContext,
        entries: &[Entry],
        staging: &mut Staging,
    ) -> Result<()> {
        if cx.crosses_nodes() {
            for (i, entry) in entries.iter().enumerate() {
                staging.unstage(cx, i, entry, entry.input)?;
            }
            staging.settle(cx.resources)?;
        }

        let msgs = messages(entries, |_, e| e.output);
        Ring::new(cx.comms.local.as_ref(), cx.resources, cx.stream_set).broadcast(&msgs)?;

        let rt = cx.resources.runtime();
        for (i, entry) in entries.iter().enumerate().filter(|(_, e)| !e.aliased()) {
            let stream = cx.resources.stream(cx.stream_set, entry.device)?;
            unsafe {
                rt.memcpy_dtod_async(
                    entry.device,
                    entry.output,
                    entry.input,
                    entry.size_bytes,
                    stream,
                )?;
            }
            staging.track(cx, i, entry.device, stream)?;
        }
        staging.settle(cx.resources)
    }
}
