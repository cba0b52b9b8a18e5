use crate::entry::Entry;
use crate::error::Result;
use crate::hierarchical::{BatchContext, IntraNodeStrategy, Staging};
use crate::resources::CollectiveComm;

/// Device-collective sum inside the node, Adasum across nodes.
///
/// The intra-node step sums (it is the device collective's native op), so
/// within a node this behaves like a plain allreduce; only the node results
/// are combined with Adasum.
pub struct CollectiveStrategy;

impl CollectiveStrategy {
    fn comm(cx: &BatchContext) -> Result<CollectiveComm> {
        let devices = cx.local_devices()?;
        cx.resources.collective(cx.stream_set, &devices, cx.controller)
    }
}

impl IntraNodeStrategy for CollectiveStrategy {
    fn name(&self) -> &'static str {
        "gpu_nccl_sum_ring"
    }

    fn reduce_local(
        &self,
        cx: &BatchContext,
        entries: &[Entry],
        staging: &mut Staging,
    ) -> Result<()> {
        let comm = Self::comm(cx)?;
        let rt = cx.resources.runtime();
        let stage = cx.crosses_nodes();

        for (i, entry) in entries.iter().enumerate() {
            let stream = cx.resources.stream(cx.stream_set, entry.device)?;
            unsafe {
                rt.collective_reduce_sum(
                    comm.handle,
                    entry.input,
                    entry.output,
                    entry.count,
                    entry.dtype,
                    0,
                    stream,
                )?;
            }
            if !stage {
                continue;
            }

            // Same stream as the reduce, so the copy sees its result.
            staging.stage(cx, i, entry, entry.output)?;
        }
        Ok(())
    }

    fn broadcast_local(
        &self,
        cx: &BatchContext,
        entries: &[Entry],
        staging: &mut Staging,
    ) -> Result<()> {
        let comm = Self::comm(cx)?;
        let rt = cx.resources.runtime();
        let stage = cx.crosses_nodes();

        for (i, entry) in entries.iter().enumerate() {
            let stream = cx.resources.stream(cx.stream_set, entry.device)?;
            if stage {
                staging.unstage(cx, i, entry, entry.output)?;
            }
            unsafe {
                rt.collective_broadcast(
                    comm.handle,
                    entry.output,
                    entry.count,
                    entry.dtype,
                    0,
                    stream,
                )?;
            }
            staging.track(cx, i, entry.device, stream)?;
        }

        // Host staging buffers must outlive the copies reading them.
        staging.settle(cx.resources)
    }
}
