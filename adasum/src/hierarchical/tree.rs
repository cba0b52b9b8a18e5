use crate::entry::Entry;
use crate::error::Result;
use crate::hierarchical::{BatchContext, IntraNodeStrategy, Staging};
use crate::tree::TreePass;
use crate::types::Tag;

/// Tree combine inside the node on host copies of every entry.
///
/// Every local rank stages its input to host; the node tree is rooted at
/// local rank 0 regardless of the entry tag.
pub struct TreeStrategy;

impl IntraNodeStrategy for TreeStrategy {
    fn name(&self) -> &'static str {
        "gpu_tree"
    }

    fn reduce_local(
        &self,
        cx: &BatchContext,
        entries: &[Entry],
        staging: &mut Staging,
    ) -> Result<()> {
        for (i, entry) in entries.iter().enumerate() {
            staging.stage(cx, i, entry, entry.input)?;
        }
        staging.settle(cx.resources)?;

        let local = cx.comms.local.as_ref();
        let mut recv = Vec::new();
        for (i, (host, entry)) in staging.host.iter_mut().zip(entries).enumerate() {
            recv.resize(entry.size_bytes, 0);
            TreePass::new(local, i as Tag, entry.count, entry.dtype)
                .with_rotation(0)
                .reduce(host, &mut recv)?;
        }
        Ok(())
    }

    fn broadcast_local(
        &self,
        cx: &BatchContext,
        entries: &[Entry],
        staging: &mut Staging,
    ) -> Result<()> {
        let local = cx.comms.local.as_ref();
        for (i, entry) in entries.iter().enumerate() {
            TreePass::new(local, i as Tag, entry.count, entry.dtype)
                .with_rotation(0)
                .broadcast(&mut staging.host[i])?;
            staging.unstage(cx, i, entry, entry.output)?;
        }
        staging.settle(cx.resources)
    }
}
