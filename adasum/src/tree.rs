//! Binary-tree Adasum over a rotated rank ordering.
//!
//! Ranks are relabelled with `virtual = (rank + rotation) % size`. At reduce
//! level `l` (1, 2, 4, ...) a rank takes part only if `virtual % l == 0`; it
//! pairs with `virtual ^ l` and either receives and combines (bit `l` clear)
//! or sends and drops out (bit `l` set). The broadcast walks the same levels
//! in reverse with the data flowing the other way. Virtual rank 0 ends the
//! reduce holding the full result, so the rotation moves the root around.
//!
//! Every peer must derive the same rotation from the same tag or the
//! pairing falls apart; intra-node passes fix the rotation at 0 so local
//! rank 0 always owns the node result.

use crate::comm::{Communicator, checked_len};
use crate::error::Result;
use crate::kernels;
use crate::types::{DataType, Rank, Tag};

/// What a rank does at one level of a tree pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeRole {
    /// Receive from `peer` and fold it into the local buffer.
    Combine { peer: Rank },
    /// Send the local buffer to `peer`.
    Send { peer: Rank },
    /// Receive `peer`'s buffer, replacing the local one.
    Recv { peer: Rank },
    Idle,
}

/// Rank permutation and per-level roles for one tree pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeSchedule {
    size: u32,
    rotation: u32,
}

impl TreeSchedule {
    /// Schedule whose rotation is derived from a message tag.
    pub fn for_tag(size: u32, tag: Tag) -> Self {
        Self::with_rotation(size, tag % size.max(1))
    }

    /// Schedule with an explicit rotation.
    pub fn with_rotation(size: u32, rotation: u32) -> Self {
        let size = size.max(1);
        Self {
            size,
            rotation: rotation % size,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn rotation(&self) -> u32 {
        self.rotation
    }

    pub fn virtual_rank(&self, rank: Rank) -> u32 {
        (rank + self.rotation) % self.size
    }

    pub fn true_rank(&self, virtual_rank: u32) -> Rank {
        (virtual_rank + self.size - self.rotation) % self.size
    }

    /// True rank that holds the full result after the reduce phase.
    pub fn root(&self) -> Rank {
        self.true_rank(0)
    }

    /// Reduce levels in execution order: 1, 2, 4, ... below `size`.
    pub fn reduce_levels(&self) -> impl Iterator<Item = u32> + use<> {
        let size = self.size;
        std::iter::successors(Some(1u32), |&l| l.checked_mul(2)).take_while(move |&l| l < size)
    }

    /// Broadcast levels in execution order: highest power of two below
    /// `size` down to 1.
    pub fn broadcast_levels(&self) -> impl Iterator<Item = u32> + use<> {
        let top = if self.size > 1 {
            1u32 << (u32::BITS - 1 - (self.size - 1).leading_zeros())
        } else {
            0
        };
        std::iter::successors(Some(top), |&l| Some(l / 2)).take_while(|&l| l > 0)
    }

    /// Neighbour at `level`, or `None` if `rank` sits this level out.
    fn neighbour(&self, rank: Rank, level: u32) -> Option<(u32, Rank)> {
        let v = self.virtual_rank(rank);
        if v % level != 0 {
            return None;
        }
        let nv = v ^ level;
        if nv >= self.size {
            return None;
        }
        Some((v, self.true_rank(nv)))
    }

    pub fn reduce_role(&self, rank: Rank, level: u32) -> TreeRole {
        match self.neighbour(rank, level) {
            None => TreeRole::Idle,
            Some((v, peer)) if v & level == 0 => TreeRole::Combine { peer },
            Some((_, peer)) => TreeRole::Send { peer },
        }
    }

    pub fn broadcast_role(&self, rank: Rank, level: u32) -> TreeRole {
        match self.neighbour(rank, level) {
            None => TreeRole::Idle,
            Some((v, peer)) if v & level == 0 => TreeRole::Send { peer },
            Some((_, peer)) => TreeRole::Recv { peer },
        }
    }
}

/// One tree pass of `count` elements over `comm`.
pub struct TreePass<'a> {
    comm: &'a dyn Communicator,
    schedule: TreeSchedule,
    tag: Tag,
    count: usize,
    dtype: DataType,
}

impl<'a> TreePass<'a> {
    /// Pass rotated by `tag`.
    pub fn new(comm: &'a dyn Communicator, tag: Tag, count: usize, dtype: DataType) -> Self {
        Self {
            comm,
            schedule: TreeSchedule::for_tag(comm.size(), tag),
            tag,
            count,
            dtype,
        }
    }

    /// Override the rotation while keeping `tag` for message matching.
    pub fn with_rotation(mut self, rotation: u32) -> Self {
        self.schedule = TreeSchedule::with_rotation(self.comm.size(), rotation);
        self
    }

    pub fn schedule(&self) -> &TreeSchedule {
        &self.schedule
    }

    /// Reduce phase with a caller-supplied pairwise combine.
    ///
    /// `combine(local, received)` must leave the merged result in `local`.
    /// On return the root's `buf` holds the full result; other ranks' `buf`
    /// holds whatever they had when they sent.
    pub fn reduce_with<F>(&self, buf: &mut [u8], recv_buf: &mut [u8], mut combine: F) -> Result<()>
    where
        F: FnMut(&mut [u8], &[u8]) -> Result<()>,
    {
        let len = checked_len(buf.len(), self.count, self.dtype)?;
        checked_len(recv_buf.len(), self.count, self.dtype)?;
        let rank = self.comm.rank();

        for level in self.schedule.reduce_levels() {
            match self.schedule.reduce_role(rank, level) {
                TreeRole::Combine { peer } => {
                    self.comm
                        .recv(recv_buf, self.count, self.dtype, peer, self.tag)?;
                    combine(&mut buf[..len], &recv_buf[..len])?;
                }
                TreeRole::Send { peer } => {
                    self.comm.send(buf, self.count, self.dtype, peer, self.tag)?;
                }
                TreeRole::Recv { .. } | TreeRole::Idle => {}
            }
        }
        Ok(())
    }

    /// Reduce phase with the Adasum combine.
    pub fn reduce(&self, buf: &mut [u8], recv_buf: &mut [u8]) -> Result<()> {
        let (count, dtype) = (self.count, self.dtype);
        self.reduce_with(buf, recv_buf, |local, received| {
            kernels::pairwise_adasum(local, received, count, dtype).map(|_| ())
        })
    }

    /// Broadcast phase: fan the root's `buf` out to every rank.
    pub fn broadcast(&self, buf: &mut [u8]) -> Result<()> {
        checked_len(buf.len(), self.count, self.dtype)?;
        let rank = self.comm.rank();

        for level in self.schedule.broadcast_levels() {
            match self.schedule.broadcast_role(rank, level) {
                TreeRole::Send { peer } => {
                    self.comm.send(buf, self.count, self.dtype, peer, self.tag)?;
                }
                TreeRole::Recv { peer } => {
                    self.comm.recv(buf, self.count, self.dtype, peer, self.tag)?;
                }
                TreeRole::Combine { .. } | TreeRole::Idle => {}
            }
        }
        Ok(())
    }

    /// Reduce then broadcast with a caller-supplied combine.
    pub fn allreduce_with<F>(&self, buf: &mut [u8], recv_buf: &mut [u8], combine: F) -> Result<()>
    where
        F: FnMut(&mut [u8], &[u8]) -> Result<()>,
    {
        self.reduce_with(buf, recv_buf, combine)?;
        self.broadcast(buf)
    }

    /// Reduce then broadcast with the Adasum combine.
    pub fn allreduce(&self, buf: &mut [u8], recv_buf: &mut [u8]) -> Result<()> {
        self.reduce(buf, recv_buf)?;
        self.broadcast(buf)
    }
}

/// Adasum reduce phase rotated by `tag`.
pub fn tree_reduce(
    comm: &dyn Communicator,
    buf: &mut [u8],
    recv_buf: &mut [u8],
    count: usize,
    dtype: DataType,
    tag: Tag,
) -> Result<()> {
    TreePass::new(comm, tag, count, dtype).reduce(buf, recv_buf)
}

/// Broadcast phase rotated by `tag`; pairs with [`tree_reduce`] on the same tag.
pub fn tree_broadcast(
    comm: &dyn Communicator,
    buf: &mut [u8],
    count: usize,
    dtype: DataType,
    tag: Tag,
) -> Result<()> {
    TreePass::new(comm, tag, count, dtype).broadcast(buf)
}

/// Full Adasum allreduce: every rank ends with the identical buffer.
pub fn tree_allreduce(
    comm: &dyn Communicator,
    buf: &mut [u8],
    recv_buf: &mut [u8],
    count: usize,
    dtype: DataType,
    tag: Tag,
) -> Result<()> {
    tracing::trace!(rank = comm.rank(), size = comm.size(), tag, count, "tree allreduce");
    TreePass::new(comm, tag, count, dtype).allreduce(buf, recv_buf)
}
