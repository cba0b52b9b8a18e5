//! Point-to-point channel used by the tree and ring engines.
//!
//! The engines only ever talk to peers through [`Communicator`]; how bytes
//! move (in-process channels, MPI, sockets) is the implementation's concern.

pub mod controller;
pub mod mesh;

use std::sync::Arc;

use crate::error::{AdasumError, Result};
use crate::types::{DataType, Rank, Tag};

pub use controller::{Controller, MeshController, Scope};
pub use mesh::MeshComm;

/// Tags at or above this value are reserved for controller traffic.
pub const RESERVED_TAG_BASE: Tag = 0xADA5_0000;

/// Blocking point-to-point communicator over a fixed group of ranks.
///
/// Messages are FIFO per `(src, dst, tag)`. Every call blocks until the local
/// side of the transfer is complete: for `send` that means the payload has
/// left `buf`, for `recv` that the whole message is in `buf`.
pub trait Communicator: Send + Sync {
    /// This endpoint's rank within the group (0-indexed).
    fn rank(&self) -> Rank;

    /// Number of ranks in the group.
    fn size(&self) -> u32;

    /// Send `count` elements of `dtype` from `buf` to `dest`.
    fn send(&self, buf: &[u8], count: usize, dtype: DataType, dest: Rank, tag: Tag) -> Result<()>;

    /// Receive exactly `count` elements of `dtype` from `src` into `buf`.
    fn recv(
        &self,
        buf: &mut [u8],
        count: usize,
        dtype: DataType,
        src: Rank,
        tag: Tag,
    ) -> Result<()>;

    /// Send to `dest` and receive from `src` as one step.
    ///
    /// The default runs `send` then `recv`, which is deadlock-free only when
    /// `send` does not wait for the matching `recv`. Transports with
    /// rendezvous sends must override it.
    #[allow(clippy::too_many_arguments)]
    fn send_recv(
        &self,
        send_buf: &[u8],
        send_count: usize,
        dest: Rank,
        recv_buf: &mut [u8],
        recv_count: usize,
        src: Rank,
        dtype: DataType,
        tag: Tag,
    ) -> Result<()> {
        self.send(send_buf, send_count, dtype, dest, tag)?;
        self.recv(recv_buf, recv_count, dtype, src, tag)
    }
}

/// The communicators a rank participates in.
#[derive(Clone)]
pub struct NodeComms {
    /// Every rank in the job.
    pub global: Arc<dyn Communicator>,
    /// Ranks on this rank's node, ordered by local rank.
    pub local: Arc<dyn Communicator>,
    /// Node roots only, one per node. `None` on non-root ranks.
    pub cross: Option<Arc<dyn Communicator>>,
}

impl NodeComms {
    /// True if this rank is its node's root.
    pub fn is_node_root(&self) -> bool {
        self.local.rank() == 0
    }

    /// Cross-node communicator, if this rank holds one with at least one peer.
    pub fn inter_node(&self) -> Option<&Arc<dyn Communicator>> {
        self.cross.as_ref().filter(|c| c.size() > 1)
    }
}

/// Byte length of `count` elements, checked against a buffer.
pub(crate) fn checked_len(buf_len: usize, count: usize, dtype: DataType) -> Result<usize> {
    let expected = count * dtype.size_in_bytes();
    if buf_len < expected {
        return Err(AdasumError::BufferSizeMismatch {
            expected,
            actual: buf_len,
        });
    }
    Ok(expected)
}

pub(crate) fn check_peer(peer: Rank, size: u32) -> Result<()> {
    if peer >= size {
        return Err(AdasumError::InvalidRank { rank: peer, size });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_len() {
        assert_eq!(checked_len(16, 4, DataType::F32).unwrap(), 16);
        assert_eq!(checked_len(20, 4, DataType::F32).unwrap(), 16);
        assert!(matches!(
            checked_len(8, 4, DataType::F32),
            Err(AdasumError::BufferSizeMismatch {
                expected: 16,
                actual: 8
            })
        ));
    }

    #[test]
    fn test_check_peer() {
        assert!(check_peer(3, 4).is_ok());
        assert!(matches!(
            check_peer(4, 4),
            Err(AdasumError::InvalidRank { rank: 4, size: 4 })
        ));
    }
}
