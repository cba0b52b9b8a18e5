use std::sync::Arc;

use crate::comm::{Communicator, RESERVED_TAG_BASE, check_peer};
use crate::error::Result;
use crate::types::{DataType, Rank, Tag};

const BROADCAST_TAG: Tag = RESERVED_TAG_BASE | 0x0001;
const BARRIER_ARRIVE_TAG: Tag = RESERVED_TAG_BASE | 0x0002;
const BARRIER_RELEASE_TAG: Tag = RESERVED_TAG_BASE | 0x0003;

/// Which group a controller call spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Every rank in the job.
    Global,
    /// Ranks on the caller's node.
    Local,
}

/// Process-group services the engine needs from its host framework.
pub trait Controller: Send + Sync {
    fn rank(&self) -> Rank;
    fn size(&self) -> u32;
    fn local_rank(&self) -> Rank;
    fn local_size(&self) -> u32;

    /// Global ranks on this node, indexed by local rank.
    fn local_comm_ranks(&self) -> &[Rank];

    /// Broadcast `buf` from `root` (a rank within `scope`) to every rank in `scope`.
    fn broadcast(&self, buf: &mut [u8], root: Rank, scope: Scope) -> Result<()>;

    /// Block until every rank in `scope` has entered the barrier.
    fn barrier(&self, scope: Scope) -> Result<()>;
}

/// [`Controller`] over a pair of communicators, using reserved tags so its
/// traffic never matches an entry's tree messages.
pub struct MeshController {
    global: Arc<dyn Communicator>,
    local: Arc<dyn Communicator>,
    local_comm_ranks: Vec<Rank>,
}

impl MeshController {
    pub fn new(
        global: Arc<dyn Communicator>,
        local: Arc<dyn Communicator>,
        local_comm_ranks: Vec<Rank>,
    ) -> Self {
        debug_assert_eq!(local_comm_ranks.len(), local.size() as usize);
        Self {
            global,
            local,
            local_comm_ranks,
        }
    }

    fn comm(&self, scope: Scope) -> &dyn Communicator {
        match scope {
            Scope::Global => self.global.as_ref(),
            Scope::Local => self.local.as_ref(),
        }
    }
}

impl Controller for MeshController {
    fn rank(&self) -> Rank {
        self.global.rank()
    }

    fn size(&self) -> u32 {
        self.global.size()
    }

    fn local_rank(&self) -> Rank {
        self.local.rank()
    }

    fn local_size(&self) -> u32 {
        self.local.size()
    }

    fn local_comm_ranks(&self) -> &[Rank] {
        &self.local_comm_ranks
    }

    fn broadcast(&self, buf: &mut [u8], root: Rank, scope: Scope) -> Result<()> {
        let comm = self.comm(scope);
        check_peer(root, comm.size())?;
        let len = buf.len();
        if comm.rank() == root {
            for peer in (0..comm.size()).filter(|&p| p != root) {
                comm.send(buf, len, DataType::U8, peer, BROADCAST_TAG)?;
            }
            Ok(())
        } else {
            comm.recv(buf, len, DataType::U8, root, BROADCAST_TAG)
        }
    }

    fn barrier(&self, scope: Scope) -> Result<()> {
        let comm = self.comm(scope);
        let mut token = [0u8; 1];
        if comm.rank() == 0 {
            for peer in 1..comm.size() {
                comm.recv(&mut token, 1, DataType::U8, peer, BARRIER_ARRIVE_TAG)?;
            }
            for peer in 1..comm.size() {
                comm.send(&token, 1, DataType::U8, peer, BARRIER_RELEASE_TAG)?;
            }
            Ok(())
        } else {
            comm.send(&token, 1, DataType::U8, 0, BARRIER_ARRIVE_TAG)?;
            comm.recv(&mut token, 1, DataType::U8, 0, BARRIER_RELEASE_TAG)
        }
    }
}
