use crate::comm::{Communicator, RESERVED_TAG_BASE};
use crate::error::{AdasumError, Result};
use crate::types::{DataType, Rank, Tag};

const HOSTNAME_GATHER_TAG: Tag = RESERVED_TAG_BASE | 0x0010;
const HOSTNAME_TABLE_TAG: Tag = RESERVED_TAG_BASE | 0x0011;

/// Max hostname buffer size (256 bytes, null-padded).
const HOSTNAME_BUF_SIZE: usize = 256;

/// Node layout of the job from one rank's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTopology {
    /// Hostname of this node.
    pub hostname: String,
    /// All global ranks on this node, sorted ascending.
    pub local_ranks: Vec<Rank>,
    /// This rank's index within `local_ranks`.
    pub local_rank_idx: usize,
    /// The lead rank for this node (lowest rank on the node).
    pub lead_rank: Rank,
    /// One lead rank per node, ordered by node index.
    pub inter_node_leads: Vec<Rank>,
    /// This node's index among all nodes.
    pub node_idx: usize,
    /// Total number of nodes.
    pub num_nodes: usize,
}

impl NodeTopology {
    /// Build the topology of `rank` from every rank's hostname.
    pub fn from_hostnames(rank: Rank, hostnames: &[String]) -> Result<Self> {
        let hostname = hostnames
            .get(rank as usize)
            .cloned()
            .ok_or(AdasumError::InvalidRank {
                rank,
                size: hostnames.len() as u32,
            })?;

        // Unique hostnames in order of first appearance.
        let hosts: indexmap::IndexSet<&str> = hostnames.iter().map(String::as_str).collect();
        let node_idx = hosts.get_index_of(hostname.as_str()).ok_or_else(|| {
            AdasumError::Config("own hostname not found in gathered data".into())
        })?;

        let ranks_on = |host: &str| -> Vec<Rank> {
            hostnames
                .iter()
                .enumerate()
                .filter(|(_, h)| h.as_str() == host)
                .map(|(r, _)| r as Rank)
                .collect()
        };

        // Enumeration order is ascending, so each list is already sorted.
        let local_ranks = ranks_on(hostname.as_str());
        let local_rank_idx = local_ranks
            .iter()
            .position(|&r| r == rank)
            .ok_or_else(|| AdasumError::Config("own rank not in local ranks".into()))?;
        let inter_node_leads = hosts.iter().map(|host| ranks_on(*host)[0]).collect();

        Ok(NodeTopology {
            lead_rank: local_ranks[0],
            hostname,
            local_ranks,
            local_rank_idx,
            inter_node_leads,
            node_idx,
            num_nodes: hosts.len(),
        })
    }

    /// True if this rank is the lead for its node.
    pub fn is_lead(&self) -> bool {
        self.local_ranks[self.local_rank_idx] == self.lead_rank
    }

    /// Number of ranks on this node.
    pub fn local_world_size(&self) -> usize {
        self.local_ranks.len()
    }

    /// True if the entire job runs on a single node.
    pub fn is_single_node(&self) -> bool {
        self.num_nodes == 1
    }
}

/// Discover the node layout by gathering every rank's hostname.
///
/// All ranks of `comm` must call this collectively. Rank 0 gathers the
/// names and sends the full table back, so the exchange never needs two
/// outstanding sends on one rank.
pub fn discover_topology(comm: &dyn Communicator, hostname: &str) -> Result<NodeTopology> {
    let world = comm.size() as usize;
    let rank = comm.rank();

    let mut mine = [0u8; HOSTNAME_BUF_SIZE];
    let bytes = hostname.as_bytes();
    let copy_len = bytes.len().min(HOSTNAME_BUF_SIZE);
    mine[..copy_len].copy_from_slice(&bytes[..copy_len]);

    let mut table = vec![0u8; HOSTNAME_BUF_SIZE * world];
    if rank == 0 {
        table[..HOSTNAME_BUF_SIZE].copy_from_slice(&mine);
        for peer in 1..world {
            let slot = &mut table[peer * HOSTNAME_BUF_SIZE..(peer + 1) * HOSTNAME_BUF_SIZE];
            comm.recv(slot, HOSTNAME_BUF_SIZE, DataType::U8, peer as Rank, HOSTNAME_GATHER_TAG)?;
        }
        for peer in 1..world {
            comm.send(&table, table.len(), DataType::U8, peer as Rank, HOSTNAME_TABLE_TAG)?;
        }
    } else {
        comm.send(&mine, HOSTNAME_BUF_SIZE, DataType::U8, 0, HOSTNAME_GATHER_TAG)?;
        let len = table.len();
        comm.recv(&mut table, len, DataType::U8, 0, HOSTNAME_TABLE_TAG)?;
    }

    let hostnames: Vec<String> = table
        .chunks_exact(HOSTNAME_BUF_SIZE)
        .map(|buf| {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(HOSTNAME_BUF_SIZE);
            String::from_utf8_lossy(&buf[..end]).into_owned()
        })
        .collect();

    let topo = NodeTopology::from_hostnames(rank, &hostnames)?;
    tracing::debug!(
        rank,
        node = topo.node_idx,
        nodes = topo.num_nodes,
        local = topo.local_world_size(),
        "discovered topology"
    );
    Ok(topo)
}

/// [`discover_topology`] using this machine's hostname.
pub fn discover_local_topology(comm: &dyn Communicator) -> Result<NodeTopology> {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    discover_topology(comm, &hostname)
}
