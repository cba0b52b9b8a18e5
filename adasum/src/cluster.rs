//! In-process cluster: every rank of a multi-node job as a thread.
//!
//! Stands in for the host framework's process-group bootstrap in tests and
//! demos. Ranks are numbered node-major, so node `n` holds global ranks
//! `n * gpus_per_node ..`, and each rank drives "device" `local_rank` of a
//! shared [`HostRuntime`].

use std::sync::Arc;

use crate::comm::{Communicator, MeshComm, MeshController, NodeComms};
use crate::config::AdasumConfig;
use crate::device::{DeviceRuntime, HostRuntime};
use crate::entry::Response;
use crate::error::{AdasumError, Result};
use crate::hierarchical::AdasumOp;
use crate::multi_layer::MultiLayerOp;
use crate::resources::ResourceManager;
use crate::topology::NodeTopology;
use crate::types::{DeviceId, Rank};

/// One rank's view of the cluster.
pub struct RankContext {
    pub rank: Rank,
    pub device: DeviceId,
    pub comms: NodeComms,
    pub controller: Arc<MeshController>,
    pub topology: NodeTopology,
    runtime: Arc<dyn DeviceRuntime>,
    config: AdasumConfig,
}

impl RankContext {
    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    pub fn config(&self) -> &AdasumConfig {
        &self.config
    }

    /// Hierarchical operation with its own resource manager.
    pub fn adasum_op(&self) -> AdasumOp {
        self.adasum_op_with(self.config.clone())
    }

    pub fn adasum_op_with(&self, config: AdasumConfig) -> AdasumOp {
        let resources = Arc::new(ResourceManager::open(self.runtime.clone(), &config));
        AdasumOp::new(
            config,
            self.comms.clone(),
            self.controller.clone(),
            resources,
        )
    }

    /// Flat multi-layer operation over the global communicator.
    pub fn multi_layer_op(&self) -> Result<MultiLayerOp> {
        MultiLayerOp::new(self.comms.global.clone(), &self.config)
    }
}

/// Every rank of a `nodes x gpus_per_node` job, wired together in memory.
pub struct LocalCluster {
    ranks: Vec<RankContext>,
    runtime: Arc<HostRuntime>,
    gpus_per_node: u32,
}

impl LocalCluster {
    pub fn new(nodes: u32, gpus_per_node: u32, config: AdasumConfig) -> Result<Self> {
        if nodes == 0 || gpus_per_node == 0 {
            return Err(AdasumError::Config(format!(
                "cluster needs at least one rank, got {nodes} x {gpus_per_node}"
            )));
        }
        let runtime = HostRuntime::new();
        let world = nodes * gpus_per_node;
        let timeout = config.p2p_timeout;

        let global = MeshComm::group(world, timeout)?;
        let cross = MeshComm::group(nodes, timeout)?;
        let mut locals = Vec::with_capacity(nodes as usize);
        for _ in 0..nodes {
            locals.push(MeshComm::group(gpus_per_node, timeout)?);
        }

        let hostnames: Vec<String> = (0..world)
            .map(|r| format!("node{}", r / gpus_per_node))
            .collect();

        let mut ranks = Vec::with_capacity(world as usize);
        for (rank, global) in global.into_iter().enumerate() {
            let rank = rank as Rank;
            let node = rank / gpus_per_node;
            let local_rank = rank % gpus_per_node;
            let local: Arc<dyn Communicator> = locals[node as usize][local_rank as usize].clone();
            let global: Arc<dyn Communicator> = global;
            let cross: Option<Arc<dyn Communicator>> = if local_rank == 0 {
                Some(cross[node as usize].clone())
            } else {
                None
            };
            let local_comm_ranks = (0..gpus_per_node).map(|l| node * gpus_per_node + l).collect();

            ranks.push(RankContext {
                rank,
                device: local_rank as DeviceId,
                controller: Arc::new(MeshController::new(
                    global.clone(),
                    local.clone(),
                    local_comm_ranks,
                )),
                comms: NodeComms {
                    global,
                    local,
                    cross,
                },
                topology: NodeTopology::from_hostnames(rank, &hostnames)?,
                runtime: runtime.clone(),
                config: config.clone(),
            });
        }

        tracing::debug!(nodes, gpus_per_node, world, "local cluster ready");
        Ok(Self {
            ranks,
            runtime,
            gpus_per_node,
        })
    }

    pub fn size(&self) -> u32 {
        self.ranks.len() as u32
    }

    pub fn ranks(&self) -> &[RankContext] {
        &self.ranks
    }

    pub fn runtime(&self) -> &Arc<HostRuntime> {
        &self.runtime
    }

    /// Device of every global rank.
    pub fn response(&self) -> Response {
        Response {
            devices: (0..self.size())
                .map(|r| (r % self.gpus_per_node) as DeviceId)
                .collect(),
        }
    }

    /// Run `f` on every rank, each on its own thread, and collect the
    /// results in rank order. The first error (by rank) is returned.
    pub fn run<T, F>(&self, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&RankContext) -> Result<T> + Sync,
    {
        let f = &f;
        std::thread::scope(|s| {
            let handles: Vec<_> = self
                .ranks
                .iter()
                .map(|ctx| {
                    std::thread::Builder::new()
                        .name(format!("adasum-rank-{}", ctx.rank))
                        .spawn_scoped(s, move || f(ctx))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    let handle = h.map_err(|e| {
                        AdasumError::Config(format!("failed to spawn rank thread: {e}"))
                    })?;
                    match handle.join() {
                        Ok(result) => result,
                        Err(panic) => std::panic::resume_unwind(panic),
                    }
                })
                .collect()
        })
    }
}
