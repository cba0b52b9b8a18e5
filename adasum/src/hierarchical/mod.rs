//! Hierarchical Adasum: combine inside each node, run one tree pass across
//! node roots, then fan the result back out inside each node.
//!
//! The intra-node half is pluggable ([`IntraNodeStrategy`]); the inter-node
//! pass is shared. Whatever the strategy, the node root ends `reduce_local`
//! with a host copy of each entry's node result in [`Staging`], and
//! `broadcast_local` starts from that copy.

mod collective;
mod ring;
mod tree;

pub use collective::CollectiveStrategy;
pub use ring::RingStrategy;
pub use tree::TreeStrategy;

use std::sync::Arc;

use crate::comm::{Controller, NodeComms};
use crate::config::{AdasumAlgorithm, AdasumConfig};
use crate::entry::{Entry, Response};
use crate::error::{AdasumError, Result};
use crate::resources::{Event, ResourceManager};
use crate::tree::tree_allreduce;
use crate::device::StreamHandle;
use crate::types::{DeviceId, StreamSet, Tag};

/// Everything a strategy needs for one batch.
pub struct BatchContext<'a> {
    pub comms: &'a NodeComms,
    pub controller: &'a dyn Controller,
    pub resources: &'a ResourceManager,
    pub response: &'a Response,
    pub stream_set: StreamSet,
}

impl BatchContext<'_> {
    /// True on a node root that has peers on other nodes.
    pub fn crosses_nodes(&self) -> bool {
        self.comms.is_node_root() && self.comms.inter_node().is_some()
    }

    /// Device of every local rank, indexed by local rank.
    pub fn local_devices(&self) -> Result<Vec<DeviceId>> {
        self.controller
            .local_comm_ranks()
            .iter()
            .map(|&rank| {
                self.response
                    .devices
                    .get(rank as usize)
                    .copied()
                    .ok_or(AdasumError::InvalidRank {
                        rank,
                        size: self.response.devices.len() as u32,
                    })
            })
            .collect()
    }
}

/// Host-side state carried from `reduce_local` to `broadcast_local`.
///
/// Copies between device and host are only enqueued; each one records a
/// pooled event in `pending`. The host buffers must not be touched or
/// dropped until [`settle`](Self::settle) (or the error path) has waited on
/// every event.
pub struct Staging {
    /// Per-entry host buffers. On the node root these hold the node result
    /// before the inter-node pass and the global result after it.
    pub host: Vec<Vec<u8>>,
    /// Per-entry copies still in flight.
    pub pending: Vec<Option<Event>>,
}

impl Staging {
    fn new(n: usize) -> Self {
        Self {
            host: vec![Vec::new(); n],
            pending: vec![None; n],
        }
    }

    /// Enqueue a copy of entry `i`'s device buffer at `src` into `host[i]`.
    pub fn stage(&mut self, cx: &BatchContext, i: usize, entry: &Entry, src: u64) -> Result<()> {
        let rt = cx.resources.runtime();
        let stream = cx.resources.stream(cx.stream_set, entry.device)?;
        let host = &mut self.host[i];
        host.resize(entry.size_bytes, 0);
        unsafe {
            rt.memcpy_dtoh_async(
                entry.device,
                host.as_mut_ptr() as u64,
                src,
                entry.size_bytes,
                stream,
            )?;
        }
        self.track(cx, i, entry.device, stream)
    }

    /// Enqueue a copy of `host[i]` into entry `i`'s device buffer at `dst`.
    pub fn unstage(&mut self, cx: &BatchContext, i: usize, entry: &Entry, dst: u64) -> Result<()> {
        let rt = cx.resources.runtime();
        let stream = cx.resources.stream(cx.stream_set, entry.device)?;
        let host = &self.host[i];
        unsafe {
            rt.memcpy_htod_async(entry.device, dst, host.as_ptr() as u64, host.len(), stream)?;
        }
        self.track(cx, i, entry.device, stream)
    }

    /// Record an event behind the work just issued for entry `i` on `stream`.
    pub fn track(
        &mut self,
        cx: &BatchContext,
        i: usize,
        device: DeviceId,
        stream: StreamHandle,
    ) -> Result<()> {
        let rt = cx.resources.runtime();
        let event = cx.resources.acquire_event(device).and_then(|event| {
            rt.record_event(device, event.handle, stream)
                .map(|()| event)
                .inspect_err(|_| cx.resources.release_event(event))
        });
        match event {
            Ok(event) => {
                // Stream order: the new event also covers the older one.
                if let Some(older) = self.pending[i].replace(event) {
                    cx.resources.release_event(older);
                }
                Ok(())
            }
            Err(e) => {
                // The copy is already queued against our host buffer.
                if let Err(sync) = rt.synchronize_stream(device, stream) {
                    tracing::warn!(device, error = %sync, "stream sync after failed event record");
                }
                Err(e)
            }
        }
    }

    /// Wait for and release every in-flight copy.
    pub fn settle(&mut self, resources: &ResourceManager) -> Result<()> {
        for event in self.pending.iter_mut().filter_map(Option::take) {
            let waited = resources
                .runtime()
                .synchronize_event(event.device, event.handle);
            resources.release_event(event);
            waited?;
        }
        Ok(())
    }

    /// Error path: wait for every in-flight copy so the host buffers can be
    /// dropped, then give the events back. Wait failures are only logged.
    fn release_all(&mut self, resources: &ResourceManager) {
        for event in self.pending.iter_mut().filter_map(Option::take) {
            if let Err(e) = resources
                .runtime()
                .synchronize_event(event.device, event.handle)
            {
                tracing::warn!(
                    device = event.device,
                    error = %e,
                    "event wait failed on error path"
                );
            }
            resources.release_event(event);
        }
    }
}

/// Intra-node half of a hierarchical reduction.
pub trait IntraNodeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Combine the node's contributions. On a node root that
    /// [crosses nodes](BatchContext::crosses_nodes), leave each entry's node
    /// result in `staging.host[i]` (or an event in `staging.pending[i]` that
    /// completes once it is there).
    fn reduce_local(
        &self,
        cx: &BatchContext,
        entries: &[Entry],
        staging: &mut Staging,
    ) -> Result<()>;

    /// Deliver the final result to every local rank's output buffer.
    fn broadcast_local(
        &self,
        cx: &BatchContext,
        entries: &[Entry],
        staging: &mut Staging,
    ) -> Result<()>;
}

/// Strategy implementing `algorithm`, or `None` when Adasum is disabled.
pub fn strategy_for(algorithm: AdasumAlgorithm) -> Option<Box<dyn IntraNodeStrategy>> {
    match algorithm {
        AdasumAlgorithm::None => None,
        AdasumAlgorithm::GpuTree => Some(Box::new(TreeStrategy)),
        AdasumAlgorithm::GpuRing => Some(Box::new(RingStrategy)),
        AdasumAlgorithm::GpuNcclSumRing => Some(Box::new(CollectiveStrategy)),
    }
}

/// Hierarchical Adasum allreduce over device-resident entries.
pub struct AdasumOp {
    config: AdasumConfig,
    comms: NodeComms,
    controller: Arc<dyn Controller>,
    resources: Arc<ResourceManager>,
    strategy: Option<Box<dyn IntraNodeStrategy>>,
}

impl AdasumOp {
    pub fn new(
        config: AdasumConfig,
        comms: NodeComms,
        controller: Arc<dyn Controller>,
        resources: Arc<ResourceManager>,
    ) -> Self {
        let strategy = strategy_for(config.algorithm);
        Self {
            config,
            comms,
            controller,
            resources,
            strategy,
        }
    }

    pub fn config(&self) -> &AdasumConfig {
        &self.config
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Whether this operation should handle `entries`: Adasum is switched on
    /// and the batch lives on a device.
    pub fn enabled(&self, entries: &[Entry]) -> bool {
        self.config.algorithm != AdasumAlgorithm::None
            && entries.first().is_some_and(|e| !e.on_host())
    }

    /// Reduce `entries` in place across the whole job.
    ///
    /// Every rank must call this with the same number of entries, in the
    /// same order, with matching counts and types.
    pub fn execute(&self, entries: &[Entry], response: &Response) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let strategy = self.strategy.as_deref().ok_or_else(|| {
            AdasumError::UnsupportedAlgorithm(self.config.algorithm.name().to_string())
        })?;
        for (i, entry) in entries.iter().enumerate() {
            entry.validate(i)?;
        }

        let _span = tracing::debug_span!(
            "adasum",
            algorithm = strategy.name(),
            entries = entries.len(),
            stream_set = self.config.stream_set,
            rank = self.controller.rank(),
        )
        .entered();

        let mut devices: Vec<DeviceId> = entries.iter().map(|e| e.device).collect();
        devices.sort_unstable();
        devices.dedup();
        self.resources
            .ensure_streams(self.config.stream_set, &devices)?;

        let cx = BatchContext {
            comms: &self.comms,
            controller: self.controller.as_ref(),
            resources: &self.resources,
            response,
            stream_set: self.config.stream_set,
        };
        let mut staging = Staging::new(entries.len());

        let result = strategy
            .reduce_local(&cx, entries, &mut staging)
            .and_then(|()| self.inter_node(&cx, entries, &mut staging))
            .and_then(|()| strategy.broadcast_local(&cx, entries, &mut staging));

        if let Err(e) = &result {
            staging.release_all(&self.resources);
            if e.is_fatal() {
                tracing::error!(
                    rank = self.controller.rank(),
                    algorithm = strategy.name(),
                    error = %e,
                    "adasum reduction failed"
                );
            }
        }
        result
    }

    /// Tree pass across node roots on each entry's staged host copy.
    fn inter_node(
        &self,
        cx: &BatchContext,
        entries: &[Entry],
        staging: &mut Staging,
    ) -> Result<()> {
        let Some(cross) = cx.comms.inter_node().filter(|_| cx.comms.is_node_root()) else {
            return Ok(());
        };
        staging.settle(cx.resources)?;

        let mut recv = Vec::new();
        for (i, (entry, host)) in entries.iter().zip(staging.host.iter_mut()).enumerate() {
            recv.resize(entry.size_bytes, 0);
            tree_allreduce(
                cross.as_ref(),
                host,
                &mut recv,
                entry.count,
                entry.dtype,
                i as Tag,
            )?;
        }
        tracing::debug!(entries = entries.len(), nodes = cross.size(), "inter-node pass done");
        Ok(())
    }
}
