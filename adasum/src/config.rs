//! Runtime-configurable parameters for the Adasum engine.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `ADASUM_`) or by constructing a custom `AdasumConfig`.

use std::str::FromStr;
use std::time::Duration;

use crate::error::AdasumError;
use crate::types::StreamSet;

/// Intra-node topology used by the hierarchical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdasumAlgorithm {
    /// Adasum disabled; executing a batch with it is a configuration error.
    None,
    /// Tree combine inside the node and across nodes.
    GpuTree,
    /// Ring reduce/broadcast inside the node, tree across nodes.
    GpuRing,
    /// Device-collective sum inside the node, tree across nodes.
    GpuNcclSumRing,
}

impl AdasumAlgorithm {
    pub const fn name(self) -> &'static str {
        match self {
            AdasumAlgorithm::None => "none",
            AdasumAlgorithm::GpuTree => "gpu_tree",
            AdasumAlgorithm::GpuRing => "gpu_ring",
            AdasumAlgorithm::GpuNcclSumRing => "gpu_nccl_sum_ring",
        }
    }
}

impl std::fmt::Display for AdasumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AdasumAlgorithm {
    type Err = AdasumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(AdasumAlgorithm::None),
            "gpu_tree" | "tree" => Ok(AdasumAlgorithm::GpuTree),
            "gpu_ring" | "ring" => Ok(AdasumAlgorithm::GpuRing),
            "gpu_nccl_sum_ring" | "nccl" => Ok(AdasumAlgorithm::GpuNcclSumRing),
            other => Err(AdasumError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Tuning parameters for the reduction engine.
#[derive(Debug, Clone)]
pub struct AdasumConfig {
    /// Intra-node topology.
    pub algorithm: AdasumAlgorithm,

    /// Stream set the current batch is issued on.
    pub stream_set: StreamSet,

    /// Worker count for the multi-layer pairwise combine.
    pub layer_workers: usize,

    /// Upper bound on a single blocking send/recv before it is treated as
    /// a transport failure.
    pub p2p_timeout: Duration,

    /// Temporary fusion buffers grow in multiples of this many bytes.
    pub fusion_growth_bytes: usize,
}

impl Default for AdasumConfig {
    fn default() -> Self {
        Self {
            algorithm: AdasumAlgorithm::GpuTree,
            stream_set: 0,
            layer_workers: 1,
            p2p_timeout: Duration::from_secs(60),
            fusion_growth_bytes: 1024 * 1024, // 1 MiB
        }
    }
}

impl AdasumConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `ADASUM_ALGORITHM` (`none`, `gpu_tree`, `gpu_ring`, `gpu_nccl_sum_ring`)
    /// - `ADASUM_STREAM_SET`
    /// - `ADASUM_LAYER_WORKERS`
    /// - `ADASUM_P2P_TIMEOUT_SECS`
    /// - `ADASUM_FUSION_GROWTH_BYTES`
    ///
    /// Numeric variables that fail to parse are ignored. An unknown algorithm
    /// name is an error, since silently running a different topology would
    /// desynchronize the peers.
    pub fn from_env() -> crate::error::Result<Self> {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("ADASUM_ALGORITHM") {
            cfg.algorithm = v.parse()?;
        }
        if let Ok(v) = std::env::var("ADASUM_STREAM_SET") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.stream_set = n;
            }
        }
        if let Ok(v) = std::env::var("ADASUM_LAYER_WORKERS") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.layer_workers = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("ADASUM_P2P_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.p2p_timeout = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("ADASUM_FUSION_GROWTH_BYTES") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.fusion_growth_bytes = n.max(1);
            }
        }

        Ok(cfg)
    }

    pub fn with_algorithm(mut self, algorithm: AdasumAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }
}
