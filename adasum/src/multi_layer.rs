//! Flat Adasum tree over fused multi-layer buffers.
//!
//! A fused buffer packs several layers back to back. The tree traversal is
//! the same as [`crate::tree`], over the global communicator, but each
//! pairwise combine computes one coefficient per layer. The combine splits
//! the buffer into `W` equal element ranges, one per worker: workers first
//! add their partial dot/norm sums into per-layer accumulators, and only
//! once every worker is done do they apply the per-layer coefficients to
//! their own range.

use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::comm::Communicator;
use crate::config::AdasumConfig;
use crate::entry::Entry;
use crate::error::{AdasumError, Result};
use crate::kernels::{self, PairStats};
use crate::tree::TreePass;
use crate::types::{DataType, Tag};

/// One layer inside a fused buffer, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerDescriptor {
    pub offset: usize,
    pub len: usize,
}

impl LayerDescriptor {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Lay out consecutive layers of the given sizes.
    pub fn from_sizes(sizes: &[usize]) -> Vec<LayerDescriptor> {
        let mut offset = 0;
        sizes
            .iter()
            .map(|&len| {
                let layer = LayerDescriptor { offset, len };
                offset += len;
                layer
            })
            .collect()
    }

    /// Part of this layer inside `[start, end)`, if any.
    fn clip(&self, start: usize, end: usize) -> Option<(usize, usize)> {
        let begin = self.offset.max(start);
        let stop = self.end().min(end);
        (begin < stop).then_some((begin, stop))
    }
}

/// Element range `[start, end)` owned by worker `w` of `workers`.
fn worker_range(count: usize, w: usize, workers: usize) -> (usize, usize) {
    (count * w / workers, count * (w + 1) / workers)
}

/// Multi-layer Adasum allreduce on host buffers.
pub struct MultiLayerOp {
    comm: Arc<dyn Communicator>,
    pool: rayon::ThreadPool,
    workers: usize,
}

impl MultiLayerOp {
    pub fn new(comm: Arc<dyn Communicator>, config: &AdasumConfig) -> Result<Self> {
        let workers = config.layer_workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("adasum-layer-{i}"))
            .build()
            .map_err(|e| AdasumError::Config(format!("layer worker pool: {e}")))?;
        Ok(Self {
            comm,
            pool,
            workers,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Reduce a batch of host entries, one layer each, tagged by position.
    pub fn execute(&self, entries: &[Entry]) -> Result<()> {
        for (i, entry) in entries.iter().enumerate() {
            entry.validate(i)?;
        }
        let mut recv = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            if entry.size_bytes == 0 {
                continue;
            }
            // SAFETY: `validate` checked non-null pointers and the caller
            // guarantees both cover `size_bytes` for the duration of the call.
            let len = entry.size_bytes;
            let output = unsafe { std::slice::from_raw_parts_mut(entry.output as *mut u8, len) };
            if !entry.aliased() {
                let input = unsafe { std::slice::from_raw_parts(entry.input as *const u8, len) };
                output.copy_from_slice(input);
            }
            recv.resize(entry.size_bytes, 0);
            self.execute_fused(output, &mut recv, entry.dtype, &[entry.count], i as Tag)?;
        }
        Ok(())
    }

    /// Adasum-allreduce one fused buffer whose layers have `layer_sizes`
    /// elements. `recv` is scratch space of the same size.
    pub fn execute_fused(
        &self,
        buffer: &mut [u8],
        recv: &mut [u8],
        dtype: DataType,
        layer_sizes: &[usize],
        tag: Tag,
    ) -> Result<()> {
        let count: usize = layer_sizes.iter().sum();
        let expected = count * dtype.size_in_bytes();
        if buffer.len() != expected {
            return Err(AdasumError::BufferSizeMismatch {
                expected,
                actual: buffer.len(),
            });
        }
        let layers = LayerDescriptor::from_sizes(layer_sizes);
        tracing::trace!(
            rank = self.comm.rank(),
            layers = layers.len(),
            count,
            tag,
            "multi-layer allreduce"
        );

        TreePass::new(self.comm.as_ref(), tag, count, dtype).allreduce_with(
            buffer,
            recv,
            |local, received| self.pairwise_reduce(local, received, dtype, &layers),
        )
    }

    /// Fold `b` into `a` with one Adasum coefficient per layer.
    pub fn pairwise_reduce(
        &self,
        a: &mut [u8],
        b: &[u8],
        dtype: DataType,
        layers: &[LayerDescriptor],
    ) -> Result<()> {
        if !dtype.is_adasum_supported() {
            return Err(AdasumError::UnsupportedDType {
                dtype,
                op: "pairwise_reduce",
            });
        }
        let sz = dtype.size_in_bytes();
        let count = layers.last().map_or(0, LayerDescriptor::end);
        for len in [a.len(), b.len()] {
            if len < count * sz {
                return Err(AdasumError::BufferSizeMismatch {
                    expected: count * sz,
                    actual: len,
                });
            }
        }
        let workers = self.workers;
        let totals: Vec<Mutex<PairStats>> =
            layers.iter().map(|_| Mutex::new(PairStats::default())).collect();

        self.pool.install(|| -> Result<()> {
            // Phase 1: partial sums into the shared per-layer totals.
            (0..workers).into_par_iter().try_for_each(|w| {
                let (start, end) = worker_range(count, w, workers);
                for (layer, total) in layers.iter().zip(&totals) {
                    let Some((begin, stop)) = layer.clip(start, end) else {
                        continue;
                    };
                    let part = kernels::reduce_stats(
                        &a[begin * sz..stop * sz],
                        &b[begin * sz..stop * sz],
                        stop - begin,
                        dtype,
                    )?;
                    total.lock().accumulate(part);
                }
                Ok(())
            })?;

            // Phase 2: every total is final; each worker rewrites its own range.
            let coeffs: Vec<f64> = totals.iter().map(|t| t.lock().coefficient()).collect();
            let mut chunks = Vec::with_capacity(workers);
            let mut rest = &mut a[..count * sz];
            for w in 0..workers {
                let (start, end) = worker_range(count, w, workers);
                let (head, tail) = std::mem::take(&mut rest).split_at_mut((end - start) * sz);
                chunks.push((start, end, head));
                rest = tail;
            }
            chunks.into_par_iter().try_for_each(|(start, end, chunk)| {
                for (layer, &coeff) in layers.iter().zip(&coeffs) {
                    let Some((begin, stop)) = layer.clip(start, end) else {
                        continue;
                    };
                    kernels::combine(
                        stop - begin,
                        coeff,
                        &b[begin * sz..stop * sz],
                        &mut chunk[(begin - start) * sz..(stop - start) * sz],
                        dtype,
                    )?;
                }
                Ok(())
            })
        })
    }
}
