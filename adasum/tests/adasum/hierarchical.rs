use adasum::{AdasumAlgorithm, AdasumError, ContextId, DataType, Entry};

use super::helpers::{DeviceVec, assert_close, cluster, one_hot};

const DEVICE_ALGORITHMS: [AdasumAlgorithm; 3] = [
    AdasumAlgorithm::GpuTree,
    AdasumAlgorithm::GpuRing,
    AdasumAlgorithm::GpuNcclSumRing,
];

/// Reduce one out-of-place entry per rank; returns every rank's output.
fn reduce_out_of_place(
    nodes: u32,
    gpus: u32,
    algorithm: AdasumAlgorithm,
    input: impl Fn(u32) -> Vec<f32> + Sync,
) -> Vec<Vec<f32>> {
    let cluster = cluster(nodes, gpus, algorithm);
    let response = cluster.response();
    cluster
        .run(|ctx| {
            let data = input(ctx.rank);
            let src = DeviceVec::upload(ctx.runtime(), ctx.device, &data);
            let dst = DeviceVec::zeros(ctx.runtime(), ctx.device, data.len());
            ctx.adasum_op().execute(&[src.entry_to(&dst)], &response)?;
            Ok(dst.read())
        })
        .unwrap()
}

#[test]
fn test_orthogonal_gradients_sum_for_every_algorithm() {
    for algorithm in DEVICE_ALGORITHMS {
        let results = reduce_out_of_place(2, 2, algorithm, |r| one_hot(4, r as usize));
        for (rank, result) in results.iter().enumerate() {
            assert_close(result, &[1.0; 4]);
            assert_eq!(result, &results[0], "{algorithm:?} rank {rank}");
        }
    }
}

#[test]
fn test_identical_gradients_cancel() {
    let v = [0.5f32, -1.0, 2.0];
    for algorithm in [AdasumAlgorithm::GpuTree, AdasumAlgorithm::GpuRing] {
        for result in reduce_out_of_place(2, 2, algorithm, |_| v.to_vec()) {
            assert_close(&result, &v);
        }
    }
}

#[test]
fn test_collective_variant_sums_inside_node() {
    // Each node sums to 2v, and the two identical node results cancel.
    let v = [0.5f32, -1.0, 2.0];
    for result in reduce_out_of_place(2, 2, AdasumAlgorithm::GpuNcclSumRing, |_| v.to_vec()) {
        assert_close(&result, &[1.0, -2.0, 4.0]);
    }
}

#[test]
fn test_single_node_and_single_gpu_layouts() {
    for algorithm in DEVICE_ALGORITHMS {
        for (nodes, gpus) in [(1, 3), (3, 1), (1, 1)] {
            let world = (nodes * gpus) as usize;
            let results =
                reduce_out_of_place(nodes, gpus, algorithm, |r| one_hot(world, r as usize));
            for result in results {
                assert_close(&result, &vec![1.0; world]);
            }
        }
    }
}

#[test]
fn test_in_place_batch_with_several_entries() {
    for algorithm in DEVICE_ALGORITHMS {
        let cluster = cluster(2, 2, algorithm);
        let response = cluster.response();
        let results = cluster
            .run(|ctx| {
                let r = ctx.rank as usize;
                let first = DeviceVec::upload(ctx.runtime(), ctx.device, &one_hot(4, r));
                let second = DeviceVec::upload(ctx.runtime(), ctx.device, &one_hot(8, 2 * r + 1));
                let entries = [first.in_place_entry(), second.in_place_entry()];
                ctx.adasum_op().execute(&entries, &response)?;
                Ok((first.read(), second.read()))
            })
            .unwrap();

        let mut expected_second = vec![0.0; 8];
        for r in 0..4 {
            expected_second[2 * r + 1] = 1.0;
        }
        for (first, second) in results {
            assert_close(&first, &[1.0; 4]);
            assert_close(&second, &expected_second);
        }
    }
}

#[test]
fn test_repeated_batches_are_consistent() {
    let cluster = cluster(2, 2, AdasumAlgorithm::GpuRing);
    let response = cluster.response();
    let results = cluster
        .run(|ctx| {
            let op = ctx.adasum_op();
            let mut out = Vec::new();
            for step in 0..3 {
                let data: Vec<f32> = one_hot(4, ctx.rank as usize)
                    .into_iter()
                    .map(|x| x * (step + 1) as f32)
                    .collect();
                let buf = DeviceVec::upload(ctx.runtime(), ctx.device, &data);
                op.execute(&[buf.in_place_entry()], &response)?;
                out.push(buf.read());
            }
            Ok(out)
        })
        .unwrap();
    for per_rank in results {
        for (step, result) in per_rank.iter().enumerate() {
            assert_close(result, &[(step + 1) as f32; 4]);
        }
    }
}

#[test]
fn test_disabled_algorithm_is_rejected() {
    let cluster = cluster(1, 1, AdasumAlgorithm::None);
    let ctx = &cluster.ranks()[0];
    let op = ctx.adasum_op();
    let buf = DeviceVec::upload(ctx.runtime(), ctx.device, &[1.0]);
    let entries = [buf.in_place_entry()];

    assert!(!op.enabled(&entries));
    let err = op.execute(&entries, &cluster.response()).unwrap_err();
    assert!(matches!(err, AdasumError::UnsupportedAlgorithm(_)));
}

#[test]
fn test_integer_entry_rejected_before_any_traffic() {
    let cluster = cluster(1, 2, AdasumAlgorithm::GpuTree);
    let response = cluster.response();
    let errors = cluster
        .run(|ctx| {
            let buf = DeviceVec::upload(ctx.runtime(), ctx.device, &[1.0, 2.0]);
            let entry = Entry::in_place(buf.ptr(), 2, DataType::I32, ctx.device, ContextId(0));
            let op = ctx.adasum_op();
            assert!(op.enabled(&[entry]));
            Ok(op.execute(&[entry], &response).unwrap_err())
        })
        .unwrap();
    for err in errors {
        assert!(matches!(
            err,
            AdasumError::UnsupportedDType {
                dtype: DataType::I32,
                ..
            }
        ));
        assert!(!err.is_fatal());
    }
}

#[test]
fn test_empty_batch_is_noop() {
    let cluster = cluster(1, 1, AdasumAlgorithm::GpuTree);
    let op = cluster.ranks()[0].adasum_op();
    op.execute(&[], &cluster.response()).unwrap();
    assert_eq!(op.resources().stats().streams_created, 0);
}

/// `[1 + r, 2 - r/2, r^2/4]`: neither orthogonal nor parallel across ranks.
fn general(rank: u32) -> Vec<f32> {
    let r = rank as f32;
    vec![1.0 + r, 2.0 - 0.5 * r, 0.25 * r * r]
}

#[test]
fn test_general_gradients_agree_on_every_rank() {
    for (nodes, gpus) in [(2, 2), (2, 3), (3, 2)] {
        for algorithm in DEVICE_ALGORITHMS {
            let results = reduce_out_of_place(nodes, gpus, algorithm, general);
            for r in &results[1..] {
                assert_close(r, &results[0]);
            }
            assert!(
                results[0].iter().all(|x| x.is_finite()),
                "{algorithm:?} on {nodes}x{gpus}: {:?}",
                results[0]
            );
        }
    }
}

#[test]
fn test_general_gradients_on_two_by_two() {
    let tree = reduce_out_of_place(2, 2, AdasumAlgorithm::GpuTree, general);
    let ring = reduce_out_of_place(2, 2, AdasumAlgorithm::GpuRing, general);
    assert_close(&tree[0], &ring[0]);
    // Node 0 = adasum([1, 2, 0], [2, 1.5, 0.25]), node 1 likewise over
    // ranks 2 and 3, then one more Adasum between the nodes.
    assert_close(&tree[0], &[3.9729412, 3.0091915, 1.0749087]);

    // Nodes sum to [3, 3.5, 0.25] and [7, 1.5, 3.25]; a.b = 27.0625 and
    // b.b = 61.8125 give 1 - a.b/b.b = 0.5621840, so the result is
    // s0 + 0.5621840 * s1.
    let summed = reduce_out_of_place(2, 2, AdasumAlgorithm::GpuNcclSumRing, general);
    assert_close(&summed[0], &[6.935288, 4.343276, 2.0770981]);
}

#[test]
fn test_successful_batches_wait_for_every_staged_copy() {
    for algorithm in DEVICE_ALGORITHMS {
        let cluster = cluster(2, 2, algorithm);
        let response = cluster.response();
        cluster
            .run(|ctx| {
                let a = DeviceVec::upload(ctx.runtime(), ctx.device, &general(ctx.rank));
                let b = DeviceVec::upload(ctx.runtime(), ctx.device, &one_hot(3, 2));
                let out = DeviceVec::zeros(ctx.runtime(), ctx.device, 3);
                ctx.adasum_op()
                    .execute(&[a.in_place_entry(), b.entry_to(&out)], &response)
            })
            .unwrap();
        assert_eq!(cluster.runtime().unwaited_events(), 0, "{algorithm:?}");
    }
}

#[test]
fn test_failure_after_staging_waits_for_pending_copies() {
    let cluster = cluster(2, 1, AdasumAlgorithm::GpuNcclSumRing);
    let response = cluster.response();
    let errors = cluster
        .run(|ctx| {
            let first = DeviceVec::upload(ctx.runtime(), ctx.device, &[1.0, 2.0]);
            let second = DeviceVec::upload(ctx.runtime(), ctx.device, &[3.0]);
            // Its stream belongs to a device outside the node's collective
            // group, so the second reduce fails after the first is staged.
            let mut stray = second.in_place_entry();
            stray.device = ctx.device + 8;
            let entries = [first.in_place_entry(), stray];
            Ok(ctx.adasum_op().execute(&entries, &response).unwrap_err())
        })
        .unwrap();
    for err in errors {
        assert!(matches!(err, AdasumError::Device { .. }), "{err}");
    }
    assert_eq!(cluster.runtime().unwaited_events(), 0);
}
