use adasum::{AdasumAlgorithm, AdasumError, ResourceStats};

use super::helpers::{DeviceVec, cluster, one_hot};

#[test]
fn test_resources_are_reused_across_batches() {
    for algorithm in [AdasumAlgorithm::GpuRing, AdasumAlgorithm::GpuNcclSumRing] {
        let cluster = cluster(2, 2, algorithm);
        let response = cluster.response();
        let stats = cluster
            .run(|ctx| {
                let op = ctx.adasum_op();
                let mut snapshots: Vec<ResourceStats> = Vec::new();
                for _ in 0..2 {
                    let buf = DeviceVec::upload(ctx.runtime(), ctx.device, &one_hot(4, 0));
                    op.execute(&[buf.in_place_entry()], &response)?;
                    snapshots.push(op.resources().stats());
                }
                Ok(snapshots)
            })
            .unwrap();

        for per_rank in stats {
            assert_eq!(per_rank[0], per_rank[1], "{algorithm:?}");
            assert_eq!(per_rank[0].streams_created, 1);
            let collectives = usize::from(algorithm == AdasumAlgorithm::GpuNcclSumRing);
            assert_eq!(per_rank[0].collectives_created, collectives);
        }
    }
}

#[test]
fn test_ring_temp_buffers_return_to_pool() {
    let cluster = cluster(1, 2, AdasumAlgorithm::GpuRing);
    let response = cluster.response();
    let pooled = cluster
        .run(|ctx| {
            let op = ctx.adasum_op();
            for _ in 0..3 {
                let buf = DeviceVec::upload(ctx.runtime(), ctx.device, &[1.0, 2.0]);
                op.execute(&[buf.in_place_entry()], &response)?;
            }
            let pool = op.resources().temp_buffers();
            Ok((pool.created(), pool.idle()))
        })
        .unwrap();
    assert!(pooled.iter().all(|&p| p == (1, 1)));
}

#[test]
fn test_ring_empty_in_place_entry_borrows_no_buffer() {
    let cluster = cluster(1, 2, AdasumAlgorithm::GpuRing);
    let response = cluster.response();
    let results = cluster
        .run(|ctx| {
            let op = ctx.adasum_op();
            let empty = DeviceVec::upload(ctx.runtime(), ctx.device, &[]);
            let data = one_hot(2, ctx.rank as usize);
            let input = DeviceVec::upload(ctx.runtime(), ctx.device, &data);
            let output = DeviceVec::zeros(ctx.runtime(), ctx.device, 2);
            op.execute(&[empty.in_place_entry(), input.entry_to(&output)], &response)?;
            Ok((op.resources().temp_buffers().created(), output.read()))
        })
        .unwrap();
    for (created, output) in results {
        assert_eq!(created, 0);
        assert_eq!(output, vec![1.0, 1.0]);
    }
}

#[test]
fn test_closed_resources_reject_work() {
    let cluster = cluster(1, 2, AdasumAlgorithm::GpuTree);
    let response = cluster.response();
    let errors = cluster
        .run(|ctx| {
            let op = ctx.adasum_op();
            op.resources().close()?;
            op.resources().close()?;
            assert!(op.resources().is_closed());

            let buf = DeviceVec::upload(ctx.runtime(), ctx.device, &[1.0]);
            Ok(op.execute(&[buf.in_place_entry()], &response).unwrap_err())
        })
        .unwrap();
    for err in errors {
        assert!(matches!(err, AdasumError::ResourcesClosed));
        assert!(err.is_fatal());
    }
}

#[test]
fn test_dropping_operations_frees_device_memory() {
    let cluster = cluster(2, 2, AdasumAlgorithm::GpuRing);
    let response = cluster.response();
    cluster
        .run(|ctx| {
            let op = ctx.adasum_op();
            let buf = DeviceVec::upload(ctx.runtime(), ctx.device, &one_hot(4, 1));
            op.execute(&[buf.in_place_entry()], &response)?;
            Ok(())
        })
        .unwrap();
    assert_eq!(cluster.runtime().live_allocations(), 0);
    assert_eq!(cluster.runtime().live_streams(), 0);
}
