use adasum::{AdasumAlgorithm, Controller, Scope, discover_local_topology, discover_topology};

use super::helpers::cluster;

#[test]
fn test_local_broadcast_stays_on_node() {
    let cluster = cluster(2, 2, AdasumAlgorithm::GpuTree);
    let results = cluster
        .run(|ctx| {
            let ctrl = &ctx.controller;
            let mut buf = [0u8; 4];
            if ctrl.local_rank() == 1 {
                buf = ctx.rank.to_le_bytes();
            }
            ctrl.broadcast(&mut buf, 1, Scope::Local)?;
            Ok(u32::from_le_bytes(buf))
        })
        .unwrap();
    assert_eq!(results, [1, 1, 3, 3]);
}

#[test]
fn test_global_broadcast_and_barrier() {
    let cluster = cluster(2, 2, AdasumAlgorithm::GpuTree);
    let results = cluster
        .run(|ctx| {
            let ctrl = &ctx.controller;
            ctrl.barrier(Scope::Global)?;
            let mut buf = if ctrl.rank() == 3 { *b"ok" } else { [0u8; 2] };
            ctrl.broadcast(&mut buf, 3, Scope::Global)?;
            ctrl.barrier(Scope::Local)?;
            ctrl.barrier(Scope::Global)?;
            Ok(buf)
        })
        .unwrap();
    assert!(results.iter().all(|b| b == b"ok"));
}

#[test]
fn test_controller_reports_node_layout() {
    let cluster = cluster(2, 3, AdasumAlgorithm::GpuTree);
    let ctx = &cluster.ranks()[4];
    assert_eq!(ctx.controller.size(), 6);
    assert_eq!(ctx.controller.local_rank(), 1);
    assert_eq!(ctx.controller.local_size(), 3);
    assert_eq!(ctx.controller.local_comm_ranks(), [3, 4, 5]);
}

#[test]
fn test_discovered_topology_matches_cluster_layout() {
    let cluster = cluster(2, 2, AdasumAlgorithm::GpuTree);
    let discovered = cluster
        .run(|ctx| {
            let host = format!("node{}", ctx.rank / 2);
            discover_topology(ctx.comms.global.as_ref(), &host)
        })
        .unwrap();
    for (ctx, topo) in cluster.ranks().iter().zip(discovered) {
        assert_eq!(topo, ctx.topology);
    }
}

#[test]
fn test_in_process_ranks_share_this_host() {
    let cluster = cluster(2, 2, AdasumAlgorithm::GpuTree);
    let discovered = cluster
        .run(|ctx| discover_local_topology(ctx.comms.global.as_ref()))
        .unwrap();
    for (rank, topo) in discovered.iter().enumerate() {
        assert!(topo.is_single_node());
        assert_eq!(topo.local_world_size(), 4);
        assert_eq!(topo.local_rank_idx, rank);
        assert_eq!(topo.hostname, discovered[0].hostname);
    }
}
