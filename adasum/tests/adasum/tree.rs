use adasum::{DataType, TreeSchedule, tree_allreduce, tree_broadcast, tree_reduce};
use half::f16;

use super::helpers::{assert_close, f32_bytes, from_f32_bytes, one_hot, run_mesh};

#[test]
fn test_correlated_ranks_do_not_double_count() {
    let results = run_mesh(4, |comm| {
        let r = comm.rank() as f32;
        let mut buf = f32_bytes(&[r, r, r]);
        let mut recv = vec![0u8; buf.len()];
        tree_allreduce(comm, &mut buf, &mut recv, 3, DataType::F32, 0).unwrap();
        from_f32_bytes(&buf)
    });

    for result in &results {
        assert_eq!(result, &results[0]);
    }
    // Scaled copies of one direction: far from the naive sum.
    assert_close(&results[0], &[3.0, 3.0, 3.0]);
    assert_ne!(results[0], [6.0, 6.0, 6.0]);
}

#[test]
fn test_orthogonal_ranks_sum() {
    for tag in [0, 1, 2, 9] {
        let results = run_mesh(5, |comm| {
            let mut buf = f32_bytes(&one_hot(5, comm.rank() as usize));
            let mut recv = vec![0u8; buf.len()];
            tree_allreduce(comm, &mut buf, &mut recv, 5, DataType::F32, tag).unwrap();
            from_f32_bytes(&buf)
        });
        for result in results {
            assert_eq!(result, [1.0; 5], "tag {tag}");
        }
    }
}

#[test]
fn test_reduce_root_follows_tag() {
    for tag in 0..4 {
        let results = run_mesh(4, |comm| {
            let mut buf = f32_bytes(&one_hot(4, comm.rank() as usize));
            let mut recv = vec![0u8; buf.len()];
            tree_reduce(comm, &mut buf, &mut recv, 4, DataType::F32, tag).unwrap();
            from_f32_bytes(&buf)
        });
        let root = TreeSchedule::for_tag(4, tag).root() as usize;
        assert_eq!(results[root], [1.0; 4], "tag {tag}");
    }
}

#[test]
fn test_split_reduce_then_broadcast_matches_allreduce() {
    let input = |rank: u32| [rank as f32 + 1.0, 2.0 - rank as f32, 0.5];
    let fused = run_mesh(3, |comm| {
        let mut buf = f32_bytes(&input(comm.rank()));
        let mut recv = vec![0u8; buf.len()];
        tree_allreduce(comm, &mut buf, &mut recv, 3, DataType::F32, 4).unwrap();
        from_f32_bytes(&buf)
    });
    let split = run_mesh(3, |comm| {
        let mut buf = f32_bytes(&input(comm.rank()));
        let mut recv = vec![0u8; buf.len()];
        tree_reduce(comm, &mut buf, &mut recv, 3, DataType::F32, 4).unwrap();
        tree_broadcast(comm, &mut buf, 3, DataType::F32, 4).unwrap();
        from_f32_bytes(&buf)
    });
    assert_eq!(fused, split);
}

#[test]
fn test_single_rank_is_identity() {
    let results = run_mesh(1, |comm| {
        let mut buf = f32_bytes(&[1.5, -2.0]);
        let mut recv = vec![0u8; buf.len()];
        tree_allreduce(comm, &mut buf, &mut recv, 2, DataType::F32, 3).unwrap();
        from_f32_bytes(&buf)
    });
    assert_eq!(results[0], [1.5, -2.0]);
}

#[test]
fn test_half_precision_buffers() {
    let results = run_mesh(2, |comm| {
        let v: Vec<f16> = if comm.rank() == 0 {
            vec![f16::from_f32(2.0), f16::ZERO]
        } else {
            vec![f16::ZERO, f16::from_f32(3.0)]
        };
        let mut buf: Vec<u8> = v.iter().flat_map(|x| x.to_le_bytes()).collect();
        let mut recv = vec![0u8; buf.len()];
        tree_allreduce(comm, &mut buf, &mut recv, 2, DataType::F16, 0).unwrap();
        buf.chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect::<Vec<f32>>()
    });
    for result in results {
        assert_eq!(result, [2.0, 3.0]);
    }
}
