use adasum::{
    AdasumAlgorithm, AdasumConfig, CPU_DEVICE_ID, ContextId, DataType, Entry, MultiLayerOp,
};

use super::helpers::{assert_close, cluster, f32_bytes, from_f32_bytes, one_hot};

#[test]
fn test_each_layer_gets_its_own_coefficient() {
    let v = [1.0f32, 2.0, -0.5];
    for workers in [1, 3] {
        let cluster = cluster(2, 2, AdasumAlgorithm::GpuTree);
        let results = cluster
            .run(|ctx| {
                let cfg = AdasumConfig {
                    layer_workers: workers,
                    ..ctx.config().clone()
                };
                let op = MultiLayerOp::new(ctx.comms.global.clone(), &cfg)?;

                // Layer 0 is identical everywhere, layer 1 orthogonal.
                let mut fused = v.to_vec();
                fused.extend(one_hot(4, ctx.rank as usize));
                let mut buf = f32_bytes(&fused);
                let mut recv = vec![0u8; buf.len()];
                op.execute_fused(&mut buf, &mut recv, DataType::F32, &[3, 4], 5)?;
                Ok(from_f32_bytes(&buf))
            })
            .unwrap();

        for result in results {
            assert_close(&result[..3], &v);
            assert_close(&result[3..], &[1.0; 4]);
        }
    }
}

#[test]
fn test_host_entries_out_of_place() {
    let cluster = cluster(1, 3, AdasumAlgorithm::GpuTree);
    let results = cluster
        .run(|ctx| {
            let input = one_hot(3, ctx.rank as usize);
            let mut output = vec![0.0f32; 3];
            let entry = Entry::new(
                input.as_ptr() as u64,
                output.as_mut_ptr() as u64,
                3,
                DataType::F32,
                CPU_DEVICE_ID,
                ContextId(0),
            );
            ctx.multi_layer_op()?.execute(&[entry])?;
            Ok((input, output))
        })
        .unwrap();

    for (rank, (input, output)) in results.into_iter().enumerate() {
        assert_eq!(input, one_hot(3, rank));
        assert_close(&output, &[1.0; 3]);
    }
}

#[test]
fn test_unsupported_dtype() {
    let cluster = cluster(1, 1, AdasumAlgorithm::GpuTree);
    let op = cluster.ranks()[0].multi_layer_op().unwrap();
    let mut a = vec![0u8; 8];
    let b = vec![0u8; 8];
    let layers = adasum::LayerDescriptor::from_sizes(&[2]);
    assert!(op.pairwise_reduce(&mut a, &b, DataType::I32, &layers).is_err());
}
