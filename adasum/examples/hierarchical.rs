//! Hierarchical Adasum across 2 nodes x 2 devices, in one process.
//!
//! Every rank contributes `[r, r, r]`. The vectors all point the same way,
//! so Adasum lands near their scale instead of at the naive sum `[6, 6, 6]`.
//! The simulated nodes all run on this host, which hostname discovery
//! reports as a single node.
//!
//! ```bash
//! ADASUM_ALGORITHM=gpu_ring RUST_LOG=adasum=debug cargo run --example hierarchical
//! ```

use adasum::{
    AdasumConfig, ContextId, DataType, DeviceRuntime, Entry, LocalCluster, discover_local_topology,
};

fn main() -> adasum::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adasum=info".into()),
        )
        .init();

    let config = AdasumConfig::from_env()?;
    println!("algorithm: {}", config.algorithm.name());
    let cluster = LocalCluster::new(2, 2, config)?;
    let response = cluster.response();

    let hosts = cluster.run(|ctx| discover_local_topology(ctx.comms.global.as_ref()))?;
    println!(
        "host {}: {} ranks, simulated as {} nodes",
        hosts[0].hostname,
        hosts[0].local_world_size(),
        cluster.ranks()[0].topology.num_nodes
    );

    let results = cluster.run(|ctx| {
        let rt = ctx.runtime();
        let data = vec![ctx.rank as f32; 3];
        let bytes = data.len() * std::mem::size_of::<f32>();

        // Host runtime "device" memory is plain host memory.
        let ptr = rt.alloc(ctx.device, bytes)?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut f32, data.len()) };

        let entry = Entry::in_place(ptr, data.len(), DataType::F32, ctx.device, ContextId(0));
        let op = ctx.adasum_op();
        let result = op.execute(&[entry], &response).map(|()| {
            unsafe { std::slice::from_raw_parts(ptr as *const f32, data.len()) }.to_vec()
        });
        unsafe { rt.free(ctx.device, ptr)? };
        result
    })?;

    for (rank, result) in results.iter().enumerate() {
        println!("rank {rank}: {result:?}");
    }
    Ok(())
}
