use std::sync::Arc;
use std::time::Duration;

use adasum::{
    AdasumAlgorithm, AdasumConfig, Communicator, ContextId, DataType, DeviceId, DeviceRuntime,
    Entry, LocalCluster, MeshComm,
};

/// Route engine logs to the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adasum=warn".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn config(algorithm: AdasumAlgorithm) -> AdasumConfig {
    AdasumConfig {
        p2p_timeout: Duration::from_secs(10),
        ..AdasumConfig::default()
    }
    .with_algorithm(algorithm)
}

pub fn cluster(nodes: u32, gpus_per_node: u32, algorithm: AdasumAlgorithm) -> LocalCluster {
    init_tracing();
    LocalCluster::new(nodes, gpus_per_node, config(algorithm)).unwrap()
}

/// Run `f` on every rank of a flat in-memory group and collect the
/// results in rank order.
pub fn run_mesh<T, F>(world_size: u32, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&dyn Communicator) -> T + Sync,
{
    init_tracing();
    let comms = MeshComm::group(world_size, Duration::from_secs(10)).unwrap();
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .iter()
            .map(|comm| s.spawn(move || f(comm.as_ref())))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

pub fn f32_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

pub fn from_f32_bytes(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

pub fn one_hot(len: usize, i: usize) -> Vec<f32> {
    let mut v = vec![0.0; len];
    v[i] = 1.0;
    v
}

pub fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        approx::assert_relative_eq!(*a, *e, epsilon = 1e-5);
    }
}

/// An `f32` buffer in a device runtime's memory, freed on drop.
pub struct DeviceVec {
    runtime: Arc<dyn DeviceRuntime>,
    device: DeviceId,
    ptr: u64,
    len: usize,
}

impl DeviceVec {
    pub fn upload(runtime: &Arc<dyn DeviceRuntime>, device: DeviceId, data: &[f32]) -> Self {
        let ptr = runtime.alloc(device, data.len() * 4).unwrap();
        // Host runtime device memory is ordinary host memory.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut f32, data.len());
        }
        Self {
            runtime: runtime.clone(),
            device,
            ptr,
            len: data.len(),
        }
    }

    pub fn zeros(runtime: &Arc<dyn DeviceRuntime>, device: DeviceId, len: usize) -> Self {
        Self::upload(runtime, device, &vec![0.0; len])
    }

    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    pub fn read(&self) -> Vec<f32> {
        unsafe { std::slice::from_raw_parts(self.ptr as *const f32, self.len).to_vec() }
    }

    /// Out-of-place entry reading `self` and writing `output`.
    pub fn entry_to(&self, output: &DeviceVec) -> Entry {
        Entry::new(
            self.ptr,
            output.ptr,
            self.len,
            DataType::F32,
            self.device,
            ContextId(0),
        )
    }

    pub fn in_place_entry(&self) -> Entry {
        Entry::in_place(self.ptr, self.len, DataType::F32, self.device, ContextId(0))
    }
}

impl Drop for DeviceVec {
    fn drop(&mut self) {
        let _ = unsafe { self.runtime.free(self.device, self.ptr) };
    }
}
