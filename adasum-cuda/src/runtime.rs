use std::collections::HashMap;
use std::ffi::{CString, c_void};
use std::mem::MaybeUninit;
use std::sync::{Arc, Mutex};

use adasum::device::{
    CollectiveHandle, CollectiveId, DeviceRuntime, EventHandle, ScratchTriple, StreamHandle,
};
use adasum::types::NORM_EPSILON;
use adasum::{AdasumError, CPU_DEVICE_ID, DataType, DeviceId, Rank};
use cudarc::driver::{result as drv, sys as cu};
use cudarc::nccl::{result as nccl, sys};

use crate::error::{compile, driver, nccl as nccl_err};
use crate::kernels::{self, BLOCK_SIZE, DOT_NORMS, SCALED_ADD};
use crate::types::{device_ordinal, id_from_sys, id_to_sys, to_nccl_dtype};

type Result<T> = adasum::Result<T>;

/// Kernel module loaded into one device's primary context.
struct LoadedModule {
    module: u64,
    functions: HashMap<String, u64>,
}

/// PTX compiled once per runtime, loaded lazily per device.
#[derive(Default)]
struct KernelCache {
    ptx: Option<CString>,
    modules: HashMap<DeviceId, LoadedModule>,
}

/// [`DeviceRuntime`] on the CUDA driver API and NCCL.
///
/// Uses cudarc's `result` layer directly, since the engine manages device
/// memory and handles as raw `u64` values. Streams, events and
/// communicators are the driver's own pointers, cast to `u64`.
pub struct CudaRuntime {
    /// Retained primary context per device.
    contexts: Mutex<HashMap<DeviceId, u64>>,
    /// Device of every live NCCL communicator.
    comms: Mutex<HashMap<u64, DeviceId>>,
    kernels: Mutex<KernelCache>,
}

impl CudaRuntime {
    pub fn new() -> Result<Arc<Self>> {
        drv::init().map_err(driver("cuInit", CPU_DEVICE_ID))?;
        Ok(Arc::new(Self {
            contexts: Mutex::new(HashMap::new()),
            comms: Mutex::new(HashMap::new()),
            kernels: Mutex::new(KernelCache::default()),
        }))
    }

    /// Make `device`'s primary context current on the calling thread.
    fn bind(&self, call: &'static str, device: DeviceId) -> Result<()> {
        let ordinal = device_ordinal(call, device)?;
        let mut contexts = self
            .contexts
            .lock()
            .map_err(|_| AdasumError::LockPoisoned("cuda contexts"))?;
        let ctx = match contexts.get(&device) {
            Some(&ctx) => ctx as cu::CUcontext,
            None => {
                let dev = drv::device::get(ordinal).map_err(driver(call, device))?;
                let ctx = unsafe { drv::primary_ctx::retain(dev) }.map_err(driver(call, device))?;
                contexts.insert(device, ctx as u64);
                tracing::debug!(device, "retained primary context");
                ctx
            }
        };
        unsafe { drv::ctx::set_current(ctx) }.map_err(driver(call, device))
    }

    fn comm_device(&self, call: &'static str, comm: CollectiveHandle) -> Result<DeviceId> {
        self.comms
            .lock()
            .map_err(|_| AdasumError::LockPoisoned("nccl communicators"))?
            .get(&comm.0)
            .copied()
            .ok_or_else(|| AdasumError::DeviceCollective {
                call,
                message: format!("unknown communicator {:#x}", comm.0),
            })
    }

    /// `kernel` for `dtype` on `device`, whose context must be current.
    fn function(
        &self,
        kernel: &'static str,
        dtype: DataType,
        device: DeviceId,
    ) -> Result<cu::CUfunction> {
        let name = kernels::symbol(kernel, dtype)?;
        let mut cache = self
            .kernels
            .lock()
            .map_err(|_| AdasumError::LockPoisoned("cuda kernels"))?;
        let KernelCache { ptx, modules } = &mut *cache;

        if !modules.contains_key(&device) {
            if ptx.is_none() {
                let compiled = cudarc::nvrtc::compile_ptx(kernels::SOURCE)
                    .map_err(|e| compile("nvrtc_compile", device)(format!("{e:?}")))?;
                let image = CString::new(compiled.to_src())
                    .map_err(|e| compile("nvrtc_compile", device)(e.to_string()))?;
                tracing::info!(device, "compiled adasum kernels");
                *ptx = Some(image);
            }
            let image = ptx
                .as_ref()
                .ok_or_else(|| compile("module_load", device)("no PTX image".into()))?;
            let module = unsafe { drv::module::load_data(image.as_ptr() as *const c_void) }
                .map_err(driver("module_load", device))?;
            modules.insert(
                device,
                LoadedModule {
                    module: module as u64,
                    functions: HashMap::new(),
                },
            );
        }

        let Some(loaded) = modules.get_mut(&device) else {
            return Err(compile("module_get_function", device)("module not loaded".into()));
        };
        if let Some(&f) = loaded.functions.get(&name) {
            return Ok(f as cu::CUfunction);
        }
        let symbol = CString::new(name.clone())
            .map_err(|e| compile("module_get_function", device)(e.to_string()))?;
        let f = unsafe { drv::module::get_function(loaded.module as cu::CUmodule, symbol) }
            .map_err(driver("module_get_function", device))?;
        loaded.functions.insert(name, f as u64);
        Ok(f)
    }

    /// Launch `f` over `count` elements on `stream`.
    unsafe fn launch(
        &self,
        call: &'static str,
        device: DeviceId,
        f: cu::CUfunction,
        count: usize,
        stream: cu::CUstream,
        params: &mut [*mut c_void],
    ) -> Result<()> {
        let grid = (kernels::grid_size(count), 1, 1);
        let block = (BLOCK_SIZE, 1, 1);
        unsafe { drv::launch_kernel(f, grid, block, 0, stream, params) }
            .map_err(driver(call, device))
    }
}

fn stream_ptr(stream: StreamHandle) -> cu::CUstream {
    stream.0 as cu::CUstream
}

fn event_ptr(event: EventHandle) -> cu::CUevent {
    event.0 as cu::CUevent
}

impl DeviceRuntime for CudaRuntime {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn greatest_stream_priority(&self, device: DeviceId) -> Result<i32> {
        self.bind("ctx_get_stream_priority_range", device)?;
        let (mut least, mut greatest) = (0, 0);
        unsafe { cu::cuCtxGetStreamPriorityRange(&mut least, &mut greatest) }
            .result()
            .map_err(driver("ctx_get_stream_priority_range", device))?;
        Ok(greatest)
    }

    fn create_stream(&self, device: DeviceId, priority: i32) -> Result<StreamHandle> {
        self.bind("stream_create", device)?;
        let mut stream = MaybeUninit::uninit();
        unsafe {
            cu::cuStreamCreateWithPriority(
                stream.as_mut_ptr(),
                cu::CUstream_flags::CU_STREAM_NON_BLOCKING as u32,
                priority,
            )
            .result()
            .map_err(driver("stream_create", device))?;
            Ok(StreamHandle(stream.assume_init() as u64))
        }
    }

    fn synchronize_stream(&self, device: DeviceId, stream: StreamHandle) -> Result<()> {
        self.bind("stream_synchronize", device)?;
        unsafe { drv::stream::synchronize(stream_ptr(stream)) }
            .map_err(driver("stream_synchronize", device))
    }

    fn destroy_stream(&self, device: DeviceId, stream: StreamHandle) -> Result<()> {
        self.bind("stream_destroy", device)?;
        unsafe { drv::stream::destroy(stream_ptr(stream)) }
            .map_err(driver("stream_destroy", device))
    }

    fn create_event(&self, device: DeviceId) -> Result<EventHandle> {
        self.bind("event_create", device)?;
        let event = drv::event::create(cu::CUevent_flags::CU_EVENT_DISABLE_TIMING)
            .map_err(driver("event_create", device))?;
        Ok(EventHandle(event as u64))
    }

    fn record_event(
        &self,
        device: DeviceId,
        event: EventHandle,
        stream: StreamHandle,
    ) -> Result<()> {
        self.bind("event_record", device)?;
        unsafe { drv::event::record(event_ptr(event), stream_ptr(stream)) }
            .map_err(driver("event_record", device))
    }

    fn synchronize_event(&self, device: DeviceId, event: EventHandle) -> Result<()> {
        self.bind("event_synchronize", device)?;
        unsafe { drv::event::synchronize(event_ptr(event)) }
            .map_err(driver("event_synchronize", device))
    }

    fn destroy_event(&self, device: DeviceId, event: EventHandle) -> Result<()> {
        self.bind("event_destroy", device)?;
        unsafe { drv::event::destroy(event_ptr(event)) }.map_err(driver("event_destroy", device))
    }

    fn alloc(&self, device: DeviceId, bytes: usize) -> Result<u64> {
        self.bind("malloc", device)?;
        unsafe { drv::malloc_sync(bytes.max(1)) }.map_err(driver("malloc", device))
    }

    unsafe fn free(&self, device: DeviceId, ptr: u64) -> Result<()> {
        self.bind("free", device)?;
        unsafe { drv::free_sync(ptr) }.map_err(driver("free", device))
    }

    unsafe fn memcpy_dtoh_async(
        &self,
        device: DeviceId,
        dst: u64,
        src: u64,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<()> {
        self.bind("memcpy_dtoh", device)?;
        unsafe {
            let dst = std::slice::from_raw_parts_mut(dst as *mut u8, bytes);
            drv::memcpy_dtoh_async(dst, src, stream_ptr(stream))
        }
        .map_err(driver("memcpy_dtoh", device))
    }

    unsafe fn memcpy_htod_async(
        &self,
        device: DeviceId,
        dst: u64,
        src: u64,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<()> {
        self.bind("memcpy_htod", device)?;
        unsafe {
            let src = std::slice::from_raw_parts(src as *const u8, bytes);
            drv::memcpy_htod_async(dst, src, stream_ptr(stream))
        }
        .map_err(driver("memcpy_htod", device))
    }

    unsafe fn memcpy_dtod_async(
        &self,
        device: DeviceId,
        dst: u64,
        src: u64,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<()> {
        self.bind("memcpy_dtod", device)?;
        unsafe { drv::memcpy_dtod_async(dst, src, bytes, stream_ptr(stream)) }
            .map_err(driver("memcpy_dtod", device))
    }

    unsafe fn dot_and_norms(
        &self,
        device: DeviceId,
        a: u64,
        b: u64,
        count: usize,
        dtype: DataType,
        scratch: &ScratchTriple,
        stream: StreamHandle,
    ) -> Result<()> {
        self.bind(DOT_NORMS, device)?;
        let s = stream_ptr(stream);
        let f = self.function(DOT_NORMS, dtype, device)?;
        for ptr in [scratch.dot, scratch.norm_a, scratch.norm_b] {
            unsafe { drv::memset_d8_async(ptr, 0, std::mem::size_of::<f64>(), s) }
                .map_err(driver("memset", device))?;
        }
        if count == 0 {
            return Ok(());
        }

        let (mut a, mut b, mut n) = (a, b, count as u64);
        let (mut dot, mut norm_a, mut norm_b) = (scratch.dot, scratch.norm_a, scratch.norm_b);
        let mut params = [
            &mut a as *mut u64 as *mut c_void,
            &mut b as *mut u64 as *mut c_void,
            &mut n as *mut u64 as *mut c_void,
            &mut dot as *mut u64 as *mut c_void,
            &mut norm_a as *mut u64 as *mut c_void,
            &mut norm_b as *mut u64 as *mut c_void,
        ];
        unsafe { self.launch(DOT_NORMS, device, f, count, s, &mut params) }
    }

    unsafe fn scaled_add(
        &self,
        device: DeviceId,
        a: u64,
        b: u64,
        count: usize,
        dtype: DataType,
        scratch: &ScratchTriple,
        stream: StreamHandle,
    ) -> Result<()> {
        self.bind(SCALED_ADD, device)?;
        let f = self.function(SCALED_ADD, dtype, device)?;
        if count == 0 {
            return Ok(());
        }

        let (mut a, mut b, mut n) = (a, b, count as u64);
        let (mut dot, mut norm_b, mut eps) = (scratch.dot, scratch.norm_b, NORM_EPSILON);
        let mut params = [
            &mut a as *mut u64 as *mut c_void,
            &mut b as *mut u64 as *mut c_void,
            &mut n as *mut u64 as *mut c_void,
            &mut dot as *mut u64 as *mut c_void,
            &mut norm_b as *mut u64 as *mut c_void,
            &mut eps as *mut f64 as *mut c_void,
        ];
        unsafe { self.launch(SCALED_ADD, device, f, count, stream_ptr(stream), &mut params) }
    }

    fn collective_unique_id(&self) -> Result<CollectiveId> {
        let id = nccl::get_uniqueid().map_err(nccl_err("get_unique_id"))?;
        Ok(id_from_sys(&id))
    }

    fn collective_init(
        &self,
        id: &CollectiveId,
        nranks: u32,
        rank: Rank,
        device: DeviceId,
    ) -> Result<CollectiveHandle> {
        self.bind("comm_init_rank", device)?;
        let mut comm = MaybeUninit::uninit();
        let comm = unsafe {
            nccl::comm_init_rank(comm.as_mut_ptr(), nranks as i32, id_to_sys(id), rank as i32)
                .map_err(nccl_err("comm_init_rank"))?;
            comm.assume_init()
        };
        let handle = comm as u64;
        self.comms
            .lock()
            .map_err(|_| AdasumError::LockPoisoned("nccl communicators"))?
            .insert(handle, device);
        tracing::debug!(rank, nranks, device, "nccl communicator initialised");
        Ok(CollectiveHandle(handle))
    }

    unsafe fn collective_reduce_sum(
        &self,
        comm: CollectiveHandle,
        send: u64,
        recv: u64,
        count: usize,
        dtype: DataType,
        root: Rank,
        stream: StreamHandle,
    ) -> Result<()> {
        let device = self.comm_device("reduce", comm)?;
        self.bind("reduce", device)?;
        unsafe {
            nccl::reduce(
                send as *const c_void,
                recv as *mut c_void,
                count,
                to_nccl_dtype(dtype),
                sys::ncclRedOp_t::ncclSum,
                root as i32,
                comm.0 as sys::ncclComm_t,
                stream.0 as sys::cudaStream_t,
            )
        }
        .map(|_| ())
        .map_err(nccl_err("reduce"))
    }

    unsafe fn collective_broadcast(
        &self,
        comm: CollectiveHandle,
        buf: u64,
        count: usize,
        dtype: DataType,
        root: Rank,
        stream: StreamHandle,
    ) -> Result<()> {
        let device = self.comm_device("broadcast", comm)?;
        self.bind("broadcast", device)?;
        let p = buf as *mut c_void;
        unsafe {
            nccl::broadcast(
                p as *const c_void,
                p,
                count,
                to_nccl_dtype(dtype),
                root as i32,
                comm.0 as sys::ncclComm_t,
                stream.0 as sys::cudaStream_t,
            )
        }
        .map(|_| ())
        .map_err(nccl_err("broadcast"))
    }

    fn collective_destroy(&self, comm: CollectiveHandle) -> Result<()> {
        let removed = self
            .comms
            .lock()
            .map_err(|_| AdasumError::LockPoisoned("nccl communicators"))?
            .remove(&comm.0);
        if removed.is_none() {
            return Err(AdasumError::DeviceCollective {
                call: "comm_destroy",
                message: format!("unknown communicator {:#x}", comm.0),
            });
        }
        unsafe { nccl::comm_destroy(comm.0 as sys::ncclComm_t) }
            .map(|_| ())
            .map_err(nccl_err("comm_destroy"))
    }
}

impl Drop for CudaRuntime {
    fn drop(&mut self) {
        let Ok(contexts) = self.contexts.get_mut() else {
            return;
        };
        if let Ok(cache) = self.kernels.get_mut() {
            for (device, loaded) in cache.modules.drain() {
                let Some(&ctx) = contexts.get(&device) else {
                    continue;
                };
                let unloaded = unsafe {
                    drv::ctx::set_current(ctx as cu::CUcontext)
                        .and_then(|()| drv::module::unload(loaded.module as cu::CUmodule))
                };
                if let Err(e) = unloaded {
                    tracing::warn!(device, error = %e, "failed to unload kernel module");
                }
            }
        }
        for (&device, _) in contexts.iter() {
            let Ok(ordinal) = device_ordinal("primary_ctx_release", device) else {
                continue;
            };
            let released = drv::device::get(ordinal)
                .and_then(|dev| unsafe { drv::primary_ctx::release(dev) });
            if let Err(e) = released {
                tracing::warn!(device, error = %e, "failed to release primary context");
            }
        }
    }
}
