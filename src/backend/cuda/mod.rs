//! GPU execution through CUDA. Kernel sources are generated at runtime
//! (fused over a sub-DAG in lazy mode, parameterized per operation in eager
//! mode), compiled through NVRTC and held in a persistent cache. A single
//! stream serializes submissions; an explicit synchronize after each launch
//! enforces happens-before with subsequent host reads and frees.

pub mod eager;
pub mod lazy;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use cudarc::driver::{CudaDevice, CudaFunction, CudaSlice, DevicePtr, LaunchAsync, LaunchConfig};
use tracing::{debug, info, warn};

use crate::errors::{FlintError, FlintResult};
use crate::graph::{Graph, NodeId};
use crate::ops::Op;
use crate::tensor::{Data, ResultData};
use crate::types::{shape_size, FType};

/// A device buffer of one of the four element types, shared between the
/// node owning it and in-flight launches.
#[derive(Debug, Clone)]
pub struct GpuBuf(pub(crate) Arc<GpuSlice>);

pub(crate) enum GpuSlice {
    I32(CudaSlice<i32>),
    I64(CudaSlice<i64>),
    F32(CudaSlice<f32>),
    F64(CudaSlice<f64>),
}

impl std::fmt::Debug for GpuSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (t, n) = match self {
            GpuSlice::I32(s) => ("i32", s.len()),
            GpuSlice::I64(s) => ("i64", s.len()),
            GpuSlice::F32(s) => ("f32", s.len()),
            GpuSlice::F64(s) => ("f64", s.len()),
        };
        write!(f, "GpuSlice<{t}>[{n}]")
    }
}

impl GpuBuf {
    pub(crate) fn device_ptr(&self) -> u64 {
        match self.0.as_ref() {
            GpuSlice::I32(s) => *s.device_ptr(),
            GpuSlice::I64(s) => *s.device_ptr(),
            GpuSlice::F32(s) => *s.device_ptr(),
            GpuSlice::F64(s) => *s.device_ptr(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self.0.as_ref() {
            GpuSlice::I32(s) => s.len(),
            GpuSlice::I64(s) => s.len(),
            GpuSlice::F32(s) => s.len(),
            GpuSlice::F64(s) => s.len(),
        }
    }

    pub(crate) fn ftype(&self) -> FType {
        match self.0.as_ref() {
            GpuSlice::I32(_) => FType::I32,
            GpuSlice::I64(_) => FType::I64,
            GpuSlice::F32(_) => FType::F32,
            GpuSlice::F64(_) => FType::F64,
        }
    }
}

/// Device handle, command stream and the two kernel caches.
pub struct GpuContext {
    dev: Arc<CudaDevice>,
    /// Fused kernels, keyed by their full source.
    cache: HashMap<String, CudaFunction>,
    /// Eager kernels, keyed by (op, result type, parameter types) packed
    /// into an integer.
    eager_cache: HashMap<u64, CudaFunction>,
    module_count: usize,
}

impl GpuContext {
    pub(crate) fn new() -> FlintResult<GpuContext> {
        let dev = CudaDevice::new(0)
            .map_err(|e| FlintError::Ocl(format!("could not initialize CUDA device 0: {e:?}")))?;
        info!("GPU backend initialized");
        Ok(GpuContext {
            dev,
            cache: HashMap::new(),
            eager_cache: HashMap::new(),
            module_count: 0,
        })
    }

    pub(crate) fn synchronize(&self) {
        if let Err(e) = self.dev.synchronize() {
            warn!("device synchronize failed: {e:?}");
        }
    }

    fn compile(&mut self, source: &str, fn_name: &'static str) -> FlintResult<CudaFunction> {
        let ptx = cudarc::nvrtc::compile_ptx(source).map_err(|e| {
            FlintError::Ocl(format!("kernel compilation failed: {e:?}\nsource:\n{source}"))
        })?;
        let module = format!("flint_mod_{}", self.module_count);
        self.module_count += 1;
        self.dev
            .load_ptx(ptx, &module, &[fn_name])
            .map_err(|e| FlintError::Ocl(format!("could not load compiled module: {e:?}")))?;
        self.dev
            .get_func(&module, fn_name)
            .ok_or_else(|| FlintError::Ocl("compiled kernel vanished from its module".into()))
    }

    /// Cache lookup by source; a compile failure evicts the cache and
    /// retries exactly once.
    pub(crate) fn get_kernel(
        &mut self,
        source: &str,
        fn_name: &'static str,
    ) -> FlintResult<CudaFunction> {
        if let Some(func) = self.cache.get(source) {
            debug!("kernel from cache");
            return Ok(func.clone());
        }
        debug!("compiling kernel:\n{source}");
        let func = match self.compile(source, fn_name) {
            Ok(func) => func,
            Err(first) => {
                warn!("kernel creation failed, retrying with an empty cache: {first}");
                self.cache.clear();
                self.eager_cache.clear();
                self.compile(source, fn_name)?
            }
        };
        self.cache.insert(source.to_string(), func.clone());
        Ok(func)
    }

    fn upload(&self, data: &Data) -> FlintResult<GpuBuf> {
        let err = |e| FlintError::Ocl(format!("could not load data to the GPU: {e:?}"));
        let slice = match data {
            Data::I32(v) => GpuSlice::I32(self.dev.htod_sync_copy(v).map_err(err)?),
            Data::I64(v) => GpuSlice::I64(self.dev.htod_sync_copy(v).map_err(err)?),
            Data::F32(v) => GpuSlice::F32(self.dev.htod_sync_copy(v).map_err(err)?),
            Data::F64(v) => GpuSlice::F64(self.dev.htod_sync_copy(v).map_err(err)?),
        };
        Ok(GpuBuf(Arc::new(slice)))
    }

    fn alloc(&self, ftype: FType, len: usize) -> FlintResult<GpuBuf> {
        let err = |e| FlintError::Ocl(format!("could not create device buffer: {e:?}"));
        let slice = match ftype {
            FType::I32 => GpuSlice::I32(self.dev.alloc_zeros(len).map_err(err)?),
            FType::I64 => GpuSlice::I64(self.dev.alloc_zeros(len).map_err(err)?),
            FType::F32 => GpuSlice::F32(self.dev.alloc_zeros(len).map_err(err)?),
            FType::F64 => GpuSlice::F64(self.dev.alloc_zeros(len).map_err(err)?),
        };
        Ok(GpuBuf(Arc::new(slice)))
    }

    fn download(&self, buf: &GpuBuf) -> FlintResult<Data> {
        let err = |e| FlintError::Ocl(format!("could not read back device buffer: {e:?}"));
        Ok(match buf.0.as_ref() {
            GpuSlice::I32(s) => Data::I32(self.dev.dtoh_sync_copy(s).map_err(err)?),
            GpuSlice::I64(s) => Data::I64(self.dev.dtoh_sync_copy(s).map_err(err)?),
            GpuSlice::F32(s) => Data::F32(self.dev.dtoh_sync_copy(s).map_err(err)?),
            GpuSlice::F64(s) => Data::F64(self.dev.dtoh_sync_copy(s).map_err(err)?),
        })
    }

    /// Enqueues a kernel over `n` elements. All buffer addresses travel in
    /// one pointer table (result first), op metadata in `meta`; the trailing
    /// synchronize is the finish barrier required before host reads and
    /// frees.
    fn launch(
        &self,
        func: CudaFunction,
        pointer_table: &[u64],
        meta: &[i64],
        n: usize,
    ) -> FlintResult<()> {
        let err = |e| FlintError::Ocl(format!("kernel launch failed: {e:?}"));
        let pt = self
            .dev
            .htod_sync_copy(pointer_table)
            .map_err(|e| FlintError::Ocl(format!("could not upload pointer table: {e:?}")))?;
        let meta_buf = if meta.is_empty() { vec![0i64] } else { meta.to_vec() };
        let meta_dev = self
            .dev
            .htod_sync_copy(&meta_buf)
            .map_err(|e| FlintError::Ocl(format!("could not upload metadata: {e:?}")))?;
        let cfg = LaunchConfig::for_num_elems(n as u32);
        unsafe { func.launch(cfg, (&pt, &meta_dev, n as i64)) }.map_err(err)?;
        self.dev
            .synchronize()
            .map_err(|e| FlintError::Ocl(format!("device synchronize failed: {e:?}")))?;
        Ok(())
    }
}

/// Operations the fused code generator cannot inline; they are materialized
/// through their eager kernels and enter fused kernels as parameters.
pub(crate) fn is_fusion_barrier(op: &Op) -> bool {
    matches!(
        op,
        Op::Convolve { .. }
            | Op::GradientConvolve1 { .. }
            | Op::GradientConvolve2 { .. }
            | Op::PoolingSum { .. }
            | Op::PoolingMax { .. }
            | Op::GradientPoolingMax { .. }
            | Op::Index
            | Op::IndexSet
            | Op::SlidingWindow { .. }
            | Op::UnslideWindow { .. }
            | Op::Concat { .. }
            | Op::Dropout { .. }
            | Op::Random { .. }
            | Op::Arange { .. }
    )
}

/// Reductions read their child by direct parameter reference inside the
/// fused kernel, so the child must be materialized beforehand.
fn needs_materialized_child(op: &Op) -> bool {
    matches!(
        op,
        Op::ReduceSum { .. } | Op::ReduceMul { .. } | Op::ReduceMin { .. } | Op::ReduceMax { .. }
    )
}

impl Graph {
    pub(crate) fn execute_gpu_backend(&mut self, root: NodeId) -> FlintResult<()> {
        if let Some(result) = &self.try_node(root)?.result {
            if result.has_gpu() || result.has_cpu() {
                return Ok(());
            }
        }
        if let Op::Store(data) = &self.node(root).op {
            let result = ResultData::from_cpu(Arc::clone(data));
            self.node_mut(root).result = Some(result);
            return Ok(());
        }
        self.prepare_gpu_subgraph(root)?;
        if is_fusion_barrier(&self.node(root).op) || self.is_eager() {
            return self.execute_gpu_eager(root);
        }
        self.execute_gpu_fused(root)
    }

    /// Materializes every fusion barrier in the unexecuted sub-DAG and the
    /// children of reductions, bottom-up.
    fn prepare_gpu_subgraph(&mut self, root: NodeId) -> FlintResult<()> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(curr) = stack.pop() {
            if !seen.insert(curr) {
                continue;
            }
            order.push(curr);
            if self.node(curr).result.is_some() {
                continue;
            }
            for &p in &self.node(curr).predecessors {
                stack.push(p);
            }
        }
        // deepest first
        for &curr in order.iter().rev() {
            if self.node(curr).result.is_some() || curr == root {
                continue;
            }
            let op_is_barrier = is_fusion_barrier(&self.node(curr).op);
            if op_is_barrier && !matches!(self.node(curr).op, Op::Store(_)) {
                self.execute_gpu_eager(curr)?;
            }
        }
        // children of reductions become parameters of the fused kernel
        let mut stack = vec![root];
        let mut seen = HashSet::new();
        while let Some(curr) = stack.pop() {
            if !seen.insert(curr) || self.node(curr).result.is_some() {
                continue;
            }
            let preds = self.node(curr).predecessors.clone();
            if needs_materialized_child(&self.node(curr).op) {
                for p in preds.iter() {
                    if self.node(*p).result.is_none()
                        && !matches!(self.node(*p).op, Op::Store(_))
                    {
                        self.execute_gpu_backend(*p)?;
                    }
                }
            }
            for p in preds {
                stack.push(p);
            }
        }
        Ok(())
    }

    /// Lazy mode: one fused kernel computing the whole remaining sub-DAG.
    fn execute_gpu_fused(&mut self, root: NodeId) -> FlintResult<()> {
        let generated = lazy::generate(self, root);
        let n = shape_size(self.shape(root));
        let func = self
            .engine
            .gpu_context()?
            .get_kernel(&generated.source, "execute_graph")?;
        let params = generated.parameters;
        let mut bufs = Vec::with_capacity(params.len());
        for &p in &params {
            bufs.push(self.gpu_param_buffer(p)?);
        }
        let out = self.gpu_output_buffer(root, &params, &bufs)?;
        let mut pointers = Vec::with_capacity(params.len() + 1);
        pointers.push(out.device_ptr());
        pointers.extend(bufs.iter().map(GpuBuf::device_ptr));
        {
            let ctx = self.engine.gpu_context()?;
            ctx.launch(func, &pointers, &[], n)?;
        }
        self.attach_gpu_result(root, out, n);
        Ok(())
    }

    /// Eager mode: a parameterized per-operation kernel.
    pub(crate) fn execute_gpu_eager(&mut self, node: NodeId) -> FlintResult<()> {
        if let Some(result) = &self.node(node).result {
            if result.has_gpu() {
                return Ok(());
            }
        }
        if let Op::Store(data) = &self.node(node).op {
            let data = Arc::clone(data);
            let buf = self.engine.gpu_context()?.upload(&data)?;
            let mut result = ResultData::from_cpu(data);
            result.gpu = Some(buf);
            self.node_mut(node).result = Some(result);
            return Ok(());
        }
        // parameters are the direct predecessors
        let preds = self.node(node).predecessors.clone();
        for &p in &preds {
            if self.node(p).result.is_none() && !matches!(self.node(p).op, Op::Store(_)) {
                self.execute_gpu_backend(p)?;
            }
        }
        let n = shape_size(self.shape(node));
        let op = self.node(node).op.clone();
        let res_type = self.ftype(node);
        let param_types: Vec<FType> = preds.iter().map(|&p| self.ftype(p)).collect();
        let key = eager::cache_key(&op, res_type, &param_types);
        let cached = self
            .engine
            .gpu_context()?
            .eager_cache
            .get(&key)
            .cloned();
        let func = match cached {
            Some(func) => func,
            None => {
                let source = eager::source(&op, res_type, &param_types);
                let func = self
                    .engine
                    .gpu_context()?
                    .get_kernel(&source, "execute_op")?;
                self.engine
                    .gpu_context()?
                    .eager_cache
                    .insert(key, func.clone());
                func
            }
        };
        let meta = eager::meta(self, node);
        let mut bufs = Vec::with_capacity(preds.len());
        for &p in &preds {
            bufs.push(self.gpu_param_buffer(p)?);
        }
        let out = self.gpu_output_buffer(node, &preds, &bufs)?;
        let mut pointers = Vec::with_capacity(preds.len() + 1);
        pointers.push(out.device_ptr());
        pointers.extend(bufs.iter().map(GpuBuf::device_ptr));
        {
            let ctx = self.engine.gpu_context()?;
            ctx.launch(func, &pointers, &meta, n)?;
        }
        self.attach_gpu_result(node, out, n);
        Ok(())
    }

    /// Device buffer of a parameter node, uploading (and memoizing the
    /// upload) when only a host buffer exists.
    fn gpu_param_buffer(&mut self, node: NodeId) -> FlintResult<GpuBuf> {
        if let Some(result) = &self.node(node).result {
            if let Some(gpu) = &result.gpu {
                return Ok(gpu.clone());
            }
        }
        let data: Arc<Data> = match (&self.node(node).op, &self.node(node).result) {
            (_, Some(result)) => result
                .cpu
                .clone()
                .ok_or_else(|| FlintError::Internal("parameter has no buffer".into()))?,
            (Op::Store(data), None) => Arc::clone(data),
            (Op::Constant(value), None) => {
                // constants fold into fused sources, but as an eager
                // parameter they need one materialized element
                let data = Data::alloc(value.ftype(), 1);
                crate::ops::generators::fill_constant(*value, &unsafe { data.raw_shared() }, 0, 1);
                Arc::new(data)
            }
            _ => {
                return Err(FlintError::Internal(
                    "unexecuted parameter in a GPU launch".into(),
                ))
            }
        };
        let buf = self.engine.gpu_context()?.upload(&data)?;
        let node_mut = self.node_mut(node);
        match &mut node_mut.result {
            Some(result) => result.gpu = Some(buf.clone()),
            None => {
                let mut result = ResultData::from_cpu(data);
                result.gpu = Some(buf.clone());
                node_mut.result = Some(result);
            }
        }
        Ok(buf)
    }

    /// Output buffer for a launch: a parameter reachable over reuse-allowed
    /// edges whose node has no other consumer forfeits its buffer (it stays
    /// bound as an input, so the kernel computes in place), otherwise a
    /// fresh buffer is allocated.
    fn gpu_output_buffer(
        &mut self,
        root: NodeId,
        params: &[NodeId],
        bufs: &[GpuBuf],
    ) -> FlintResult<GpuBuf> {
        let ftype = self.ftype(root);
        let n = shape_size(self.shape(root));
        if let Some(victim) = self.find_gpu_reuse(root, params) {
            let slot = params.iter().position(|&p| p == victim);
            if let Some(slot) = slot {
                let buf = bufs[slot].clone();
                if buf.len() == n && buf.ftype() == ftype {
                    // forfeit: the source loses its buffers before the
                    // destination writes
                    self.node_mut(victim).result = None;
                    return Ok(buf);
                }
            }
        }
        self.engine.gpu_context()?.alloc(ftype, n)
    }

    /// Breadth-first search from the root over reuse-allowed edges for a
    /// parameter that is held by nothing but this computation.
    fn find_gpu_reuse(&self, root: NodeId, params: &[NodeId]) -> Option<NodeId> {
        let mut queue = VecDeque::new();
        let mut seen = HashSet::new();
        queue.push_back(root);
        while let Some(curr) = queue.pop_front() {
            if !seen.insert(curr) {
                continue;
            }
            let node = self.node(curr);
            let reuse = node.op.reuse_inputs(node.predecessors.len());
            for (i, &p) in node.predecessors.iter().enumerate() {
                if !reuse[i] {
                    continue;
                }
                let pred = self.node(p);
                let eligible = pred.ref_count == 1
                    && !matches!(pred.op, Op::Store(_))
                    && !self.is_gradient_variable(p)
                    && pred.shape == node.shape
                    && pred.ftype == node.ftype;
                if eligible && params.contains(&p) {
                    return Some(p);
                }
                if eligible {
                    queue.push_back(p);
                }
            }
        }
        None
    }

    fn attach_gpu_result(&mut self, node: NodeId, buf: GpuBuf, entries: usize) {
        self.node_mut(node).result = Some(ResultData::from_gpu(buf, entries));
    }

    /// Read-back of a device-only result into a fresh host buffer.
    pub(crate) fn sync_memory_from_gpu(&mut self, node: NodeId) -> FlintResult<()> {
        let buf = self
            .node(node)
            .result
            .as_ref()
            .and_then(|r| r.gpu.clone())
            .ok_or_else(|| FlintError::Internal("sync requested without a device buffer".into()))?;
        let data = self.engine.gpu_context()?.download(&buf)?;
        if let Some(result) = &mut self.node_mut(node).result {
            result.cpu = Some(Arc::new(data));
        }
        Ok(())
    }
}
