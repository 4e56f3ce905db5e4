pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;

use std::ops::BitOr;

use ndarray::ArrayD;
use tracing::warn;

use crate::errors::{FlintError, FlintResult};
use crate::graph::{Graph, NodeId};
#[cfg(feature = "cuda")]
use crate::ops::Op;
use crate::tensor::{data_to_array, Data, Element};
#[cfg(feature = "cuda")]
use crate::types::shape_size;

/// Which execution backends a graph may use. `BOTH` enables the per-node
/// cost selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backends(u8);

impl Backends {
    pub const CPU: Backends = Backends(1);
    pub const GPU: Backends = Backends(2);
    pub const BOTH: Backends = Backends(3);

    pub fn has_cpu(self) -> bool {
        self.0 & 1 != 0
    }

    pub fn has_gpu(self) -> bool {
        self.0 & 2 != 0
    }
}

impl BitOr for Backends {
    type Output = Backends;
    fn bitor(self, rhs: Backends) -> Backends {
        Backends(self.0 | rhs.0)
    }
}

/// Owns the execution resources of one graph: the lazily created CPU worker
/// pool and, when compiled in, the GPU context with its kernel cache.
pub struct Engine {
    backends: Backends,
    cpu_pool: Option<cpu::CpuPool>,
    #[cfg(feature = "cuda")]
    pub(crate) gpu: Option<cuda::GpuContext>,
}

impl Engine {
    pub(crate) fn new(backends: Backends) -> Engine {
        Engine {
            backends,
            cpu_pool: None,
            #[cfg(feature = "cuda")]
            gpu: None,
        }
    }

    pub(crate) fn backends(&self) -> Backends {
        self.backends
    }

    pub(crate) fn pool(&mut self) -> &cpu::CpuPool {
        self.cpu_pool.get_or_insert_with(cpu::CpuPool::new)
    }

    /// True when GPU dispatch is both requested and compiled in.
    #[cfg(feature = "cuda")]
    pub(crate) fn gpu_active(&self) -> bool {
        self.backends.has_gpu()
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn gpu_context(&mut self) -> FlintResult<&mut cuda::GpuContext> {
        if self.gpu.is_none() {
            self.gpu = Some(cuda::GpuContext::new()?);
        }
        Ok(self.gpu.as_mut().expect("context just created"))
    }

    /// Waits for all in-flight device work; must precede any deallocation a
    /// running kernel may still reference.
    #[cfg(feature = "cuda")]
    pub(crate) fn memory_barrier(&mut self) {
        if let Some(gpu) = &self.gpu {
            gpu.synchronize();
        }
    }

    /// Tears the worker pool down via poison pills and unconditional joins.
    /// The engine is re-initializable: the next execution recreates the pool.
    pub fn cleanup(&mut self) {
        self.cpu_pool = None;
    }
}

impl Graph {
    /// Tears down the execution resources; they are lazily recreated by the
    /// next execution.
    pub fn cleanup(&mut self) {
        self.engine.cleanup();
    }

    /// Materializes the node on the backend chosen by the per-node cost
    /// heuristic. Results are memoized on the nodes they belong to.
    pub fn execute(&mut self, node: NodeId) -> FlintResult<()> {
        self.try_node(node)?;
        let backends = self.engine.backends();
        #[cfg(feature = "cuda")]
        if backends.has_gpu() {
            if !backends.has_cpu() || self.select_gpu(node) {
                return self.execute_gpu_backend(node);
            }
            return self.execute_cpu_backend(node);
        }
        if !backends.has_cpu() {
            warn!("requested backend is unavailable in this build, running on CPU");
        }
        self.execute_cpu_backend(node)
    }

    /// Execute plus sync-back: afterwards the node's result is readable from
    /// host memory.
    pub fn calculate_result(&mut self, node: NodeId) -> FlintResult<()> {
        self.execute(node)?;
        self.sync_memory(node)
    }

    /// Bridges a device-only result into a freshly allocated host buffer.
    pub fn sync_memory(&mut self, node: NodeId) -> FlintResult<()> {
        let result = self
            .try_node(node)?
            .result
            .as_ref()
            .ok_or_else(|| FlintError::Internal("sync_memory on an unexecuted node".into()))?;
        if result.has_cpu() {
            return Ok(());
        }
        #[cfg(feature = "cuda")]
        {
            return self.sync_memory_from_gpu(node);
        }
        #[cfg(not(feature = "cuda"))]
        Err(FlintError::Internal(
            "executed node has neither host nor device buffer".into(),
        ))
    }

    /// Flat host copy of the node's result, converting when the requested
    /// element type differs.
    pub fn values<T: Element>(&mut self, node: NodeId) -> FlintResult<Vec<T>> {
        self.calculate_result(node)?;
        let data = self
            .node(node)
            .result
            .as_ref()
            .and_then(|r| r.cpu.clone())
            .ok_or_else(|| FlintError::Internal("result lost its host buffer".into()))?;
        Ok(match T::slice_of(&data) {
            Some(slice) => slice.to_vec(),
            None => (0..data.len())
                .map(|i| T::from_f64(data.get_f64(i)))
                .collect(),
        })
    }

    /// The node's result as a host ndarray in its own shape.
    pub fn array<T: Element>(&mut self, node: NodeId) -> FlintResult<ArrayD<T>> {
        self.calculate_result(node)?;
        let shape = self.shape(node).to_vec();
        let data = self
            .node(node)
            .result
            .as_ref()
            .and_then(|r| r.cpu.clone())
            .ok_or_else(|| FlintError::Internal("result lost its host buffer".into()))?;
        data_to_array(&data, &shape)
    }

    /// Serializes execution of the node's whole unexecuted cone on the host
    /// (after the execute call the host buffer is attached).
    pub(crate) fn host_data(&mut self, node: NodeId) -> FlintResult<std::sync::Arc<Data>> {
        self.calculate_result(node)?;
        self.node(node)
            .result
            .as_ref()
            .and_then(|r| r.cpu.clone())
            .ok_or_else(|| FlintError::Internal("result lost its host buffer".into()))
    }

    /// Per-node dispatch heuristic: the output size times the accumulated
    /// per-element score of the unexecuted cone, boosted towards the side
    /// already holding the predecessors' buffers.
    #[cfg(feature = "cuda")]
    fn select_gpu(&self, node: NodeId) -> bool {
        let n = shape_size(self.shape(node));
        let sg = self.score_sum(node);
        let mut cpu_boost = 2usize;
        let mut gpu_boost = 2usize;
        for &p in &self.node(node).predecessors {
            if let Some(result) = &self.node(p).result {
                if !result.has_cpu() {
                    cpu_boost = 1;
                }
                if !result.has_gpu() {
                    gpu_boost = 1;
                }
            }
        }
        n * sg * gpu_boost / cpu_boost >= 1024
    }

    /// Sum of operation scores over the node's unexecuted backward cone.
    #[cfg(feature = "cuda")]
    pub(crate) fn score_sum(&self, node: NodeId) -> usize {
        let mut todo = vec![node];
        let mut score = 0usize;
        while let Some(curr) = todo.pop() {
            let n = self.node(curr);
            score += n.op.score();
            for &p in &n.predecessors {
                let pred = self.node(p);
                if pred.result.is_none() && !matches!(pred.op, Op::Store(_)) {
                    todo.push(p);
                }
            }
        }
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmask_composition() {
        assert_eq!(Backends::CPU | Backends::GPU, Backends::BOTH);
        assert!(Backends::BOTH.has_cpu());
        assert!(Backends::BOTH.has_gpu());
        assert!(!Backends::CPU.has_gpu());
    }
}
