//! CPU execution: a fixed worker pool fed through a blocking MPMC queue and
//! a topological scheduler that materializes one node at a time, splitting
//! large outputs into contiguous ranges.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, info};

use crate::errors::{FlintError, FlintResult};
use crate::graph::{Graph, NodeId};
use crate::ops::{self, KernelCtx, Op, PredData};
use crate::tensor::{Data, RawBuf, ResultData};
use crate::types::shape_size;

/// Work score (per-element cost times output size) above which a node's
/// output is split across the worker pool.
const PARALLEL_THRESHOLD: usize = 256;

enum Task {
    Range {
        ctx: Arc<KernelCtx>,
        out: RawBuf,
        from: usize,
        len: usize,
        done: Sender<()>,
    },
    /// Poison pill: the receiving worker exits.
    Shutdown,
}

pub(crate) struct CpuPool {
    queue: Sender<Task>,
    workers: Vec<JoinHandle<()>>,
}

impl CpuPool {
    pub(crate) fn new() -> CpuPool {
        let cores = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(8);
        info!("using {cores} worker threads for the CPU backend");
        let (tx, rx) = unbounded::<Task>();
        let workers = (0..cores)
            .map(|_| {
                let rx = rx.clone();
                thread::spawn(move || loop {
                    match rx.recv() {
                        Ok(Task::Range {
                            ctx,
                            out,
                            from,
                            len,
                            done,
                        }) => {
                            ops::execute_cpu(&ctx, &out, from, len);
                            let _ = done.send(());
                        }
                        Ok(Task::Shutdown) | Err(_) => break,
                    }
                })
            })
            .collect();
        CpuPool { queue: tx, workers }
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Splits the output into contiguous ranges, one task per worker, and
    /// blocks until the completion counter drains.
    fn run_parallel(&self, ctx: Arc<KernelCtx>, out: RawBuf, size: usize) {
        let units = self.worker_count().min(size);
        let work = size / units;
        let (done_tx, done_rx) = unbounded::<()>();
        for i in 0..units {
            let to = if i == units - 1 { size } else { (i + 1) * work };
            let task = Task::Range {
                ctx: Arc::clone(&ctx),
                out,
                from: i * work,
                len: to - i * work,
                done: done_tx.clone(),
            };
            self.queue.send(task).expect("worker pool hung up");
        }
        for _ in 0..units {
            done_rx.recv().expect("worker died mid-range");
        }
    }
}

impl Drop for CpuPool {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.queue.send(Task::Shutdown);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Graph {
    /// Materializes `root` on the CPU: computes a topological order over the
    /// unexecuted cone, offloads expensive subgraphs to the GPU when both
    /// backends are active, and deposits a `ResultData` on every node it
    /// visits.
    pub(crate) fn execute_cpu_backend(&mut self, root: NodeId) -> FlintResult<()> {
        if let Some(result) = &self.try_node(root)?.result {
            if result.has_cpu() {
                return Ok(());
            }
            return self.sync_memory(root);
        }
        let order = self.collect_execution_order(root)?;
        for node in order {
            self.materialize_cpu(node, root)?;
        }
        Ok(())
    }

    /// Bottom-up traversal with duplicate removal; re-pushing an already
    /// collected node keeps shared subexpressions ahead of all consumers.
    /// Predecessors whose estimated cost crosses the adaptive dispatch
    /// threshold are executed on the GPU and synced back in place.
    fn collect_execution_order(&mut self, root: NodeId) -> FlintResult<Vec<NodeId>> {
        let mut order: VecDeque<NodeId> = VecDeque::new();
        let mut collected: HashSet<NodeId> = HashSet::new();
        let mut work: VecDeque<NodeId> = VecDeque::new();
        work.push_front(root);
        while let Some(curr) = work.pop_front() {
            self.try_node(curr)?;
            if collected.contains(&curr) {
                order.retain(|&n| n != curr);
            }
            collected.insert(curr);
            order.push_front(curr);
            if self.node(curr).result.is_some() {
                continue;
            }
            let preds = self.node(curr).predecessors.clone();
            for p in preds {
                #[cfg(feature = "cuda")]
                if self.engine.gpu_active() && self.node(p).result.is_none() {
                    let elems = shape_size(self.shape(p));
                    if self.score_sum(p) * elems >= 1024 {
                        self.execute_gpu_backend(p)?;
                        self.sync_memory(p)?;
                        if collected.contains(&p) {
                            order.retain(|&n| n != p);
                        }
                        collected.insert(p);
                        order.push_front(p);
                        continue;
                    }
                }
                work.push_back(p);
            }
        }
        Ok(order.into_iter().collect())
    }

    fn materialize_cpu(&mut self, id: NodeId, root: NodeId) -> FlintResult<()> {
        if let Some(result) = &self.node(id).result {
            if result.has_cpu() {
                return Ok(());
            }
            return self.sync_memory(id);
        }
        if let Op::Store(data) = &self.node(id).op {
            let result = ResultData::from_cpu(Arc::clone(data));
            self.node_mut(id).result = Some(result);
            return Ok(());
        }
        let size = shape_size(self.shape(id));
        let shape = self.shape(id).to_vec();
        let ftype = self.ftype(id);
        let op = self.node(id).op.clone();
        let preds = self.node(id).predecessors.clone();
        let reuse = op.reuse_inputs(preds.len());

        let mut pred_data: Vec<PredData> = Vec::with_capacity(preds.len());
        let mut stolen: Option<Arc<Data>> = None;
        for (i, &p) in preds.iter().enumerate() {
            let pred = self.try_node(p)?;
            if pred.result.is_none() {
                return Err(FlintError::Internal(format!(
                    "predecessor {} of {} was not materialized",
                    p.0,
                    op.tag_name()
                )));
            }
            if !pred.result.as_ref().map_or(false, ResultData::has_cpu) {
                self.sync_memory(p)?;
            }
            let pred = self.node(p);
            let data = pred
                .result
                .as_ref()
                .and_then(|r| r.cpu.clone())
                .ok_or_else(|| FlintError::Internal("lost host buffer".into()))?;
            // steal the buffer of a predecessor used only here, unless it is
            // a store or a gradient source
            let can_steal = stolen.is_none()
                && reuse[i]
                && p != root
                && p != id
                && pred.ref_count == 1
                && !matches!(pred.op, Op::Store(_))
                && !self.is_gradient_variable(p)
                && pred.shape == shape
                && pred.ftype == ftype;
            pred_data.push(PredData {
                shape: self.node(p).shape.clone(),
                data: Arc::clone(&data),
            });
            if can_steal {
                self.node_mut(p).result = None;
                stolen = Some(data);
            }
        }

        let out_arc = match stolen {
            Some(buffer) => buffer,
            None => Arc::new(Data::try_alloc(ftype, size)?),
        };
        // the allocation outlives the range tasks: run_parallel blocks until
        // every worker released the completion counter
        let raw = unsafe { out_arc.raw_shared() };
        let score = op.score();
        let ctx = Arc::new(KernelCtx {
            op,
            ftype,
            shape,
            inverse_broadcast: self.node(id).inverse_broadcast,
            preds: pred_data,
        });
        let pool = self.engine.pool();
        if score * size >= PARALLEL_THRESHOLD && size >= pool.worker_count() {
            debug!(
                "parallel execution of {} over {size} elements (score {score})",
                ctx.op.tag_name()
            );
            pool.run_parallel(ctx, raw, size);
        } else {
            debug!(
                "sequential execution of {} over {size} elements (score {score})",
                ctx.op.tag_name()
            );
            ops::execute_cpu(&ctx, &raw, 0, size);
        }
        self.node_mut(id).result = Some(ResultData::from_cpu(out_arc));
        Ok(())
    }
}
