pub mod autograd;
pub mod build;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::backend::{Backends, Engine};
use crate::errors::{FlintError, FlintResult};
use crate::ops::Op;
use crate::tensor::{Data, ResultData};
use crate::types::FType;

/// Stable identifier of a node inside one [`Graph`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// A node of the operation DAG. Mutation after creation is confined to
/// reference-count changes, result attachment after execution and the
/// store-demotion done by [`Graph::optimize_memory`].
#[derive(Debug)]
pub(crate) struct Node {
    pub op: Op,
    pub predecessors: Vec<NodeId>,
    /// In-edges plus external handles.
    pub ref_count: usize,
    pub result: Option<ResultData>,
    /// The gradient variables whose derivative flows through this node.
    pub gradient_trace: Option<HashSet<NodeId>>,
    pub shape: Vec<usize>,
    pub ftype: FType,
    /// Detected broadcasting mode of this node's own operation:
    /// false = trailing-axis alignment, true = leading-axis alignment.
    pub inverse_broadcast: bool,
    /// Set by `enforce_inverse_broadcasting`: consumers of this node resolve
    /// an ambiguous alignment towards the leading axes.
    pub prefer_inverse: bool,
}

/// The operation graph: an arena of reference-counted nodes plus the engine
/// executing them. Graph building and execution are single-threaded by
/// contract; independent graphs are independent.
pub struct Graph {
    nodes: Vec<Option<Node>>,
    free_slots: Vec<usize>,
    gradient_context: bool,
    eager: bool,
    pub(crate) engine: Engine,
}

impl Graph {
    pub fn new(backends: Backends) -> Graph {
        Graph {
            nodes: Vec::new(),
            free_slots: Vec::new(),
            gradient_context: false,
            eager: false,
            engine: Engine::new(backends),
        }
    }

    /// Turns on gradient-trace tracking for subsequently built nodes.
    pub fn start_gradient_context(&mut self) {
        self.gradient_context = true;
    }

    pub fn stop_gradient_context(&mut self) {
        self.gradient_context = false;
    }

    pub fn is_gradient_context(&self) -> bool {
        self.gradient_context
    }

    /// When set, every builder materializes its node immediately.
    pub fn set_eager(&mut self, eager: bool) {
        self.eager = eager;
    }

    pub fn is_eager(&self) -> bool {
        self.eager
    }

    pub fn shape(&self, id: NodeId) -> &[usize] {
        &self.node(id).shape
    }

    pub fn ftype(&self, id: NodeId) -> FType {
        self.node(id).ftype
    }

    pub fn result_data(&self, id: NodeId) -> Option<&ResultData> {
        self.node(id).result.as_ref()
    }

    pub fn reference_count(&self, id: NodeId) -> usize {
        self.node(id).ref_count
    }

    /// Number of live nodes in the arena, used by leak checks.
    pub fn live_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.0].as_ref().expect("stale node id")
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.0].as_mut().expect("stale node id")
    }

    pub(crate) fn try_node(&self, id: NodeId) -> FlintResult<&Node> {
        self.nodes
            .get(id.0)
            .and_then(|n| n.as_ref())
            .ok_or_else(|| FlintError::Internal(format!("node {} was already freed", id.0)))
    }

    /// Inserts a node, taking one in-edge reference on every predecessor and
    /// handing the caller an external handle.
    pub(crate) fn add_node(
        &mut self,
        op: Op,
        predecessors: Vec<NodeId>,
        shape: Vec<usize>,
        ftype: FType,
        inverse_broadcast: bool,
    ) -> NodeId {
        for &p in &predecessors {
            self.node_mut(p).ref_count += 1;
        }
        let node = Node {
            op,
            predecessors,
            ref_count: 1,
            result: None,
            gradient_trace: None,
            shape,
            ftype,
            inverse_broadcast,
            prefer_inverse: false,
        };
        let id = match self.free_slots.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        };
        self.configure_gradient_trace(id);
        id
    }

    /// Propagates the union of the predecessors' gradient traces, dropping
    /// members that were unmarked in the meantime. Only active inside a
    /// gradient context.
    fn configure_gradient_trace(&mut self, id: NodeId) {
        if !self.gradient_context {
            return;
        }
        let preds = self.node(id).predecessors.clone();
        let mut trace: Option<HashSet<NodeId>> = None;
        for p in preds {
            let members: Vec<NodeId> = match &self.node(p).gradient_trace {
                Some(t) => t.iter().copied().collect(),
                None => continue,
            };
            let dst = trace.get_or_insert_with(HashSet::new);
            for m in members {
                if self.is_gradient_variable(m) {
                    dst.insert(m);
                }
            }
        }
        self.node_mut(id).gradient_trace = trace;
    }

    /// Registers the node in its own gradient trace so that derivatives with
    /// respect to it can be requested later.
    pub fn mark_gradient_variable(&mut self, id: NodeId) {
        let node = self.node_mut(id);
        node.gradient_trace
            .get_or_insert_with(HashSet::new)
            .insert(id);
    }

    pub fn unmark_gradient_variable(&mut self, id: NodeId) {
        let node = self.node_mut(id);
        if let Some(trace) = &mut node.gradient_trace {
            trace.remove(&id);
            if trace.is_empty() {
                node.gradient_trace = None;
            }
        }
    }

    pub fn is_gradient_variable(&self, id: NodeId) -> bool {
        self.nodes[id.0]
            .as_ref()
            .and_then(|n| n.gradient_trace.as_ref())
            .map_or(false, |t| t.contains(&id))
    }

    pub(crate) fn trace_contains_any(&self, id: NodeId, vars: &HashSet<NodeId>) -> bool {
        match &self.node(id).gradient_trace {
            Some(trace) => trace.iter().any(|m| vars.contains(m)),
            None => false,
        }
    }

    /// Resolve an ambiguous broadcast alignment of this operand towards the
    /// leading axes.
    pub fn enforce_inverse_broadcasting(&mut self, id: NodeId) {
        self.node_mut(id).prefer_inverse = true;
    }

    pub fn unenforce_inverse_broadcasting(&mut self, id: NodeId) {
        self.node_mut(id).prefer_inverse = false;
    }

    /// Takes an additional external handle on the node.
    pub fn retain(&mut self, id: NodeId) {
        self.node_mut(id).ref_count += 1;
    }

    /// Releases one external handle. When a reference count reaches zero the
    /// node is destroyed and the release cascades into its predecessors.
    pub fn release(&mut self, id: NodeId) {
        {
            let node = self.node_mut(id);
            debug_assert!(node.ref_count > 0);
            node.ref_count -= 1;
            if node.ref_count > 0 {
                return;
            }
        }
        // in-flight kernels must complete before any buffer is reclaimed
        #[cfg(feature = "cuda")]
        self.engine.memory_barrier();
        let mut queue = VecDeque::new();
        queue.push_back(id);
        while let Some(curr) = queue.pop_front() {
            if self.node(curr).ref_count > 0 {
                continue;
            }
            let preds = std::mem::take(&mut self.node_mut(curr).predecessors);
            for p in preds {
                let pred = self.node_mut(p);
                pred.ref_count -= 1;
                if pred.ref_count == 0 {
                    queue.push_back(p);
                }
            }
            self.nodes[curr.0] = None;
            self.free_slots.push(curr.0);
        }
    }

    /// Demotes an executed node that is not a gradient source into a store
    /// node, releasing its hold on the upstream graph.
    pub fn optimize_memory(&mut self, id: NodeId) -> FlintResult<()> {
        let node = self.try_node(id)?;
        if node.gradient_trace.is_some()
            || matches!(node.op, Op::Store(_) | Op::Constant(_))
            || node.result.is_none()
        {
            return Ok(());
        }
        self.sync_memory(id)?;
        #[cfg(feature = "cuda")]
        self.engine.memory_barrier();
        let node = self.node_mut(id);
        let data: Arc<Data> = node
            .result
            .as_ref()
            .and_then(|r| r.cpu.clone())
            .ok_or_else(|| FlintError::Internal("executed node lost its buffer".into()))?;
        node.op = Op::Store(data);
        let preds = std::mem::take(&mut node.predecessors);
        for p in preds {
            self.release(p);
        }
        Ok(())
    }
}
