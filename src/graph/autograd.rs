//! Reverse-mode differentiation: backward-cone collection, per-operation
//! local gradients and adjoint accumulation.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::warn;

use crate::errors::{FlintError, FlintResult};
use crate::graph::{Graph, NodeId};
use crate::ops::Op;

impl Graph {
    /// dy/dx for a single variable, see [`Graph::calculate_gradients`].
    pub fn calculate_gradient(&mut self, y: NodeId, x: NodeId) -> FlintResult<NodeId> {
        let mut grads = self.calculate_gradients(y, &[x])?;
        Ok(grads.remove(0))
    }

    /// Computes the adjoints of `y` with respect to every `x`. Each `x` must
    /// have been marked as a gradient variable while the graph was built
    /// inside a gradient context; the returned nodes are owned by the caller.
    pub fn calculate_gradients(&mut self, y: NodeId, xs: &[NodeId]) -> FlintResult<Vec<NodeId>> {
        let vars: HashSet<NodeId> = xs.iter().copied().collect();
        if self.node(y).gradient_trace.is_none() || !self.trace_contains_any(y, &vars) {
            return Err(FlintError::IllegalDerive);
        }
        for &x in xs {
            if !self.is_gradient_variable(x) {
                warn!("derivative target was not marked during graph construction");
            }
        }
        let (order, visited) = self.collect_backward_cone(y, &vars);

        let mut adjoints: HashMap<NodeId, NodeId> = HashMap::new();
        let seed = self.constant(1.0f64, &self.shape(y).to_vec())?;
        adjoints.insert(y, seed);

        for curr in order {
            let adj = adjoints[&curr];
            let preds = self.node(curr).predecessors.clone();
            for (i, pred) in preds.into_iter().enumerate() {
                if !visited.contains(&pred) {
                    continue;
                }
                let local = self.local_gradient(curr, i, adj)?;
                let target = self.shape(pred).to_vec();
                let shaped = self.unbroadcast(local, &target)?;
                let accumulated = match adjoints.get(&pred).copied() {
                    Some(old) => {
                        let sum = self.add(old, shaped)?;
                        self.release(old);
                        self.release(shaped);
                        sum
                    }
                    None => shaped,
                };
                // materialize eagerly to keep recomputation chains flat
                self.execute(accumulated)?;
                self.optimize_memory(accumulated)?;
                adjoints.insert(pred, accumulated);
            }
            if !vars.contains(&curr) {
                if let Some(adj) = adjoints.remove(&curr) {
                    self.release(adj);
                }
            }
        }

        let mut gradients = Vec::with_capacity(xs.len());
        for &x in xs {
            match adjoints.remove(&x) {
                Some(adj) => gradients.push(adj),
                None => {
                    warn!("operation graph did not contain the derivative, returning zeros");
                    let zero = self.constant(0.0f64, &self.shape(x).to_vec())?;
                    gradients.push(zero);
                }
            }
        }
        // variables requested more than once keep extra handles consistent
        for adj in adjoints.into_values() {
            self.release(adj);
        }
        Ok(gradients)
    }

    /// Depth-first collection of the nodes between `y` and the variables,
    /// linearized so that every node precedes its predecessors.
    fn collect_backward_cone(
        &self,
        y: NodeId,
        vars: &HashSet<NodeId>,
    ) -> (Vec<NodeId>, HashSet<NodeId>) {
        let mut order = VecDeque::new();
        let mut visited = HashSet::new();
        // post-order DFS with an explicit stack
        let mut stack = vec![(y, false)];
        while let Some((curr, expanded)) = stack.pop() {
            if expanded {
                order.push_front(curr);
                continue;
            }
            if visited.contains(&curr) {
                continue;
            }
            visited.insert(curr);
            stack.push((curr, true));
            for &parent in &self.node(curr).predecessors {
                if visited.contains(&parent) {
                    continue;
                }
                let relevant =
                    self.trace_contains_any(parent, vars) || vars.contains(&parent);
                if relevant {
                    stack.push((parent, false));
                }
            }
        }
        (order.into_iter().collect(), visited)
    }

    /// Aligns a gradient with the shape of the node it belongs to: leading
    /// axes introduced by broadcasting are summed away, missing leading axes
    /// are reinstated by reshape and repeat.
    fn unbroadcast(&mut self, grad: NodeId, target: &[usize]) -> FlintResult<NodeId> {
        let mut curr = grad;
        while self.shape(curr).len() > target.len() {
            let reduced = self.reduce_sum(curr, 0)?;
            self.release(curr);
            curr = reduced;
        }
        if self.shape(curr).len() < target.len() {
            let diff = target.len() - self.shape(curr).len();
            let mut new_shape = vec![1; diff];
            new_shape.extend_from_slice(self.shape(curr));
            let reshaped = self.reshape(curr, &new_shape)?;
            self.release(curr);
            let mut reps = vec![0; target.len()];
            for (d, r) in reps.iter_mut().enumerate().take(diff) {
                *r = target[d] - 1;
            }
            let repeated = self.repeat(reshaped, &reps)?;
            self.release(reshaped);
            curr = repeated;
        }
        if self.shape(curr) != target {
            // the remaining mismatches stem from broadcast axes of extent 1
            for d in (0..target.len()).rev() {
                if target[d] == 1 && self.shape(curr)[d] != 1 {
                    let reduced = self.reduce_sum(curr, d)?;
                    self.release(curr);
                    curr = reduced;
                }
            }
            let reshaped = self.reshape(curr, target)?;
            self.release(curr);
            curr = reshaped;
        }
        Ok(curr)
    }

    /// The backward rule of one operation along input `i`: maps the adjoint
    /// of the output back through the operation. Returns a node owned by the
    /// caller.
    fn local_gradient(&mut self, node: NodeId, i: usize, adj: NodeId) -> FlintResult<NodeId> {
        let op = self.node(node).op.clone();
        let preds = self.node(node).predecessors.clone();
        match op {
            Op::Add => {
                self.retain(adj);
                Ok(adj)
            }
            Op::Sub => {
                if i == 0 {
                    self.retain(adj);
                    Ok(adj)
                } else {
                    self.neg(adj)
                }
            }
            Op::Mul => self.mul(adj, preds[1 - i]),
            Op::Div => {
                if i == 0 {
                    self.div(adj, preds[1])
                } else {
                    // -adj * a / b^2
                    let num = self.mul(adj, preds[0])?;
                    let den = self.mul(preds[1], preds[1])?;
                    let quot = self.div(num, den);
                    self.release(num);
                    self.release(den);
                    let quot = quot?;
                    let result = self.neg(quot);
                    self.release(quot);
                    result
                }
            }
            Op::Pow => {
                if i == 0 {
                    // adj * b * a^(b - 1)
                    let bm1 = self.sub_scalar(preds[1], 1.0f64)?;
                    let powed = self.pow(preds[0], bm1);
                    self.release(bm1);
                    let powed = powed?;
                    let scaled = self.mul(preds[1], powed);
                    self.release(powed);
                    let scaled = scaled?;
                    let result = self.mul(adj, scaled);
                    self.release(scaled);
                    result
                } else {
                    // adj * a^b * ln(a), reusing the node's own value
                    let ln = self.log(preds[0])?;
                    let scaled = self.mul(node, ln);
                    self.release(ln);
                    let scaled = scaled?;
                    let result = self.mul(adj, scaled);
                    self.release(scaled);
                    result
                }
            }
            Op::Min => self.minmax_gradient(adj, preds[1], preds[0], i == 1),
            Op::Max => self.minmax_gradient(adj, preds[0], preds[1], i == 1),
            Op::Neg => self.neg(adj),
            Op::Abs => {
                let s = self.sign(preds[0])?;
                let result = self.mul(adj, s);
                self.release(s);
                result
            }
            Op::Sqrt => {
                let twice = self.mul_scalar(node, 2.0f64)?;
                let result = self.div(adj, twice);
                self.release(twice);
                result
            }
            Op::Exp => self.mul(adj, node),
            Op::Log => self.div(adj, preds[0]),
            Op::Log2 => {
                let scaled = self.mul_scalar(preds[0], std::f64::consts::LN_2)?;
                let result = self.div(adj, scaled);
                self.release(scaled);
                result
            }
            Op::Log10 => {
                let scaled = self.mul_scalar(preds[0], std::f64::consts::LN_10)?;
                let result = self.div(adj, scaled);
                self.release(scaled);
                result
            }
            Op::Sin => {
                let c = self.cos(preds[0])?;
                let result = self.mul(adj, c);
                self.release(c);
                result
            }
            Op::Cos => {
                let s = self.sin(preds[0])?;
                let prod = self.mul(adj, s);
                self.release(s);
                let prod = prod?;
                let result = self.neg(prod);
                self.release(prod);
                result
            }
            Op::Tan => {
                let c = self.cos(preds[0])?;
                let c2 = self.mul(c, c);
                self.release(c);
                let c2 = c2?;
                let result = self.div(adj, c2);
                self.release(c2);
                result
            }
            Op::Asin | Op::Acos => {
                // +-adj / sqrt(1 - a^2)
                let sq = self.mul(preds[0], preds[0])?;
                let oneminus = self.scalar_sub(1.0f64, sq);
                self.release(sq);
                let oneminus = oneminus?;
                let root = self.sqrt(oneminus);
                self.release(oneminus);
                let root = root?;
                let quot = self.div(adj, root);
                self.release(root);
                let quot = quot?;
                if matches!(op, Op::Asin) {
                    Ok(quot)
                } else {
                    let result = self.neg(quot);
                    self.release(quot);
                    result
                }
            }
            Op::Atan => {
                let sq = self.mul(preds[0], preds[0])?;
                let denom = self.add_scalar(sq, 1.0f64);
                self.release(sq);
                let denom = denom?;
                let result = self.div(adj, denom);
                self.release(denom);
                result
            }
            Op::Sign | Op::Even | Op::Less | Op::Equal | Op::Greater => {
                let shape = self.shape(preds[i]).to_vec();
                self.constant(0.0f64, &shape)
            }
            Op::Flatten | Op::Reshape => {
                let shape = self.shape(preds[0]).to_vec();
                self.reshape(adj, &shape)
            }
            Op::Convert => {
                self.retain(adj);
                Ok(adj)
            }
            Op::Transpose { perm } => self.transpose(adj, &perm),
            Op::Repeat => self.repeat_gradient(adj, preds[0]),
            Op::Slice { start, step } => {
                let insert: Vec<usize> = start.iter().map(|&s| s as usize).collect();
                let shape = self.shape(preds[0]).to_vec();
                self.extend_step(adj, &shape, &insert, &step)
            }
            Op::Extend { insert, step } => {
                let src = self.shape(preds[0]).to_vec();
                let start: Vec<i64> = insert.iter().map(|&s| s as i64).collect();
                self.slice_exact(adj, start, step, src)
            }
            Op::Concat { axis } => {
                let sa = self.shape(preds[0]).to_vec();
                let sel = self.shape(preds[i]).to_vec();
                let rank = sel.len();
                let mut start = vec![0i64; rank];
                let mut end: Vec<i64> = self.shape(node).to_vec().iter().map(|&s| s as i64).collect();
                if i == 0 {
                    end[axis] = sa[axis] as i64;
                } else {
                    start[axis] = sa[axis] as i64;
                }
                self.slice(adj, &start, &end)
            }
            Op::ReduceSum { axis } => {
                let target = self.shape(preds[0]).to_vec();
                self.expand_to(adj, axis, &target)
            }
            Op::ReduceMul { axis } => {
                let target = self.shape(preds[0]).to_vec();
                let scaled = self.mul(adj, node)?;
                let expanded = self.expand_to(scaled, axis, &target);
                self.release(scaled);
                let expanded = expanded?;
                let result = self.div(expanded, preds[0]);
                self.release(expanded);
                result
            }
            Op::ReduceMin { axis } | Op::ReduceMax { axis } => {
                let target = self.shape(preds[0]).to_vec();
                let winners = self.expand_to(node, axis, &target)?;
                let mask = self.equal(preds[0], winners);
                self.release(winners);
                let mask = mask?;
                let expanded = self.expand_to(adj, axis, &target)?;
                let result = self.mul(expanded, mask);
                self.release(mask);
                self.release(expanded);
                result
            }
            Op::Convolve { steps } => {
                if i == 0 {
                    let shape = self.shape(preds[0]).to_vec();
                    self.gradient_convolve_input(preds[1], adj, &steps, &shape)
                } else {
                    let shape = self.shape(preds[1]).to_vec();
                    self.gradient_convolve_kernel(preds[0], adj, &steps, &shape)
                }
            }
            Op::Index => {
                if i == 0 {
                    let shape = self.shape(preds[0]).to_vec();
                    let zeros = self.constant(0.0f64, &shape)?;
                    let result = self.index_set(zeros, adj, preds[1]);
                    self.release(zeros);
                    result
                } else {
                    let shape = self.shape(preds[1]).to_vec();
                    self.constant(0.0f64, &shape)
                }
            }
            Op::IndexSet => match i {
                0 => {
                    // overwritten positions pass no gradient through
                    let shape = self.shape(preds[1]).to_vec();
                    let zeros = self.constant(0.0f64, &shape)?;
                    let result = self.index_set(adj, zeros, preds[2]);
                    self.release(zeros);
                    result
                }
                1 => self.index(adj, preds[2]),
                _ => {
                    let shape = self.shape(preds[2]).to_vec();
                    self.constant(0.0f64, &shape)
                }
            },
            Op::SlidingWindow { steps, .. } => {
                let shape = self.shape(preds[0]).to_vec();
                self.unslide_window(adj, &shape, &steps)
            }
            Op::UnslideWindow { steps } => {
                let size = self.shape(preds[0])[1..].to_vec();
                self.sliding_window(adj, &size, &steps)
            }
            Op::PoolingSum { size, steps } => {
                // a sum pool is a convolution with an all-ones kernel
                let src = self.shape(preds[0]).to_vec();
                let mut kshape = size.clone();
                kshape.push(src[src.len() - 1]);
                let ones = self.constant(1.0f64, &kshape)?;
                let result = self.gradient_convolve_input(ones, adj, &steps, &src);
                self.release(ones);
                result
            }
            Op::PoolingMax { size, steps } => {
                self.gradient_pooling_max(preds[0], adj, &size, &steps)
            }
            Op::Dropout { seed, p } => self.dropout_with_seed(adj, p, seed),
            Op::GradientConvolve1 { .. }
            | Op::GradientConvolve2 { .. }
            | Op::GradientPoolingMax { .. } => Err(FlintError::Internal(
                "second derivatives of windowed adjoints are not supported".into(),
            )),
            Op::Store(_) | Op::Constant(_) | Op::Arange { .. } | Op::Random { .. } => {
                unreachable!("leaf operations have no inputs to differentiate")
            }
        }
    }

    /// Gradient of `min`/`max`. Both kernels let the first operand win ties,
    /// so `less(x, y)` with the arguments as passed by the caller is exactly
    /// "the second operand was chosen". `second_selected` says whether the
    /// gradient target is that second operand.
    fn minmax_gradient(
        &mut self,
        adj: NodeId,
        x: NodeId,
        y: NodeId,
        second_selected: bool,
    ) -> FlintResult<NodeId> {
        let mask = self.less(x, y)?;
        let result = if second_selected {
            self.mul(adj, mask)
        } else {
            let inv = self.scalar_sub(1i32, mask)?;
            let r = self.mul(adj, inv);
            self.release(inv);
            r
        };
        self.release(mask);
        result
    }

    /// Gradient of `repeat`: every axis that was tiled is split into
    /// (copies, original) and summed over the copies.
    fn repeat_gradient(&mut self, adj: NodeId, pred: NodeId) -> FlintResult<NodeId> {
        let target = self.shape(pred).to_vec();
        let mut curr = adj;
        self.retain(curr);
        for d in 0..target.len() {
            let shape = self.shape(curr).to_vec();
            if shape[d] == target[d] {
                continue;
            }
            let copies = shape[d] / target[d];
            let mut split = shape.clone();
            split[d] = target[d];
            split.insert(d, copies);
            let reshaped = self.reshape(curr, &split)?;
            self.release(curr);
            let reduced = self.reduce_sum(reshaped, d)?;
            self.release(reshaped);
            curr = reduced;
        }
        Ok(curr)
    }

    /// Undoes a reduction for the adjoint: reinserts the reduced axis and
    /// reshapes to the predecessor's shape (a rank-1 reduction collapses to
    /// `[1]`, so the plain expand can come back one axis too wide).
    fn expand_to(&mut self, a: NodeId, axis: usize, target: &[usize]) -> FlintResult<NodeId> {
        let expanded = self.expand(a, axis, target[axis])?;
        if self.shape(expanded) == target {
            return Ok(expanded);
        }
        let reshaped = self.reshape(expanded, target);
        self.release(expanded);
        reshaped
    }

    /// Slice with pre-normalized start offsets and an explicit output shape,
    /// used where the public builder's negative-index normalization would
    /// misread computed bounds.
    pub(crate) fn slice_exact(
        &mut self,
        a: NodeId,
        start: Vec<i64>,
        step: Vec<i64>,
        shape: Vec<usize>,
    ) -> FlintResult<NodeId> {
        let ftype = self.ftype(a);
        let id = self.add_node(Op::Slice { start, step }, vec![a], shape, ftype, false);
        if self.is_eager() {
            self.execute(id)?;
        }
        Ok(id)
    }
}
