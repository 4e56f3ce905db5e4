//! One constructor per operation kind. Every builder validates argument
//! shapes and types, computes the output shape, promotes the element type
//! and links the predecessors into the DAG.

use std::sync::Arc;

use ndarray::ArrayD;
use rand::Rng;

use crate::errors::{FlintError, FlintResult};
use crate::graph::{Graph, NodeId};
use crate::ops::Op;
use crate::tensor::{array_to_data, Data, Element};
use crate::types::{shape_size, window_count, FType, Scalar};

impl Graph {
    /// Runs the eager-mode hook after a builder created its node.
    fn finish(&mut self, id: NodeId) -> FlintResult<NodeId> {
        if self.is_eager() {
            self.execute(id)?;
        }
        Ok(id)
    }

    fn validate_shape(shape: &[usize]) -> FlintResult<()> {
        if shape.is_empty() {
            return Err(FlintError::IllegalDimensionality(
                "the empty shape is not allowed, a scalar has shape [1]".into(),
            ));
        }
        if shape.iter().any(|&s| s == 0) {
            return Err(FlintError::IllegalDimensionality(format!(
                "all dimensions must be positive, got {shape:?}"
            )));
        }
        Ok(())
    }

    /// Creates a literal node owning a copy of `data`.
    pub fn store<T: Element>(&mut self, data: &[T], shape: &[usize]) -> FlintResult<NodeId> {
        Self::validate_shape(shape)?;
        if shape_size(shape) != data.len() {
            return Err(FlintError::IncompatibleShapes {
                a: shape.to_vec(),
                b: vec![data.len()],
                op: "store",
            });
        }
        let buffer = Arc::new(T::vec_into(data.to_vec()));
        let id = self.add_node(Op::Store(buffer), vec![], shape.to_vec(), T::TYPE, false);
        self.finish(id)
    }

    pub fn store_array<T: Element>(&mut self, array: &ArrayD<T>) -> FlintResult<NodeId> {
        let (data, shape) = array_to_data(array);
        Self::validate_shape(&shape)?;
        let id = self.add_node(Op::Store(Arc::new(data)), vec![], shape, T::TYPE, false);
        self.finish(id)
    }

    pub(crate) fn store_data(&mut self, data: Data, shape: Vec<usize>) -> FlintResult<NodeId> {
        Self::validate_shape(&shape)?;
        let ftype = data.ftype();
        let id = self.add_node(Op::Store(Arc::new(data)), vec![], shape, ftype, false);
        self.finish(id)
    }

    /// A single value filling the given shape.
    pub fn constant<S: Into<Scalar>>(&mut self, value: S, shape: &[usize]) -> FlintResult<NodeId> {
        Self::validate_shape(shape)?;
        let scalar = value.into();
        let ftype = scalar.ftype();
        let id = self.add_node(Op::Constant(scalar), vec![], shape.to_vec(), ftype, false);
        self.finish(id)
    }

    /// Coordinate along `axis`, int64.
    pub fn arange(&mut self, shape: &[usize], axis: usize) -> FlintResult<NodeId> {
        Self::validate_shape(shape)?;
        if axis >= shape.len() {
            return Err(FlintError::IllegalDimensionality(format!(
                "arange axis {axis} out of range for rank {}",
                shape.len()
            )));
        }
        let id = self.add_node(
            Op::Arange { axis },
            vec![],
            shape.to_vec(),
            FType::I64,
            false,
        );
        self.finish(id)
    }

    /// Uniform values in `[0, 1)`, float64.
    pub fn random(&mut self, shape: &[usize]) -> FlintResult<NodeId> {
        Self::validate_shape(shape)?;
        let seed = rand::thread_rng().gen_range(0.0..10000.0);
        let id = self.add_node(
            Op::Random { seed },
            vec![],
            shape.to_vec(),
            FType::F64,
            false,
        );
        self.finish(id)
    }

    /// Binary shape propagation. The shorter operand aligns either over the
    /// trailing axes of the longer one (forward, the default) or over its
    /// leading axes (inverse). When both alignments match, forward wins
    /// unless an operand enforces the inverse interpretation.
    fn broadcast_shape(
        &self,
        a: NodeId,
        b: NodeId,
        op: &'static str,
    ) -> FlintResult<(Vec<usize>, bool)> {
        let sa = &self.node(a).shape;
        let sb = &self.node(b).shape;
        let prefer_inverse = self.node(a).prefer_inverse || self.node(b).prefer_inverse;
        let (big, small) = if sa.len() >= sb.len() {
            (sa, sb)
        } else {
            (sb, sa)
        };
        if small.as_slice() == [1] {
            return Ok((big.clone(), false));
        }
        let diff = big.len() - small.len();
        let forward = (0..small.len()).all(|i| big[i + diff] == small[i]);
        let inverse = (0..small.len()).all(|i| big[i] == small[i]);
        if forward && !(prefer_inverse && inverse && diff > 0) {
            Ok((big.clone(), false))
        } else if inverse && diff > 0 {
            Ok((big.clone(), true))
        } else if forward {
            Ok((big.clone(), false))
        } else {
            Err(FlintError::IncompatibleShapes {
                a: sa.clone(),
                b: sb.clone(),
                op,
            })
        }
    }

    fn binary(&mut self, op: Op, a: NodeId, b: NodeId, name: &'static str) -> FlintResult<NodeId> {
        let (shape, inverse) = self.broadcast_shape(a, b, name)?;
        let ftype = FType::promote(self.ftype(a), self.ftype(b));
        let id = self.add_node(op, vec![a, b], shape, ftype, inverse);
        self.finish(id)
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> FlintResult<NodeId> {
        self.binary(Op::Add, a, b, "add")
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> FlintResult<NodeId> {
        self.binary(Op::Sub, a, b, "sub")
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> FlintResult<NodeId> {
        self.binary(Op::Mul, a, b, "mul")
    }

    pub fn div(&mut self, a: NodeId, b: NodeId) -> FlintResult<NodeId> {
        self.binary(Op::Div, a, b, "div")
    }

    pub fn pow(&mut self, a: NodeId, b: NodeId) -> FlintResult<NodeId> {
        self.binary(Op::Pow, a, b, "pow")
    }

    pub fn minimum(&mut self, a: NodeId, b: NodeId) -> FlintResult<NodeId> {
        self.binary(Op::Min, a, b, "min")
    }

    pub fn maximum(&mut self, a: NodeId, b: NodeId) -> FlintResult<NodeId> {
        self.binary(Op::Max, a, b, "max")
    }

    /// Wraps a scalar in a constant of `a`'s shape and applies the binary op.
    fn with_scalar<S: Into<Scalar>>(
        &mut self,
        op: Op,
        a: NodeId,
        value: S,
        scalar_first: bool,
        name: &'static str,
    ) -> FlintResult<NodeId> {
        let shape = self.shape(a).to_vec();
        let c = self.constant(value, &shape)?;
        let result = if scalar_first {
            self.binary(op, c, a, name)
        } else {
            self.binary(op, a, c, name)
        };
        self.release(c);
        result
    }

    pub fn add_scalar<S: Into<Scalar>>(&mut self, a: NodeId, v: S) -> FlintResult<NodeId> {
        self.with_scalar(Op::Add, a, v, false, "add")
    }

    pub fn sub_scalar<S: Into<Scalar>>(&mut self, a: NodeId, v: S) -> FlintResult<NodeId> {
        self.with_scalar(Op::Sub, a, v, false, "sub")
    }

    pub fn scalar_sub<S: Into<Scalar>>(&mut self, v: S, a: NodeId) -> FlintResult<NodeId> {
        self.with_scalar(Op::Sub, a, v, true, "sub")
    }

    pub fn mul_scalar<S: Into<Scalar>>(&mut self, a: NodeId, v: S) -> FlintResult<NodeId> {
        self.with_scalar(Op::Mul, a, v, false, "mul")
    }

    pub fn div_scalar<S: Into<Scalar>>(&mut self, a: NodeId, v: S) -> FlintResult<NodeId> {
        self.with_scalar(Op::Div, a, v, false, "div")
    }

    pub fn scalar_div<S: Into<Scalar>>(&mut self, v: S, a: NodeId) -> FlintResult<NodeId> {
        self.with_scalar(Op::Div, a, v, true, "div")
    }

    pub fn pow_scalar<S: Into<Scalar>>(&mut self, a: NodeId, v: S) -> FlintResult<NodeId> {
        self.with_scalar(Op::Pow, a, v, false, "pow")
    }

    pub fn min_scalar<S: Into<Scalar>>(&mut self, a: NodeId, v: S) -> FlintResult<NodeId> {
        self.with_scalar(Op::Min, a, v, false, "min")
    }

    pub fn max_scalar<S: Into<Scalar>>(&mut self, a: NodeId, v: S) -> FlintResult<NodeId> {
        self.with_scalar(Op::Max, a, v, false, "max")
    }

    fn comparison(&mut self, op: Op, a: NodeId, b: NodeId, name: &'static str) -> FlintResult<NodeId> {
        let (shape, inverse) = self.broadcast_shape(a, b, name)?;
        let id = self.add_node(op, vec![a, b], shape, FType::I32, inverse);
        self.finish(id)
    }

    pub fn less(&mut self, a: NodeId, b: NodeId) -> FlintResult<NodeId> {
        self.comparison(Op::Less, a, b, "less")
    }

    pub fn equal(&mut self, a: NodeId, b: NodeId) -> FlintResult<NodeId> {
        self.comparison(Op::Equal, a, b, "equal")
    }

    pub fn greater(&mut self, a: NodeId, b: NodeId) -> FlintResult<NodeId> {
        self.comparison(Op::Greater, a, b, "greater")
    }

    pub fn less_scalar<S: Into<Scalar>>(&mut self, a: NodeId, v: S) -> FlintResult<NodeId> {
        let shape = self.shape(a).to_vec();
        let c = self.constant(v, &shape)?;
        let result = self.comparison(Op::Less, a, c, "less");
        self.release(c);
        result
    }

    pub fn greater_scalar<S: Into<Scalar>>(&mut self, a: NodeId, v: S) -> FlintResult<NodeId> {
        let shape = self.shape(a).to_vec();
        let c = self.constant(v, &shape)?;
        let result = self.comparison(Op::Greater, a, c, "greater");
        self.release(c);
        result
    }

    pub fn equal_scalar<S: Into<Scalar>>(&mut self, a: NodeId, v: S) -> FlintResult<NodeId> {
        let shape = self.shape(a).to_vec();
        let c = self.constant(v, &shape)?;
        let result = self.comparison(Op::Equal, a, c, "equal");
        self.release(c);
        result
    }

    fn unary_keep_type(&mut self, op: Op, a: NodeId) -> FlintResult<NodeId> {
        let shape = self.shape(a).to_vec();
        let ftype = self.ftype(a);
        let id = self.add_node(op, vec![a], shape, ftype, false);
        self.finish(id)
    }

    pub fn neg(&mut self, a: NodeId) -> FlintResult<NodeId> {
        self.unary_keep_type(Op::Neg, a)
    }

    pub fn abs(&mut self, a: NodeId) -> FlintResult<NodeId> {
        self.unary_keep_type(Op::Abs, a)
    }

    /// `-1` for negative entries, `1` otherwise, int32.
    pub fn sign(&mut self, a: NodeId) -> FlintResult<NodeId> {
        let shape = self.shape(a).to_vec();
        let id = self.add_node(Op::Sign, vec![a], shape, FType::I32, false);
        self.finish(id)
    }

    /// Parity of an integer tensor, int32 0/1.
    pub fn even(&mut self, a: NodeId) -> FlintResult<NodeId> {
        if !self.ftype(a).is_int() {
            return Err(FlintError::WrongType(
                "even is only defined for integer tensors".into(),
            ));
        }
        let shape = self.shape(a).to_vec();
        let id = self.add_node(Op::Even, vec![a], shape, FType::I32, false);
        self.finish(id)
    }

    /// Transcendentals promote integer inputs to float64 before applying.
    fn float_unary(&mut self, op: Op, a: NodeId) -> FlintResult<NodeId> {
        let (src, temp) = if self.ftype(a).is_int() {
            (self.convert(a, FType::F64)?, true)
        } else {
            (a, false)
        };
        let shape = self.shape(src).to_vec();
        let ftype = self.ftype(src);
        let id = self.add_node(op, vec![src], shape, ftype, false);
        if temp {
            self.release(src);
        }
        self.finish(id)
    }

    pub fn log(&mut self, a: NodeId) -> FlintResult<NodeId> {
        self.float_unary(Op::Log, a)
    }

    pub fn log2(&mut self, a: NodeId) -> FlintResult<NodeId> {
        self.float_unary(Op::Log2, a)
    }

    pub fn log10(&mut self, a: NodeId) -> FlintResult<NodeId> {
        self.float_unary(Op::Log10, a)
    }

    pub fn exp(&mut self, a: NodeId) -> FlintResult<NodeId> {
        self.float_unary(Op::Exp, a)
    }

    pub fn sqrt(&mut self, a: NodeId) -> FlintResult<NodeId> {
        self.float_unary(Op::Sqrt, a)
    }

    pub fn sin(&mut self, a: NodeId) -> FlintResult<NodeId> {
        self.float_unary(Op::Sin, a)
    }

    pub fn cos(&mut self, a: NodeId) -> FlintResult<NodeId> {
        self.float_unary(Op::Cos, a)
    }

    pub fn tan(&mut self, a: NodeId) -> FlintResult<NodeId> {
        self.float_unary(Op::Tan, a)
    }

    pub fn asin(&mut self, a: NodeId) -> FlintResult<NodeId> {
        self.float_unary(Op::Asin, a)
    }

    pub fn acos(&mut self, a: NodeId) -> FlintResult<NodeId> {
        self.float_unary(Op::Acos, a)
    }

    pub fn atan(&mut self, a: NodeId) -> FlintResult<NodeId> {
        self.float_unary(Op::Atan, a)
    }

    pub fn convert(&mut self, a: NodeId, to: FType) -> FlintResult<NodeId> {
        let shape = self.shape(a).to_vec();
        let id = self.add_node(Op::Convert, vec![a], shape, to, false);
        self.finish(id)
    }

    pub fn flatten(&mut self, a: NodeId) -> FlintResult<NodeId> {
        let total = shape_size(self.shape(a));
        let ftype = self.ftype(a);
        let id = self.add_node(Op::Flatten, vec![a], vec![total], ftype, false);
        self.finish(id)
    }

    /// Merges axis `axis - 1` and `axis` into one.
    pub fn flatten_axis(&mut self, a: NodeId, axis: usize) -> FlintResult<NodeId> {
        if axis == 0 {
            return Err(FlintError::IllegalDimensionality(
                "flattening the first axis of a tensor is not possible".into(),
            ));
        }
        let src = self.shape(a).to_vec();
        if axis >= src.len() {
            return Err(FlintError::IllegalDimensionality(format!(
                "flatten axis {axis} out of range for rank {}",
                src.len()
            )));
        }
        let mut shape = Vec::with_capacity(src.len() - 1);
        shape.extend_from_slice(&src[..axis - 1]);
        shape.push(src[axis - 1] * src[axis]);
        shape.extend_from_slice(&src[axis + 1..]);
        let ftype = self.ftype(a);
        let id = self.add_node(Op::Flatten, vec![a], shape, ftype, false);
        self.finish(id)
    }

    pub fn reshape(&mut self, a: NodeId, new_shape: &[usize]) -> FlintResult<NodeId> {
        Self::validate_shape(new_shape)?;
        if shape_size(new_shape) != shape_size(self.shape(a)) {
            return Err(FlintError::IncompatibleShapes {
                a: self.shape(a).to_vec(),
                b: new_shape.to_vec(),
                op: "reshape",
            });
        }
        let ftype = self.ftype(a);
        let id = self.add_node(Op::Reshape, vec![a], new_shape.to_vec(), ftype, false);
        self.finish(id)
    }

    /// Transposition by an involutive permutation.
    pub fn transpose(&mut self, a: NodeId, perm: &[usize]) -> FlintResult<NodeId> {
        let src = self.shape(a).to_vec();
        if perm.len() != src.len() {
            return Err(FlintError::IllegalDimensionality(format!(
                "permutation of length {} against rank {}",
                perm.len(),
                src.len()
            )));
        }
        for i in 0..perm.len() {
            if perm[i] >= perm.len() || perm[perm[i]] != i {
                return Err(FlintError::IllegalDimensionality(
                    "transposition must be an involution: perm[perm[i]] == i".into(),
                ));
            }
        }
        let shape: Vec<usize> = perm.iter().map(|&p| src[p]).collect();
        let ftype = self.ftype(a);
        let id = self.add_node(
            Op::Transpose {
                perm: perm.to_vec(),
            },
            vec![a],
            shape,
            ftype,
            false,
        );
        self.finish(id)
    }

    /// Tiles the tensor `reps[d] + 1` times along each axis, i.e. `reps`
    /// counts the additional copies.
    pub fn repeat(&mut self, a: NodeId, reps: &[usize]) -> FlintResult<NodeId> {
        let src = self.shape(a).to_vec();
        if reps.len() != src.len() {
            return Err(FlintError::IllegalDimensionality(format!(
                "repeat expects one repetition count per axis, got {} for rank {}",
                reps.len(),
                src.len()
            )));
        }
        let shape: Vec<usize> = src.iter().zip(reps).map(|(&s, &r)| s * (r + 1)).collect();
        let ftype = self.ftype(a);
        let id = self.add_node(Op::Repeat, vec![a], shape, ftype, false);
        self.finish(id)
    }

    pub fn slice(&mut self, a: NodeId, start: &[i64], end: &[i64]) -> FlintResult<NodeId> {
        let step = vec![1i64; self.shape(a).len()];
        self.slice_step(a, start, end, &step)
    }

    /// Start, end and step per axis; negative indices count from the end of
    /// the axis, a negative step walks it backwards.
    pub fn slice_step(
        &mut self,
        a: NodeId,
        start: &[i64],
        end: &[i64],
        step: &[i64],
    ) -> FlintResult<NodeId> {
        let src = self.shape(a).to_vec();
        if start.len() != src.len() || end.len() != src.len() || step.len() != src.len() {
            return Err(FlintError::IllegalDimensionality(format!(
                "slice expects start/end/step for each of the {} axes",
                src.len()
            )));
        }
        let mut nstart = vec![0i64; src.len()];
        let mut nend = vec![0i64; src.len()];
        let mut shape = vec![0usize; src.len()];
        for d in 0..src.len() {
            if step[d] == 0 {
                return Err(FlintError::InvalidSelect(
                    "step may not be 0 for slicing".into(),
                ));
            }
            nstart[d] = if start[d] < 0 {
                src[d] as i64 + start[d]
            } else {
                start[d]
            };
            nend[d] = if end[d] < 0 {
                src[d] as i64 + end[d]
            } else {
                end[d]
            };
            if (step[d] < 0 && nend[d] > nstart[d]) || (step[d] > 0 && nend[d] < nstart[d]) {
                return Err(FlintError::InvalidSelect(format!(
                    "combination of step sign, start and end in axis {d} yields an empty \
                     tensor: start {}, end {}, step {}",
                    nstart[d], nend[d], step[d]
                )));
            }
            let span = (nend[d] - nstart[d]).unsigned_abs() as usize;
            let step_abs = step[d].unsigned_abs() as usize;
            shape[d] = if span % step_abs == 0 {
                span / step_abs
            } else {
                span / step_abs + 1
            };
            if shape[d] > src[d] || nstart[d] < 0 || nstart[d] >= src[d] as i64 {
                return Err(FlintError::InvalidSelect(format!(
                    "slice axis {d} out of bounds for source extent {}",
                    src[d]
                )));
            }
        }
        Self::validate_shape(&shape)?;
        let ftype = self.ftype(a);
        let id = self.add_node(
            Op::Slice {
                start: nstart,
                step: step.to_vec(),
            },
            vec![a],
            shape,
            ftype,
            false,
        );
        self.finish(id)
    }

    pub fn extend(
        &mut self,
        a: NodeId,
        new_shape: &[usize],
        insert_at: &[usize],
    ) -> FlintResult<NodeId> {
        let step = vec![1i64; self.shape(a).len()];
        self.extend_step(a, new_shape, insert_at, &step)
    }

    /// The dual of slicing: scatters the tensor into a larger zero-filled
    /// one, element `j` of an axis landing at `insert_at + j * step`.
    pub fn extend_step(
        &mut self,
        a: NodeId,
        new_shape: &[usize],
        insert_at: &[usize],
        step: &[i64],
    ) -> FlintResult<NodeId> {
        let src = self.shape(a).to_vec();
        if new_shape.len() != src.len() || insert_at.len() != src.len() || step.len() != src.len()
        {
            return Err(FlintError::IllegalDimensionality(format!(
                "extend expects shape/offset/step for each of the {} axes",
                src.len()
            )));
        }
        Self::validate_shape(new_shape)?;
        if step.iter().any(|&s| s == 0) {
            return Err(FlintError::InvalidSelect(
                "step may not be 0 for extending".into(),
            ));
        }
        let ftype = self.ftype(a);
        let id = self.add_node(
            Op::Extend {
                insert: insert_at.to_vec(),
                step: step.to_vec(),
            },
            vec![a],
            new_shape.to_vec(),
            ftype,
            false,
        );
        self.finish(id)
    }

    /// Concatenation along one axis; all other axes must match exactly.
    pub fn concat(&mut self, a: NodeId, b: NodeId, axis: usize) -> FlintResult<NodeId> {
        let sa = self.shape(a).to_vec();
        let sb = self.shape(b).to_vec();
        if sa.len() != sb.len() || axis >= sa.len() {
            return Err(FlintError::IllegalDimensionality(format!(
                "concat of ranks {} and {} along axis {axis}",
                sa.len(),
                sb.len()
            )));
        }
        for d in 0..sa.len() {
            if d != axis && sa[d] != sb[d] {
                return Err(FlintError::IncompatibleShapes {
                    a: sa,
                    b: sb,
                    op: "concat",
                });
            }
        }
        let ftype = FType::promote(self.ftype(a), self.ftype(b));
        let (ca, ta) = self.converted(a, ftype)?;
        let (cb, tb) = self.converted(b, ftype)?;
        let mut shape = sa.clone();
        shape[axis] += sb[axis];
        let id = self.add_node(Op::Concat { axis }, vec![ca, cb], shape, ftype, false);
        if ta {
            self.release(ca);
        }
        if tb {
            self.release(cb);
        }
        self.finish(id)
    }

    /// Inserts an axis of extent `size` at `axis` by reshape plus repeat.
    pub fn expand(&mut self, a: NodeId, axis: usize, size: usize) -> FlintResult<NodeId> {
        let src = self.shape(a).to_vec();
        if axis > src.len() {
            return Err(FlintError::IllegalDimensionality(format!(
                "expand axis {axis} out of range for rank {}",
                src.len()
            )));
        }
        let mut new_shape = src.clone();
        new_shape.insert(axis, 1);
        let reshaped = self.reshape(a, &new_shape)?;
        if size <= 1 {
            return Ok(reshaped);
        }
        let mut reps = vec![0usize; new_shape.len()];
        reps[axis] = size - 1;
        let result = self.repeat(reshaped, &reps);
        self.release(reshaped);
        result
    }

    /// Matrix multiplication, decomposed into an element-wise product of two
    /// rank-expanded views followed by a sum over the contracted axis.
    pub fn matmul(&mut self, a: NodeId, b: NodeId) -> FlintResult<NodeId> {
        let sa = self.shape(a).to_vec();
        let sb = self.shape(b).to_vec();
        if sa.len() < 2 || sb.len() < 2 {
            return Err(FlintError::IllegalDimensionality(
                "matmul operands must have rank of at least 2".into(),
            ));
        }
        let l = sa[sa.len() - 2];
        let m = sa[sa.len() - 1];
        let mb = sb[sb.len() - 2];
        let n = sb[sb.len() - 1];
        if m != mb {
            return Err(FlintError::IncompatibleShapes {
                a: sa,
                b: sb,
                op: "matmul",
            });
        }
        let ea = self.expand(a, sa.len(), n)?;
        let eb = self.expand(b, sb.len() - 2, l)?;
        let prod = self.mul(ea, eb);
        self.release(ea);
        self.release(eb);
        let prod = prod?;
        let contracted = self.shape(prod).len() - 2;
        let result = self.reduce_sum(prod, contracted);
        self.release(prod);
        result
    }

    fn reduce(&mut self, op: fn(usize) -> Op, a: NodeId, axis: usize) -> FlintResult<NodeId> {
        let src = self.shape(a).to_vec();
        if axis >= src.len() {
            return Err(FlintError::IllegalDimensionality(format!(
                "reduction axis {axis} out of range for rank {}",
                src.len()
            )));
        }
        let shape = if src.len() > 1 {
            let mut s = src.clone();
            s.remove(axis);
            s
        } else {
            vec![1]
        };
        let ftype = self.ftype(a);
        let id = self.add_node(op(axis), vec![a], shape, ftype, false);
        self.finish(id)
    }

    pub fn reduce_sum(&mut self, a: NodeId, axis: usize) -> FlintResult<NodeId> {
        self.reduce(|axis| Op::ReduceSum { axis }, a, axis)
    }

    pub fn reduce_mul(&mut self, a: NodeId, axis: usize) -> FlintResult<NodeId> {
        self.reduce(|axis| Op::ReduceMul { axis }, a, axis)
    }

    pub fn reduce_min(&mut self, a: NodeId, axis: usize) -> FlintResult<NodeId> {
        self.reduce(|axis| Op::ReduceMin { axis }, a, axis)
    }

    pub fn reduce_max(&mut self, a: NodeId, axis: usize) -> FlintResult<NodeId> {
        self.reduce(|axis| Op::ReduceMax { axis }, a, axis)
    }

    /// Returns `(node, true)` with a fresh conversion node when the type
    /// differs, `(a, false)` otherwise.
    fn converted(&mut self, a: NodeId, to: FType) -> FlintResult<(NodeId, bool)> {
        if self.ftype(a) == to {
            Ok((a, false))
        } else {
            Ok((self.convert(a, to)?, true))
        }
    }

    /// Convolution of the input with one kernel (kernel rank equals input
    /// rank, output drops the channel axis) or a bank of kernels (kernel
    /// rank is input rank + 1, the leading kernel axis becomes the output
    /// channel axis). Windows slide over all axes but the last.
    pub fn convolve(&mut self, a: NodeId, kernel: NodeId, steps: &[usize]) -> FlintResult<NodeId> {
        let sa = self.shape(a).to_vec();
        let sk = self.shape(kernel).to_vec();
        if sa.len() < 2 {
            return Err(FlintError::IllegalDimensionality(
                "convolution input needs at least one windowed axis and a channel axis".into(),
            ));
        }
        let multi = sk.len() == sa.len() + 1;
        if !multi && sk.len() != sa.len() {
            return Err(FlintError::IllegalDimensionality(
                "kernel rank must equal input rank, or input rank + 1 for a kernel bank".into(),
            ));
        }
        if sa[sa.len() - 1] != sk[sk.len() - 1] {
            return Err(FlintError::IncompatibleShapes {
                a: sa,
                b: sk,
                op: "convolve",
            });
        }
        let spatial = sa.len() - 1;
        // a trailing step entry for the channel axis is tolerated and ignored
        if steps.len() != spatial && steps.len() != spatial + 1 {
            return Err(FlintError::IllegalDimensionality(format!(
                "convolution expects one step per windowed axis, got {} for {spatial}",
                steps.len()
            )));
        }
        let steps = &steps[..spatial];
        if steps.iter().any(|&s| s == 0) {
            return Err(FlintError::InvalidSelect("steps may not be 0".into()));
        }
        let kernel_spatial = if multi { &sk[1..] } else { &sk[..] };
        let mut shape = Vec::with_capacity(if multi { spatial + 1 } else { spatial });
        for d in 0..spatial {
            if kernel_spatial[d] > sa[d] {
                return Err(FlintError::IncompatibleShapes {
                    a: sa.clone(),
                    b: sk.clone(),
                    op: "convolve",
                });
            }
            shape.push(window_count(sa[d], kernel_spatial[d], steps[d]));
        }
        if multi {
            shape.push(sk[0]);
        }
        let ftype = FType::promote(self.ftype(a), self.ftype(kernel));
        let (ca, ta) = self.converted(a, ftype)?;
        let (ck, tk) = self.converted(kernel, ftype)?;
        let id = self.add_node(
            Op::Convolve {
                steps: steps.to_vec(),
            },
            vec![ca, ck],
            shape,
            ftype,
            false,
        );
        if ta {
            self.release(ca);
        }
        if tk {
            self.release(ck);
        }
        self.finish(id)
    }

    /// Indexed read: the last axis of the integer tensor `indices` selects
    /// coordinates along axis `indices.rank - 1` of `a`; all leading axes of
    /// `indices` must match `a`.
    pub fn index(&mut self, a: NodeId, indices: NodeId) -> FlintResult<NodeId> {
        let sa = self.shape(a).to_vec();
        let si = self.shape(indices).to_vec();
        if si.len() > sa.len() {
            return Err(FlintError::IllegalDimensionality(
                "index tensor must not have a larger rank than the indexed tensor".into(),
            ));
        }
        if !self.ftype(indices).is_int() {
            return Err(FlintError::WrongType(
                "only integer tensors may be used as indices".into(),
            ));
        }
        for d in 0..si.len() - 1 {
            if sa[d] != si[d] {
                return Err(FlintError::IncompatibleShapes {
                    a: sa,
                    b: si,
                    op: "index",
                });
            }
        }
        let mut shape = sa.clone();
        shape[si.len() - 1] = si[si.len() - 1];
        let ftype = self.ftype(a);
        let id = self.add_node(Op::Index, vec![a, indices], shape, ftype, false);
        self.finish(id)
    }

    /// Indexed write: `b`'s entries land in a copy of `a` at the coordinates
    /// given by `indices`; the last write along the selection axis wins.
    pub fn index_set(&mut self, a: NodeId, b: NodeId, indices: NodeId) -> FlintResult<NodeId> {
        let sa = self.shape(a).to_vec();
        let sb = self.shape(b).to_vec();
        let si = self.shape(indices).to_vec();
        if si.len() > sb.len() {
            return Err(FlintError::IllegalDimensionality(
                "index tensor must not have a larger rank than the written tensor".into(),
            ));
        }
        if !self.ftype(indices).is_int() {
            return Err(FlintError::WrongType(
                "only integer tensors may be used as indices".into(),
            ));
        }
        for d in 0..si.len() - 1 {
            if sb[d] != si[d] {
                return Err(FlintError::IncompatibleShapes {
                    a: sb,
                    b: si,
                    op: "index_set",
                });
            }
        }
        let ax = si.len() - 1;
        if sb.len() != sa.len() || (0..sa.len()).any(|d| d != ax && sa[d] != sb[d]) {
            return Err(FlintError::IncompatibleShapes {
                a: sa,
                b: sb,
                op: "index_set",
            });
        }
        if sb[ax] != si[ax] {
            return Err(FlintError::IncompatibleShapes {
                a: sb,
                b: si,
                op: "index_set",
            });
        }
        let ftype = self.ftype(a);
        let (cb, tb) = self.converted(b, ftype)?;
        let id = self.add_node(Op::IndexSet, vec![a, cb, indices], sa, ftype, false);
        if tb {
            self.release(cb);
        }
        self.finish(id)
    }

    /// All windows of the given size, flattened into a leading window axis.
    pub fn sliding_window(
        &mut self,
        a: NodeId,
        size: &[usize],
        steps: &[usize],
    ) -> FlintResult<NodeId> {
        let src = self.shape(a).to_vec();
        if size.len() != src.len() || steps.len() != src.len() {
            return Err(FlintError::IllegalDimensionality(format!(
                "sliding window expects size and step for each of the {} axes",
                src.len()
            )));
        }
        if steps.iter().any(|&s| s == 0) {
            return Err(FlintError::InvalidSelect("steps may not be 0".into()));
        }
        let mut windows = 1usize;
        for d in 0..src.len() {
            if size[d] > src[d] {
                return Err(FlintError::IncompatibleShapes {
                    a: src,
                    b: size.to_vec(),
                    op: "sliding_window",
                });
            }
            windows *= window_count(src[d], size[d], steps[d]);
        }
        let mut shape = Vec::with_capacity(src.len() + 1);
        shape.push(windows);
        shape.extend_from_slice(size);
        let ftype = self.ftype(a);
        let id = self.add_node(
            Op::SlidingWindow {
                size: size.to_vec(),
                steps: steps.to_vec(),
            },
            vec![a],
            shape,
            ftype,
            false,
        );
        self.finish(id)
    }

    /// Summing inverse of `sliding_window`: overlapping window entries are
    /// accumulated back into a tensor of the given shape.
    pub fn unslide_window(
        &mut self,
        a: NodeId,
        shape: &[usize],
        steps: &[usize],
    ) -> FlintResult<NodeId> {
        let src = self.shape(a).to_vec();
        if shape.len() != src.len() - 1 || steps.len() != shape.len() {
            return Err(FlintError::IllegalDimensionality(format!(
                "unslide expects a target shape and steps of rank {}",
                src.len() - 1
            )));
        }
        Self::validate_shape(shape)?;
        if steps.iter().any(|&s| s == 0) {
            return Err(FlintError::InvalidSelect("steps may not be 0".into()));
        }
        let mut windows = 1usize;
        for d in 0..shape.len() {
            if src[d + 1] > shape[d] {
                return Err(FlintError::IncompatibleShapes {
                    a: shape.to_vec(),
                    b: src,
                    op: "unslide_window",
                });
            }
            windows *= window_count(shape[d], src[d + 1], steps[d]);
        }
        if windows != src[0] {
            return Err(FlintError::IncompatibleShapes {
                a: vec![windows],
                b: vec![src[0]],
                op: "unslide_window",
            });
        }
        let ftype = self.ftype(a);
        let id = self.add_node(
            Op::UnslideWindow {
                steps: steps.to_vec(),
            },
            vec![a],
            shape.to_vec(),
            ftype,
            false,
        );
        self.finish(id)
    }

    /// Randomly permutes the entries along axis `axis` of every slice, via an
    /// indexed read with a host-generated permutation tensor.
    pub fn permutate(&mut self, a: NodeId, axis: usize) -> FlintResult<NodeId> {
        let src = self.shape(a).to_vec();
        if axis >= src.len() {
            return Err(FlintError::IllegalDimensionality(format!(
                "permutation axis {axis} out of range for rank {}",
                src.len()
            )));
        }
        let extent = src[axis];
        let total: usize = src[..=axis].iter().product();
        let mut rng = rand::thread_rng();
        let mut perm = vec![0i64; total];
        for block in perm.chunks_mut(extent) {
            for (i, v) in block.iter_mut().enumerate() {
                *v = i as i64;
            }
            for i in 0..extent {
                block.swap(i, rng.gen_range(0..extent));
            }
        }
        let ind = self.store(&perm, &src[..=axis])?;
        let result = self.index(a, ind);
        self.release(ind);
        result
    }

    fn pooling(
        &mut self,
        op: fn(Vec<usize>, Vec<usize>) -> Op,
        a: NodeId,
        size: &[usize],
        steps: &[usize],
        name: &'static str,
    ) -> FlintResult<NodeId> {
        let src = self.shape(a).to_vec();
        if src.len() < 2 {
            return Err(FlintError::IllegalDimensionality(
                "pooling input needs at least one windowed axis and a channel axis".into(),
            ));
        }
        let spatial = src.len() - 1;
        if size.len() != spatial || steps.len() != spatial {
            return Err(FlintError::IllegalDimensionality(format!(
                "pooling expects window size and step for each of the {spatial} windowed axes"
            )));
        }
        if steps.iter().any(|&s| s == 0) {
            return Err(FlintError::InvalidSelect("steps may not be 0".into()));
        }
        let mut shape = Vec::with_capacity(spatial);
        for d in 0..spatial {
            if size[d] > src[d] {
                return Err(FlintError::IncompatibleShapes {
                    a: src,
                    b: size.to_vec(),
                    op: name,
                });
            }
            shape.push(window_count(src[d], size[d], steps[d]));
        }
        let ftype = self.ftype(a);
        let id = self.add_node(op(size.to_vec(), steps.to_vec()), vec![a], shape, ftype, false);
        self.finish(id)
    }

    /// Sum over pooling windows; the window spans the given sizes over the
    /// leading axes and the entire channel axis.
    pub fn pooling_sum(&mut self, a: NodeId, size: &[usize], steps: &[usize]) -> FlintResult<NodeId> {
        self.pooling(
            |size, steps| Op::PoolingSum { size, steps },
            a,
            size,
            steps,
            "pooling_sum",
        )
    }

    /// Maximum over pooling windows.
    pub fn pooling_max(&mut self, a: NodeId, size: &[usize], steps: &[usize]) -> FlintResult<NodeId> {
        self.pooling(
            |size, steps| Op::PoolingMax { size, steps },
            a,
            size,
            steps,
            "pooling_max",
        )
    }

    /// Zeroes each entry with probability `p`; surviving entries pass
    /// through unscaled.
    pub fn dropout(&mut self, a: NodeId, p: f64) -> FlintResult<NodeId> {
        if !(0.0..1.0).contains(&p) {
            return Err(FlintError::InvalidSelect(format!(
                "dropout probability must lie in [0, 1), got {p}"
            )));
        }
        let seed = rand::thread_rng().gen_range(0.0..10000.0);
        let shape = self.shape(a).to_vec();
        let ftype = self.ftype(a);
        let id = self.add_node(Op::Dropout { seed, p }, vec![a], shape, ftype, false);
        self.finish(id)
    }

    /// Same-seed reapplication of a dropout mask, used by its adjoint.
    pub(crate) fn dropout_with_seed(
        &mut self,
        a: NodeId,
        p: f64,
        seed: f64,
    ) -> FlintResult<NodeId> {
        let shape = self.shape(a).to_vec();
        let ftype = self.ftype(a);
        let id = self.add_node(Op::Dropout { seed, p }, vec![a], shape, ftype, false);
        self.finish(id)
    }

    /// Adjoint of a convolution with respect to its input.
    pub(crate) fn gradient_convolve_input(
        &mut self,
        kernel: NodeId,
        adjoint: NodeId,
        steps: &[usize],
        input_shape: &[usize],
    ) -> FlintResult<NodeId> {
        let ftype = FType::promote(self.ftype(kernel), self.ftype(adjoint));
        let (ck, tk) = self.converted(kernel, ftype)?;
        let (ca, ta) = self.converted(adjoint, ftype)?;
        let id = self.add_node(
            Op::GradientConvolve1 {
                steps: steps.to_vec(),
            },
            vec![ck, ca],
            input_shape.to_vec(),
            ftype,
            false,
        );
        if tk {
            self.release(ck);
        }
        if ta {
            self.release(ca);
        }
        self.finish(id)
    }

    /// Adjoint of a convolution with respect to its kernel.
    pub(crate) fn gradient_convolve_kernel(
        &mut self,
        input: NodeId,
        adjoint: NodeId,
        steps: &[usize],
        kernel_shape: &[usize],
    ) -> FlintResult<NodeId> {
        let ftype = FType::promote(self.ftype(input), self.ftype(adjoint));
        let (ci, ti) = self.converted(input, ftype)?;
        let (ca, ta) = self.converted(adjoint, ftype)?;
        let id = self.add_node(
            Op::GradientConvolve2 {
                steps: steps.to_vec(),
            },
            vec![ci, ca],
            kernel_shape.to_vec(),
            ftype,
            false,
        );
        if ti {
            self.release(ci);
        }
        if ta {
            self.release(ca);
        }
        self.finish(id)
    }

    /// Scattering adjoint of max pooling.
    pub(crate) fn gradient_pooling_max(
        &mut self,
        input: NodeId,
        adjoint: NodeId,
        size: &[usize],
        steps: &[usize],
    ) -> FlintResult<NodeId> {
        let ftype = FType::promote(self.ftype(input), self.ftype(adjoint));
        let (ci, ti) = self.converted(input, ftype)?;
        let (ca, ta) = self.converted(adjoint, ftype)?;
        let shape = self.shape(ci).to_vec();
        let id = self.add_node(
            Op::GradientPoolingMax {
                size: size.to_vec(),
                steps: steps.to_vec(),
            },
            vec![ci, ca],
            shape,
            ftype,
            false,
        );
        if ti {
            self.release(ci);
        }
        if ta {
            self.release(ca);
        }
        self.finish(id)
    }
}
