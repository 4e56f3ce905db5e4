pub mod elementwise;
pub mod generators;
pub mod reductions;
pub mod shaping;
pub mod windows;

use std::sync::Arc;

use num_traits::{Bounded, One, Zero};

use crate::tensor::{Data, Element, RawBuf};
use crate::types::FType;

/// The closed set of operation kinds, each carrying its operation-specific
/// auxiliary data. Adding an operation means adding a variant here plus its
/// entries in the registry methods below and the kernel modules.
#[derive(Debug, Clone)]
pub enum Op {
    /// Literal data owned by the node.
    Store(Arc<Data>),
    /// A single value filling the whole output shape.
    Constant(crate::types::Scalar),
    /// Index along one axis, int64.
    Arange { axis: usize },
    /// Uniform values in `[0, 1)`, float64, seeded at construction.
    Random { seed: f64 },

    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Min,
    Max,

    Neg,
    Abs,
    Sign,
    Even,
    Log,
    Log2,
    Log10,
    Exp,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,

    Less,
    Equal,
    Greater,

    Flatten,
    Reshape,
    Convert,
    Transpose { perm: Vec<usize> },
    Repeat,
    Slice { start: Vec<i64>, step: Vec<i64> },
    Extend { insert: Vec<usize>, step: Vec<i64> },
    Concat { axis: usize },

    ReduceSum { axis: usize },
    ReduceMul { axis: usize },
    ReduceMin { axis: usize },
    ReduceMax { axis: usize },

    Convolve { steps: Vec<usize> },
    /// Adjoint of a convolution with respect to its input. Predecessors are
    /// `[kernel, adjoint]`, the output takes the original input's shape.
    GradientConvolve1 { steps: Vec<usize> },
    /// Adjoint of a convolution with respect to its kernel. Predecessors are
    /// `[input, adjoint]`, the output takes the kernel's shape.
    GradientConvolve2 { steps: Vec<usize> },

    Index,
    IndexSet,
    SlidingWindow { size: Vec<usize>, steps: Vec<usize> },
    UnslideWindow { steps: Vec<usize> },
    PoolingSum { size: Vec<usize>, steps: Vec<usize> },
    PoolingMax { size: Vec<usize>, steps: Vec<usize> },
    /// Scattering adjoint of max pooling. Predecessors are
    /// `[input, adjoint]`, the output takes the input's shape.
    GradientPoolingMax { size: Vec<usize>, steps: Vec<usize> },

    Dropout { seed: f64, p: f64 },
}

impl Op {
    pub fn tag_name(&self) -> &'static str {
        match self {
            Op::Store(_) => "store",
            Op::Constant(_) => "constant",
            Op::Arange { .. } => "arange",
            Op::Random { .. } => "random",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Pow => "pow",
            Op::Min => "min",
            Op::Max => "max",
            Op::Neg => "neg",
            Op::Abs => "abs",
            Op::Sign => "sign",
            Op::Even => "even",
            Op::Log => "log",
            Op::Log2 => "log2",
            Op::Log10 => "log10",
            Op::Exp => "exp",
            Op::Sqrt => "sqrt",
            Op::Sin => "sin",
            Op::Cos => "cos",
            Op::Tan => "tan",
            Op::Asin => "asin",
            Op::Acos => "acos",
            Op::Atan => "atan",
            Op::Less => "less",
            Op::Equal => "equal",
            Op::Greater => "greater",
            Op::Flatten => "flatten",
            Op::Reshape => "reshape",
            Op::Convert => "convert",
            Op::Transpose { .. } => "transpose",
            Op::Repeat => "repeat",
            Op::Slice { .. } => "slice",
            Op::Extend { .. } => "extend",
            Op::Concat { .. } => "concat",
            Op::ReduceSum { .. } => "reduce_sum",
            Op::ReduceMul { .. } => "reduce_mul",
            Op::ReduceMin { .. } => "reduce_min",
            Op::ReduceMax { .. } => "reduce_max",
            Op::Convolve { .. } => "convolve",
            Op::GradientConvolve1 { .. } => "gradient_convolve1",
            Op::GradientConvolve2 { .. } => "gradient_convolve2",
            Op::Index => "index",
            Op::IndexSet => "index_set",
            Op::SlidingWindow { .. } => "sliding_window",
            Op::UnslideWindow { .. } => "unslide_window",
            Op::PoolingSum { .. } => "pooling_sum",
            Op::PoolingMax { .. } => "pooling_max",
            Op::GradientPoolingMax { .. } => "gradient_pooling_max",
            Op::Dropout { .. } => "dropout",
        }
    }

    /// Per-element arithmetic cost estimate driving the backend selector and
    /// the parallel-execution threshold.
    pub fn score(&self) -> usize {
        match self {
            Op::Store(_) | Op::Constant(_) | Op::Arange { .. } => 1,
            Op::Add | Op::Sub | Op::Mul | Op::Neg | Op::Abs | Op::Sign | Op::Even => 1,
            Op::Less | Op::Equal | Op::Greater | Op::Convert => 1,
            Op::Flatten | Op::Reshape => 1,
            Op::Div | Op::Min | Op::Max => 2,
            Op::Transpose { .. } | Op::Repeat | Op::Slice { .. } | Op::Extend { .. } => 2,
            Op::Concat { .. } | Op::Index | Op::IndexSet | Op::SlidingWindow { .. } => 2,
            Op::Random { .. } | Op::Dropout { .. } => 2,
            Op::Pow
            | Op::Log
            | Op::Log2
            | Op::Log10
            | Op::Exp
            | Op::Sqrt
            | Op::Sin
            | Op::Cos
            | Op::Tan
            | Op::Asin
            | Op::Acos
            | Op::Atan => 4,
            Op::ReduceSum { .. }
            | Op::ReduceMul { .. }
            | Op::ReduceMin { .. }
            | Op::ReduceMax { .. } => 5,
            Op::UnslideWindow { .. } => 5,
            Op::PoolingSum { .. } | Op::PoolingMax { .. } | Op::GradientPoolingMax { .. } => 5,
            Op::Convolve { .. } | Op::GradientConvolve1 { .. } | Op::GradientConvolve2 { .. } => {
                10
            }
        }
    }

    /// Whether this operation may write its output into the buffer of input
    /// `i` when that input has no other consumer. Conservative: only the
    /// element-wise family qualifies, and the executor additionally requires
    /// matching shape and element type.
    pub fn reuse_inputs(&self, num_preds: usize) -> Vec<bool> {
        let ok = matches!(
            self,
            Op::Add
                | Op::Sub
                | Op::Mul
                | Op::Div
                | Op::Pow
                | Op::Min
                | Op::Max
                | Op::Neg
                | Op::Abs
                | Op::Log
                | Op::Log2
                | Op::Log10
                | Op::Exp
                | Op::Sqrt
                | Op::Sin
                | Op::Cos
                | Op::Tan
                | Op::Asin
                | Op::Acos
                | Op::Atan
                | Op::Dropout { .. }
        );
        vec![ok; num_preds]
    }
}

/// One predecessor's materialized view as seen by a kernel.
#[derive(Debug, Clone)]
pub struct PredData {
    pub data: Arc<Data>,
    pub shape: Vec<usize>,
}

impl PredData {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Everything a CPU kernel needs about the node it computes, detached from
/// the graph arena so range tasks can cross thread boundaries.
#[derive(Debug)]
pub struct KernelCtx {
    pub op: Op,
    pub ftype: FType,
    pub shape: Vec<usize>,
    pub inverse_broadcast: bool,
    pub preds: Vec<PredData>,
}

/// Arithmetic bounds shared by the typed kernels.
pub(crate) trait CpuNum:
    Element
    + std::ops::Add<Output = Self>
    + std::ops::Sub<Output = Self>
    + std::ops::Mul<Output = Self>
    + std::ops::Div<Output = Self>
    + std::ops::Rem<Output = Self>
    + Zero
    + One
    + Bounded
{
}

impl CpuNum for i32 {}
impl CpuNum for i64 {}
impl CpuNum for f32 {}
impl CpuNum for f64 {}

/// Index manipulations applied to the two operands of a broadcast binary
/// operation: operand `k` is read at `(i / div) % modulo`. Forward
/// broadcasting leaves the divisor at 1, inverse broadcasting divides the
/// index by the product of the larger operand's uncovered trailing axes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BinManip {
    pub div_a: usize,
    pub mod_a: usize,
    pub div_b: usize,
    pub mod_b: usize,
}

pub(crate) fn binary_manips(ctx: &KernelCtx) -> BinManip {
    let (da, db) = broadcast_divisors(
        &ctx.preds[0].shape,
        &ctx.preds[1].shape,
        ctx.inverse_broadcast,
    );
    BinManip {
        div_a: da,
        mod_a: ctx.preds[0].len().max(1),
        div_b: db,
        mod_b: ctx.preds[1].len().max(1),
    }
}

/// Divisors for the two operands, 1 unless inverse broadcasting aligns the
/// smaller operand over the leading axes of the larger one.
pub(crate) fn broadcast_divisors(a: &[usize], b: &[usize], inverse: bool) -> (usize, usize) {
    if !inverse {
        return (1, 1);
    }
    // scalars never need index manipulation
    if a == [1] || b == [1] {
        return (1, 1);
    }
    if a.len() > b.len() {
        (1, a[b.len()..].iter().product())
    } else if b.len() > a.len() {
        (b[a.len()..].iter().product(), 1)
    } else {
        (1, 1)
    }
}

/// Executes one operation over the output range `[from, from + len)`.
/// Dispatch is a flat table over the operation tag; every kind routes to its
/// kernel module.
pub(crate) fn execute_cpu(ctx: &KernelCtx, out: &RawBuf, from: usize, len: usize) {
    match &ctx.op {
        Op::Store(data) => generators::copy_through(data, out, from, len),
        Op::Constant(value) => generators::fill_constant(*value, out, from, len),
        Op::Arange { axis } => generators::arange(ctx, *axis, out, from, len),
        Op::Random { seed } => generators::random(*seed, out, from, len),

        Op::Add => elementwise::add(ctx, out, from, len),
        Op::Sub => elementwise::sub(ctx, out, from, len),
        Op::Mul => elementwise::mul(ctx, out, from, len),
        Op::Div => elementwise::div(ctx, out, from, len),
        Op::Pow => elementwise::pow(ctx, out, from, len),
        Op::Min => elementwise::min(ctx, out, from, len),
        Op::Max => elementwise::max(ctx, out, from, len),

        Op::Neg | Op::Abs => elementwise::unary_same(ctx, out, from, len),
        Op::Sign => elementwise::sign(ctx, out, from, len),
        Op::Even => elementwise::even(ctx, out, from, len),
        Op::Log
        | Op::Log2
        | Op::Log10
        | Op::Exp
        | Op::Sqrt
        | Op::Sin
        | Op::Cos
        | Op::Tan
        | Op::Asin
        | Op::Acos
        | Op::Atan => elementwise::unary_float(ctx, out, from, len),

        Op::Less | Op::Equal | Op::Greater => elementwise::compare(ctx, out, from, len),

        Op::Flatten | Op::Reshape => shaping::passthrough(ctx, out, from, len),
        Op::Convert => elementwise::convert(ctx, out, from, len),
        Op::Transpose { perm } => shaping::transpose(ctx, perm, out, from, len),
        Op::Repeat => shaping::repeat(ctx, out, from, len),
        Op::Slice { start, step } => shaping::slice(ctx, start, step, out, from, len),
        Op::Extend { insert, step } => shaping::extend(ctx, insert, step, out, from, len),
        Op::Concat { axis } => shaping::concat(ctx, *axis, out, from, len),
        Op::Index => shaping::index(ctx, out, from, len),
        Op::IndexSet => shaping::index_set(ctx, out, from, len),
        Op::SlidingWindow { size, steps } => {
            shaping::sliding_window(ctx, size, steps, out, from, len)
        }
        Op::UnslideWindow { steps } => shaping::unslide_window(ctx, steps, out, from, len),

        Op::ReduceSum { axis } | Op::ReduceMul { axis } | Op::ReduceMin { axis }
        | Op::ReduceMax { axis } => reductions::reduce(ctx, *axis, out, from, len),

        Op::Convolve { steps } => windows::convolve(ctx, steps, out, from, len),
        Op::GradientConvolve1 { steps } => windows::gradient_convolve1(ctx, steps, out, from, len),
        Op::GradientConvolve2 { steps } => windows::gradient_convolve2(ctx, steps, out, from, len),
        Op::PoolingSum { size, steps } => windows::pooling_sum(ctx, size, steps, out, from, len),
        Op::PoolingMax { size, steps } => windows::pooling_max(ctx, size, steps, out, from, len),
        Op::GradientPoolingMax { size, steps } => {
            windows::gradient_pooling_max(ctx, size, steps, out, from, len)
        }

        Op::Dropout { seed, p } => elementwise::dropout(ctx, *seed, *p, out, from, len),
    }
}

/// Classic fractional-sine hash, identical on host and device so that a
/// dropout mask reproduces across backends and inside its own gradient.
pub(crate) fn hash_rand(seed: f64, index: usize) -> f64 {
    let v = ((index as f64 + 1.0) * 12.9898 + seed).sin() * 43758.5453;
    v - v.floor()
}

/// Expands to the sixteen valid (result, lhs, rhs) type combinations of a
/// promoting binary operation and calls the given generic kernel.
macro_rules! binary_type_dispatch {
    ($out:expr, $a:expr, $b:expr, $from:expr, $len:expr, $m:expr, $kern:ident) => {{
        use $crate::tensor::Data;
        match ($a, $b) {
            (Data::I32(x), Data::I32(y)) => {
                $kern::<i32, i32, i32>(unsafe { $out.slice_mut() }, x, y, $from, $len, $m)
            }
            (Data::I32(x), Data::I64(y)) => {
                $kern::<i64, i32, i64>(unsafe { $out.slice_mut() }, x, y, $from, $len, $m)
            }
            (Data::I32(x), Data::F32(y)) => {
                $kern::<f32, i32, f32>(unsafe { $out.slice_mut() }, x, y, $from, $len, $m)
            }
            (Data::I32(x), Data::F64(y)) => {
                $kern::<f64, i32, f64>(unsafe { $out.slice_mut() }, x, y, $from, $len, $m)
            }
            (Data::I64(x), Data::I32(y)) => {
                $kern::<i64, i64, i32>(unsafe { $out.slice_mut() }, x, y, $from, $len, $m)
            }
            (Data::I64(x), Data::I64(y)) => {
                $kern::<i64, i64, i64>(unsafe { $out.slice_mut() }, x, y, $from, $len, $m)
            }
            (Data::I64(x), Data::F32(y)) => {
                $kern::<f32, i64, f32>(unsafe { $out.slice_mut() }, x, y, $from, $len, $m)
            }
            (Data::I64(x), Data::F64(y)) => {
                $kern::<f64, i64, f64>(unsafe { $out.slice_mut() }, x, y, $from, $len, $m)
            }
            (Data::F32(x), Data::I32(y)) => {
                $kern::<f32, f32, i32>(unsafe { $out.slice_mut() }, x, y, $from, $len, $m)
            }
            (Data::F32(x), Data::I64(y)) => {
                $kern::<f32, f32, i64>(unsafe { $out.slice_mut() }, x, y, $from, $len, $m)
            }
            (Data::F32(x), Data::F32(y)) => {
                $kern::<f32, f32, f32>(unsafe { $out.slice_mut() }, x, y, $from, $len, $m)
            }
            (Data::F32(x), Data::F64(y)) => {
                $kern::<f64, f32, f64>(unsafe { $out.slice_mut() }, x, y, $from, $len, $m)
            }
            (Data::F64(x), Data::I32(y)) => {
                $kern::<f64, f64, i32>(unsafe { $out.slice_mut() }, x, y, $from, $len, $m)
            }
            (Data::F64(x), Data::I64(y)) => {
                $kern::<f64, f64, i64>(unsafe { $out.slice_mut() }, x, y, $from, $len, $m)
            }
            (Data::F64(x), Data::F32(y)) => {
                $kern::<f64, f64, f32>(unsafe { $out.slice_mut() }, x, y, $from, $len, $m)
            }
            (Data::F64(x), Data::F64(y)) => {
                $kern::<f64, f64, f64>(unsafe { $out.slice_mut() }, x, y, $from, $len, $m)
            }
        }
    }};
}

/// Expands to the four same-type arms of a type-preserving operation.
macro_rules! same_type_dispatch {
    ($out:expr, $a:expr, $body:ident, $($arg:expr),*) => {{
        use $crate::tensor::Data;
        match $a {
            Data::I32(x) => $body::<i32>(unsafe { $out.slice_mut() }, x, $($arg),*),
            Data::I64(x) => $body::<i64>(unsafe { $out.slice_mut() }, x, $($arg),*),
            Data::F32(x) => $body::<f32>(unsafe { $out.slice_mut() }, x, $($arg),*),
            Data::F64(x) => $body::<f64>(unsafe { $out.slice_mut() }, x, $($arg),*),
        }
    }};
}

pub(crate) use binary_type_dispatch;
pub(crate) use same_type_dispatch;
