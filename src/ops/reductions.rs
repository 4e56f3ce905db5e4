//! Reductions over a single axis.

use num_traits::{Bounded, One, Zero};

use crate::ops::{same_type_dispatch, CpuNum, KernelCtx, Op};
use crate::tensor::RawBuf;

#[derive(Clone, Copy)]
enum Mode {
    Sum,
    Mul,
    Min,
    Max,
}

fn reduce_kern<T: CpuNum>(
    out: &mut [T],
    data: &[T],
    from: usize,
    len: usize,
    mode: Mode,
    extent: usize,
    it_dim: usize,
) {
    for i in from..from + len {
        // base of the reduction lane this output element accumulates
        let base = (i / it_dim) * it_dim * extent + i % it_dim;
        let mut acc = match mode {
            Mode::Sum => T::zero(),
            Mode::Mul => T::one(),
            Mode::Min => T::max_value(),
            Mode::Max => T::min_value(),
        };
        for j in 0..extent {
            let v = data[base + j * it_dim];
            acc = match mode {
                Mode::Sum => acc + v,
                Mode::Mul => acc * v,
                Mode::Min => {
                    if v < acc {
                        v
                    } else {
                        acc
                    }
                }
                Mode::Max => {
                    if acc < v {
                        v
                    } else {
                        acc
                    }
                }
            };
        }
        out[i] = acc;
    }
}

pub(crate) fn reduce(ctx: &KernelCtx, axis: usize, out: &RawBuf, from: usize, len: usize) {
    let pred_shape = &ctx.preds[0].shape;
    let extent = pred_shape[axis];
    let it_dim: usize = pred_shape[axis + 1..].iter().product();
    let mode = match ctx.op {
        Op::ReduceSum { .. } => Mode::Sum,
        Op::ReduceMul { .. } => Mode::Mul,
        Op::ReduceMin { .. } => Mode::Min,
        Op::ReduceMax { .. } => Mode::Max,
        _ => unreachable!(),
    };
    let a = ctx.preds[0].data.as_ref();
    same_type_dispatch!(out, a, reduce_kern, from, len, mode, extent, it_dim)
}
