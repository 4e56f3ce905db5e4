//! Leaf generators: literal data, constants, arange and random.

use crate::ops::{hash_rand, KernelCtx};
use crate::tensor::{Data, RawBuf};
use crate::types::{acc_sizes, Scalar};

pub(crate) fn copy_through(data: &Data, out: &RawBuf, from: usize, len: usize) {
    match data {
        Data::I32(x) => {
            let o: &mut [i32] = unsafe { out.slice_mut() };
            o[from..from + len].copy_from_slice(&x[from..from + len]);
        }
        Data::I64(x) => {
            let o: &mut [i64] = unsafe { out.slice_mut() };
            o[from..from + len].copy_from_slice(&x[from..from + len]);
        }
        Data::F32(x) => {
            let o: &mut [f32] = unsafe { out.slice_mut() };
            o[from..from + len].copy_from_slice(&x[from..from + len]);
        }
        Data::F64(x) => {
            let o: &mut [f64] = unsafe { out.slice_mut() };
            o[from..from + len].copy_from_slice(&x[from..from + len]);
        }
    }
}

pub(crate) fn fill_constant(value: Scalar, out: &RawBuf, from: usize, len: usize) {
    match value {
        Scalar::I32(v) => {
            let o: &mut [i32] = unsafe { out.slice_mut() };
            o[from..from + len].fill(v);
        }
        Scalar::I64(v) => {
            let o: &mut [i64] = unsafe { out.slice_mut() };
            o[from..from + len].fill(v);
        }
        Scalar::F32(v) => {
            let o: &mut [f32] = unsafe { out.slice_mut() };
            o[from..from + len].fill(v);
        }
        Scalar::F64(v) => {
            let o: &mut [f64] = unsafe { out.slice_mut() };
            o[from..from + len].fill(v);
        }
    }
}

/// Writes the coordinate along `axis` of every element, int64.
pub(crate) fn arange(ctx: &KernelCtx, axis: usize, out: &RawBuf, from: usize, len: usize) {
    let acc = acc_sizes(&ctx.shape);
    let extent = ctx.shape[axis];
    let o: &mut [i64] = unsafe { out.slice_mut() };
    for i in from..from + len {
        o[i] = ((i / acc[axis]) % extent) as i64;
    }
}

pub(crate) fn random(seed: f64, out: &RawBuf, from: usize, len: usize) {
    let o: &mut [f64] = unsafe { out.slice_mut() };
    for i in from..from + len {
        o[i] = hash_rand(seed, i);
    }
}
