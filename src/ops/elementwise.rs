//! Element-wise arithmetic, comparisons, conversion and dropout.

use num_traits::{AsPrimitive, Zero};

use crate::ops::{
    binary_manips, binary_type_dispatch, hash_rand, same_type_dispatch, BinManip, CpuNum,
    KernelCtx, Op,
};
use crate::tensor::{Data, Element, RawBuf};
use crate::types::FType;

macro_rules! binary_kernel {
    ($name:ident, $kern:ident, |$x:ident, $y:ident| $e:expr) => {
        fn $kern<R, A, B>(out: &mut [R], a: &[A], b: &[B], from: usize, len: usize, m: BinManip)
        where
            R: CpuNum,
            A: Element + AsPrimitive<R>,
            B: Element + AsPrimitive<R>,
        {
            for i in from..from + len {
                let $x: R = a[(i / m.div_a) % m.mod_a].as_();
                let $y: R = b[(i / m.div_b) % m.mod_b].as_();
                out[i] = $e;
            }
        }

        pub(crate) fn $name(ctx: &KernelCtx, out: &RawBuf, from: usize, len: usize) {
            let m = binary_manips(ctx);
            let a = ctx.preds[0].data.as_ref();
            let b = ctx.preds[1].data.as_ref();
            binary_type_dispatch!(out, a, b, from, len, m, $kern)
        }
    };
}

binary_kernel!(add, add_kern, |x, y| x + y);
binary_kernel!(sub, sub_kern, |x, y| x - y);
binary_kernel!(mul, mul_kern, |x, y| x * y);
binary_kernel!(div, div_kern, |x, y| x / y);
binary_kernel!(min, min_kern, |x, y| if y < x { y } else { x });
binary_kernel!(max, max_kern, |x, y| if x < y { y } else { x });

fn pow_kern<R, A, B>(out: &mut [R], a: &[A], b: &[B], from: usize, len: usize, m: BinManip)
where
    R: CpuNum,
    A: Element + AsPrimitive<R>,
    B: Element + AsPrimitive<R>,
{
    for i in from..from + len {
        let x: f64 = a[(i / m.div_a) % m.mod_a].as_();
        let y: f64 = b[(i / m.div_b) % m.mod_b].as_();
        out[i] = R::from_f64(x.powf(y));
    }
}

pub(crate) fn pow(ctx: &KernelCtx, out: &RawBuf, from: usize, len: usize) {
    let m = binary_manips(ctx);
    let a = ctx.preds[0].data.as_ref();
    let b = ctx.preds[1].data.as_ref();
    binary_type_dispatch!(out, a, b, from, len, m, pow_kern)
}

/// Comparisons always produce int32 regardless of operand types.
pub(crate) fn compare(ctx: &KernelCtx, out: &RawBuf, from: usize, len: usize) {
    let m = binary_manips(ctx);
    let a = ctx.preds[0].data.as_ref();
    let b = ctx.preds[1].data.as_ref();
    let o: &mut [i32] = unsafe { out.slice_mut() };
    let cmp: fn(f64, f64) -> bool = match ctx.op {
        Op::Less => |x, y| x < y,
        Op::Equal => |x, y| x == y,
        Op::Greater => |x, y| x > y,
        _ => unreachable!(),
    };
    for i in from..from + len {
        let x = a.get_f64((i / m.div_a) % m.mod_a);
        let y = b.get_f64((i / m.div_b) % m.mod_b);
        o[i] = if cmp(x, y) { 1 } else { 0 };
    }
}

fn neg_kern<T: CpuNum>(out: &mut [T], a: &[T], from: usize, len: usize) {
    for i in from..from + len {
        out[i] = T::zero() - a[i];
    }
}

fn abs_kern<T: CpuNum>(out: &mut [T], a: &[T], from: usize, len: usize) {
    for i in from..from + len {
        let x = a[i];
        out[i] = if x < T::zero() { T::zero() - x } else { x };
    }
}

pub(crate) fn unary_same(ctx: &KernelCtx, out: &RawBuf, from: usize, len: usize) {
    let a = ctx.preds[0].data.as_ref();
    match ctx.op {
        Op::Neg => same_type_dispatch!(out, a, neg_kern, from, len),
        Op::Abs => same_type_dispatch!(out, a, abs_kern, from, len),
        _ => unreachable!(),
    }
}

macro_rules! float_unary_arms {
    ($a:expr, $out:expr, $from:expr, $len:expr, $f:ident) => {
        match $a {
            Data::F32(x) => {
                let o: &mut [f32] = unsafe { $out.slice_mut() };
                for i in $from..$from + $len {
                    o[i] = x[i].$f();
                }
            }
            Data::F64(x) => {
                let o: &mut [f64] = unsafe { $out.slice_mut() };
                for i in $from..$from + $len {
                    o[i] = x[i].$f();
                }
            }
            _ => unreachable!("transcendental on integer input"),
        }
    };
}

/// Transcendentals only ever see float inputs, the builder converts integer
/// operands beforehand.
pub(crate) fn unary_float(ctx: &KernelCtx, out: &RawBuf, from: usize, len: usize) {
    let a = ctx.preds[0].data.as_ref();
    match ctx.op {
        Op::Log => float_unary_arms!(a, out, from, len, ln),
        Op::Log2 => float_unary_arms!(a, out, from, len, log2),
        Op::Log10 => float_unary_arms!(a, out, from, len, log10),
        Op::Exp => float_unary_arms!(a, out, from, len, exp),
        Op::Sqrt => float_unary_arms!(a, out, from, len, sqrt),
        Op::Sin => float_unary_arms!(a, out, from, len, sin),
        Op::Cos => float_unary_arms!(a, out, from, len, cos),
        Op::Tan => float_unary_arms!(a, out, from, len, tan),
        Op::Asin => float_unary_arms!(a, out, from, len, asin),
        Op::Acos => float_unary_arms!(a, out, from, len, acos),
        Op::Atan => float_unary_arms!(a, out, from, len, atan),
        _ => unreachable!(),
    }
}

fn sign_kern<T: CpuNum>(out: &mut [i32], a: &[T], from: usize, len: usize) {
    for i in from..from + len {
        out[i] = if a[i] < T::zero() { -1 } else { 1 };
    }
}

pub(crate) fn sign(ctx: &KernelCtx, out: &RawBuf, from: usize, len: usize) {
    let o: &mut [i32] = unsafe { out.slice_mut() };
    match ctx.preds[0].data.as_ref() {
        Data::I32(x) => sign_kern(o, x, from, len),
        Data::I64(x) => sign_kern(o, x, from, len),
        Data::F32(x) => sign_kern(o, x, from, len),
        Data::F64(x) => sign_kern(o, x, from, len),
    }
}

pub(crate) fn even(ctx: &KernelCtx, out: &RawBuf, from: usize, len: usize) {
    let o: &mut [i32] = unsafe { out.slice_mut() };
    match ctx.preds[0].data.as_ref() {
        Data::I32(x) => {
            for i in from..from + len {
                o[i] = if x[i] % 2 == 0 { 1 } else { 0 };
            }
        }
        Data::I64(x) => {
            for i in from..from + len {
                o[i] = if x[i] % 2 == 0 { 1 } else { 0 };
            }
        }
        _ => unreachable!("even on float input"),
    }
}

fn convert_to<R>(a: &Data, out: &RawBuf, from: usize, len: usize)
where
    R: CpuNum,
    i32: AsPrimitive<R>,
    i64: AsPrimitive<R>,
    f32: AsPrimitive<R>,
    f64: AsPrimitive<R>,
{
    let o: &mut [R] = unsafe { out.slice_mut() };
    match a {
        Data::I32(x) => {
            for i in from..from + len {
                o[i] = x[i].as_();
            }
        }
        Data::I64(x) => {
            for i in from..from + len {
                o[i] = x[i].as_();
            }
        }
        Data::F32(x) => {
            for i in from..from + len {
                o[i] = x[i].as_();
            }
        }
        Data::F64(x) => {
            for i in from..from + len {
                o[i] = x[i].as_();
            }
        }
    }
}

pub(crate) fn convert(ctx: &KernelCtx, out: &RawBuf, from: usize, len: usize) {
    let a = ctx.preds[0].data.as_ref();
    match ctx.ftype {
        FType::I32 => convert_to::<i32>(a, out, from, len),
        FType::I64 => convert_to::<i64>(a, out, from, len),
        FType::F32 => convert_to::<f32>(a, out, from, len),
        FType::F64 => convert_to::<f64>(a, out, from, len),
    }
}

fn dropout_kern<T: CpuNum>(out: &mut [T], a: &[T], from: usize, len: usize, seed: f64, p: f64) {
    for i in from..from + len {
        out[i] = if hash_rand(seed, i) < p { T::zero() } else { a[i] };
    }
}

pub(crate) fn dropout(ctx: &KernelCtx, seed: f64, p: f64, out: &RawBuf, from: usize, len: usize) {
    let a = ctx.preds[0].data.as_ref();
    same_type_dispatch!(out, a, dropout_kern, from, len, seed, p)
}
