//! Memory-movement operations: reshaping, slicing, extending, transposing,
//! repeating, concatenation, indexed read/write and sliding windows.
//!
//! All kernels are written in gather form: each output element derives the
//! source elements it reads from its own index, so parallel range execution
//! never writes outside its window.

use num_traits::Zero;

use crate::ops::{generators, same_type_dispatch, CpuNum, KernelCtx};
use crate::tensor::{Data, RawBuf};
use crate::types::{acc_sizes, window_count};

pub(crate) fn passthrough(ctx: &KernelCtx, out: &RawBuf, from: usize, len: usize) {
    generators::copy_through(ctx.preds[0].data.as_ref(), out, from, len);
}

/// Integer index tensors come in both integer widths.
enum IdxView<'a> {
    I32(&'a [i32]),
    I64(&'a [i64]),
}

impl<'a> IdxView<'a> {
    fn of(data: &'a Data) -> IdxView<'a> {
        match data {
            Data::I32(v) => IdxView::I32(v),
            Data::I64(v) => IdxView::I64(v),
            _ => unreachable!("index tensor must be integer"),
        }
    }

    #[inline]
    fn get(&self, i: usize) -> i64 {
        match self {
            IdxView::I32(v) => v[i] as i64,
            IdxView::I64(v) => v[i] as i64,
        }
    }
}

fn transpose_kern<T: CpuNum>(
    out: &mut [T],
    data: &[T],
    from: usize,
    len: usize,
    acc_dst: &[usize],
    acc_src_perm: &[usize],
    shape: &[usize],
) {
    for i in from..from + len {
        let mut src = 0;
        let mut rest = i;
        for d in 0..shape.len() {
            src += (rest / acc_dst[d]) * acc_src_perm[d];
            rest %= acc_dst[d];
        }
        out[i] = data[src];
    }
}

pub(crate) fn transpose(ctx: &KernelCtx, perm: &[usize], out: &RawBuf, from: usize, len: usize) {
    let acc_dst = acc_sizes(&ctx.shape);
    let acc_src = acc_sizes(&ctx.preds[0].shape);
    let acc_src_perm: Vec<usize> = perm.iter().map(|&p| acc_src[p]).collect();
    let a = ctx.preds[0].data.as_ref();
    same_type_dispatch!(
        out,
        a,
        transpose_kern,
        from,
        len,
        &acc_dst,
        &acc_src_perm,
        &ctx.shape
    )
}

fn repeat_kern<T: CpuNum>(
    out: &mut [T],
    data: &[T],
    from: usize,
    len: usize,
    acc_dst: &[usize],
    acc_src: &[usize],
    src_shape: &[usize],
) {
    for i in from..from + len {
        let mut src = 0;
        let mut rest = i;
        for d in 0..src_shape.len() {
            src += ((rest / acc_dst[d]) % src_shape[d]) * acc_src[d];
            rest %= acc_dst[d];
        }
        out[i] = data[src];
    }
}

pub(crate) fn repeat(ctx: &KernelCtx, out: &RawBuf, from: usize, len: usize) {
    let acc_dst = acc_sizes(&ctx.shape);
    let acc_src = acc_sizes(&ctx.preds[0].shape);
    let a = ctx.preds[0].data.as_ref();
    same_type_dispatch!(
        out,
        a,
        repeat_kern,
        from,
        len,
        &acc_dst,
        &acc_src,
        &ctx.preds[0].shape
    )
}

fn slice_kern<T: CpuNum>(
    out: &mut [T],
    data: &[T],
    from: usize,
    len: usize,
    acc_dst: &[usize],
    acc_src: &[usize],
    shape: &[usize],
    start: &[i64],
    step: &[i64],
) {
    for i in from..from + len {
        let mut src = 0i64;
        let mut rest = i;
        for d in 0..shape.len() {
            let pos = ((rest / acc_dst[d]) % shape[d]) as i64;
            src += (start[d] + pos * step[d]) * acc_src[d] as i64;
            rest %= acc_dst[d];
        }
        out[i] = data[src as usize];
    }
}

pub(crate) fn slice(
    ctx: &KernelCtx,
    start: &[i64],
    step: &[i64],
    out: &RawBuf,
    from: usize,
    len: usize,
) {
    let acc_dst = acc_sizes(&ctx.shape);
    let acc_src = acc_sizes(&ctx.preds[0].shape);
    let a = ctx.preds[0].data.as_ref();
    same_type_dispatch!(
        out,
        a,
        slice_kern,
        from,
        len,
        &acc_dst,
        &acc_src,
        &ctx.shape,
        start,
        step
    )
}

fn extend_kern<T: CpuNum>(
    out: &mut [T],
    data: &[T],
    from: usize,
    len: usize,
    acc_dst: &[usize],
    acc_src: &[usize],
    shape: &[usize],
    src_shape: &[usize],
    insert: &[usize],
    step: &[i64],
) {
    'outer: for i in from..from + len {
        let mut src = 0usize;
        let mut rest = i;
        for d in 0..shape.len() {
            let pos = ((rest / acc_dst[d]) % shape[d]) as i64;
            rest %= acc_dst[d];
            let rel = pos - insert[d] as i64;
            let j = rel / step[d];
            if rel % step[d] != 0 || j < 0 || j >= src_shape[d] as i64 {
                out[i] = T::zero();
                continue 'outer;
            }
            src += j as usize * acc_src[d];
        }
        out[i] = data[src];
    }
}

pub(crate) fn extend(
    ctx: &KernelCtx,
    insert: &[usize],
    step: &[i64],
    out: &RawBuf,
    from: usize,
    len: usize,
) {
    let acc_dst = acc_sizes(&ctx.shape);
    let acc_src = acc_sizes(&ctx.preds[0].shape);
    let a = ctx.preds[0].data.as_ref();
    same_type_dispatch!(
        out,
        a,
        extend_kern,
        from,
        len,
        &acc_dst,
        &acc_src,
        &ctx.shape,
        &ctx.preds[0].shape,
        insert,
        step
    )
}

fn concat_kern<T: CpuNum>(
    out: &mut [T],
    parts: (&[T], &[T]),
    from: usize,
    len: usize,
    acc_dst: &[usize],
    acc_a: &[usize],
    acc_b: &[usize],
    shape: &[usize],
    axis: usize,
    split: usize,
) {
    for i in from..from + len {
        let mut rest = i;
        let mut coords = [0usize; 16];
        for d in 0..shape.len() {
            coords[d] = (rest / acc_dst[d]) % shape[d];
            rest %= acc_dst[d];
        }
        if coords[axis] < split {
            let mut src = 0;
            for d in 0..shape.len() {
                src += coords[d] * acc_a[d];
            }
            out[i] = parts.0[src];
        } else {
            let mut src = 0;
            for d in 0..shape.len() {
                let c = if d == axis { coords[d] - split } else { coords[d] };
                src += c * acc_b[d];
            }
            out[i] = parts.1[src];
        }
    }
}

pub(crate) fn concat(ctx: &KernelCtx, axis: usize, out: &RawBuf, from: usize, len: usize) {
    let acc_dst = acc_sizes(&ctx.shape);
    let acc_a = acc_sizes(&ctx.preds[0].shape);
    let acc_b = acc_sizes(&ctx.preds[1].shape);
    let split = ctx.preds[0].shape[axis];
    macro_rules! arms {
        ($($variant:ident => $t:ty),*) => {
            match (ctx.preds[0].data.as_ref(), ctx.preds[1].data.as_ref()) {
                $((Data::$variant(x), Data::$variant(y)) => concat_kern::<$t>(
                    unsafe { out.slice_mut() },
                    (x, y),
                    from,
                    len,
                    &acc_dst,
                    &acc_a,
                    &acc_b,
                    &ctx.shape,
                    axis,
                    split,
                ),)*
                _ => unreachable!("concat operands must share a type"),
            }
        };
    }
    arms!(I32 => i32, I64 => i64, F32 => f32, F64 => f64)
}

fn index_kern<T: CpuNum>(
    out: &mut [T],
    data: &[T],
    from: usize,
    len: usize,
    idx: &IdxView<'_>,
    acc_dst: &[usize],
    acc_src: &[usize],
    acc_idx: &[usize],
    shape: &[usize],
    ax: usize,
) {
    for i in from..from + len {
        let mut rest = i;
        let mut src = 0usize;
        let mut idx_flat = 0usize;
        for d in 0..shape.len() {
            let coord = (rest / acc_dst[d]) % shape[d];
            rest %= acc_dst[d];
            if d < ax {
                idx_flat += coord * acc_idx[d];
                src += coord * acc_src[d];
            } else if d == ax {
                idx_flat += coord * acc_idx[d];
                let looked_up = idx.get(idx_flat) as usize;
                src += looked_up * acc_src[d];
            } else {
                src += coord * acc_src[d];
            }
        }
        out[i] = data[src];
    }
}

pub(crate) fn index(ctx: &KernelCtx, out: &RawBuf, from: usize, len: usize) {
    let idx_shape = &ctx.preds[1].shape;
    let ax = idx_shape.len() - 1;
    let acc_dst = acc_sizes(&ctx.shape);
    let acc_src = acc_sizes(&ctx.preds[0].shape);
    let acc_idx = acc_sizes(idx_shape);
    let idx = IdxView::of(ctx.preds[1].data.as_ref());
    let a = ctx.preds[0].data.as_ref();
    same_type_dispatch!(
        out,
        a,
        index_kern,
        from,
        len,
        &idx,
        &acc_dst,
        &acc_src,
        &acc_idx,
        &ctx.shape,
        ax
    )
}

fn index_set_kern<T: CpuNum>(
    out: &mut [T],
    data: &[T],
    from: usize,
    len: usize,
    b: &[T],
    idx: &IdxView<'_>,
    acc_dst: &[usize],
    acc_b: &[usize],
    acc_idx: &[usize],
    shape: &[usize],
    ax: usize,
    selections: usize,
) {
    for i in from..from + len {
        let mut rest = i;
        let mut idx_base = 0usize;
        let mut b_base = 0usize;
        let mut target = 0usize;
        for d in 0..shape.len() {
            let coord = (rest / acc_dst[d]) % shape[d];
            rest %= acc_dst[d];
            if d < ax {
                idx_base += coord * acc_idx[d];
                b_base += coord * acc_b[d];
            } else if d == ax {
                target = coord;
            } else {
                b_base += coord * acc_b[d];
            }
        }
        // the last write along the selection axis wins
        let mut value = data[i];
        for j in 0..selections {
            if idx.get(idx_base + j * acc_idx[ax]) as usize == target {
                value = b[b_base + j * acc_b[ax]];
            }
        }
        out[i] = value;
    }
}

pub(crate) fn index_set(ctx: &KernelCtx, out: &RawBuf, from: usize, len: usize) {
    let idx_shape = &ctx.preds[2].shape;
    let ax = idx_shape.len() - 1;
    let acc_dst = acc_sizes(&ctx.shape);
    let acc_b = acc_sizes(&ctx.preds[1].shape);
    let acc_idx = acc_sizes(idx_shape);
    let selections = idx_shape[ax];
    let idx = IdxView::of(ctx.preds[2].data.as_ref());
    macro_rules! arms {
        ($($variant:ident => $t:ty),*) => {
            match (ctx.preds[0].data.as_ref(), ctx.preds[1].data.as_ref()) {
                $((Data::$variant(x), Data::$variant(y)) => index_set_kern::<$t>(
                    unsafe { out.slice_mut() },
                    x,
                    from,
                    len,
                    y,
                    &idx,
                    &acc_dst,
                    &acc_b,
                    &acc_idx,
                    &ctx.shape,
                    ax,
                    selections,
                ),)*
                _ => unreachable!("index_set operands must share a type"),
            }
        };
    }
    arms!(I32 => i32, I64 => i64, F32 => f32, F64 => f64)
}

fn sliding_window_kern<T: CpuNum>(
    out: &mut [T],
    data: &[T],
    from: usize,
    len: usize,
    acc_src: &[usize],
    acc_win: &[usize],
    win_counts: &[usize],
    size: &[usize],
    steps: &[usize],
    window_elems: usize,
) {
    for i in from..from + len {
        let mut window = i / window_elems;
        let mut offset = i % window_elems;
        let mut src = 0usize;
        for d in 0..size.len() {
            let win_acc: usize = win_counts[d + 1..].iter().product();
            let w = window / win_acc;
            window %= win_acc;
            let k = offset / acc_win[d];
            offset %= acc_win[d];
            src += (w * steps[d] + k) * acc_src[d];
        }
        out[i] = data[src];
    }
}

pub(crate) fn sliding_window(
    ctx: &KernelCtx,
    size: &[usize],
    steps: &[usize],
    out: &RawBuf,
    from: usize,
    len: usize,
) {
    let src_shape = &ctx.preds[0].shape;
    let acc_src = acc_sizes(src_shape);
    let acc_win = acc_sizes(size);
    let win_counts: Vec<usize> = (0..size.len())
        .map(|d| window_count(src_shape[d], size[d], steps[d]))
        .collect();
    let window_elems: usize = size.iter().product();
    let a = ctx.preds[0].data.as_ref();
    same_type_dispatch!(
        out,
        a,
        sliding_window_kern,
        from,
        len,
        &acc_src,
        &acc_win,
        &win_counts,
        size,
        steps,
        window_elems
    )
}

fn unslide_window_kern<T: CpuNum>(
    out: &mut [T],
    data: &[T],
    from: usize,
    len: usize,
    acc_dst: &[usize],
    acc_win: &[usize],
    win_counts: &[usize],
    shape: &[usize],
    size: &[usize],
    steps: &[usize],
    window_elems: usize,
) {
    let rank = shape.len();
    for i in from..from + len {
        let mut coords = [0usize; 16];
        let mut rest = i;
        for d in 0..rank {
            coords[d] = (rest / acc_dst[d]) % shape[d];
            rest %= acc_dst[d];
        }
        // enumerate the windows whose footprint covers this position
        let mut candidates: Vec<Vec<usize>> = Vec::with_capacity(rank);
        for d in 0..rank {
            let mut ws = Vec::new();
            for w in 0..win_counts[d] {
                let base = w * steps[d];
                if base <= coords[d] && coords[d] - base < size[d] {
                    ws.push(w);
                }
            }
            candidates.push(ws);
        }
        let mut acc = T::zero();
        let mut pick = vec![0usize; rank];
        'windows: loop {
            let mut window = 0usize;
            let mut offset = 0usize;
            for d in 0..rank {
                let win_acc: usize = win_counts[d + 1..].iter().product();
                let w = candidates[d][pick[d]];
                window += w * win_acc;
                offset += (coords[d] - w * steps[d]) * acc_win[d];
            }
            acc = acc + data[window * window_elems + offset];
            // odometer over the per-axis candidate sets
            for d in (0..rank).rev() {
                pick[d] += 1;
                if pick[d] < candidates[d].len() {
                    continue 'windows;
                }
                pick[d] = 0;
                if d == 0 {
                    break 'windows;
                }
            }
        }
        out[i] = acc;
    }
}

pub(crate) fn unslide_window(
    ctx: &KernelCtx,
    steps: &[usize],
    out: &RawBuf,
    from: usize,
    len: usize,
) {
    let win_shape = &ctx.preds[0].shape;
    let size = &win_shape[1..];
    let acc_dst = acc_sizes(&ctx.shape);
    let acc_win = acc_sizes(size);
    let win_counts: Vec<usize> = (0..size.len())
        .map(|d| window_count(ctx.shape[d], size[d], steps[d]))
        .collect();
    let window_elems: usize = size.iter().product();
    let a = ctx.preds[0].data.as_ref();
    same_type_dispatch!(
        out,
        a,
        unslide_window_kern,
        from,
        len,
        &acc_dst,
        &acc_win,
        &win_counts,
        &ctx.shape,
        size,
        steps,
        window_elems
    )
}
