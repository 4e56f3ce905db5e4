//! Windowed aggregations: convolution and its two adjoints, pooling and the
//! max-pool adjoint. As with the shape kernels everything is written in
//! gather form so a range worker only writes its own output window.

use num_traits::Zero;

use crate::ops::{same_type_dispatch, CpuNum, KernelCtx};
use crate::tensor::RawBuf;
use crate::types::{acc_sizes, window_count};

/// Advances a mixed-radix counter, returns false once it wraps back to zero.
fn advance(counters: &mut [usize], limits: &[usize]) -> bool {
    for d in (0..counters.len()).rev() {
        counters[d] += 1;
        if counters[d] < limits[d] {
            return true;
        }
        counters[d] = 0;
    }
    false
}

/// Shared index arithmetic of the convolution family. The input has shape
/// `(s..., c)`; the kernel is `(k..., c)` or, with a leading filter axis,
/// `(f, k..., c)`; windows slide over the spatial axes only.
struct ConvGeometry {
    spatial: usize,
    multi: bool,
    filters: usize,
    steps: Vec<usize>,
    kernel_sizes: Vec<usize>,
    win_counts: Vec<usize>,
    acc_input: Vec<usize>,
    /// Accumulator over one filter `(k..., c)`.
    acc_kwin: Vec<usize>,
    /// Elements of one filter.
    kernel_elems: usize,
}

impl ConvGeometry {
    fn new(input_shape: &[usize], kernel_shape: &[usize], steps: &[usize]) -> ConvGeometry {
        let spatial = input_shape.len() - 1;
        let multi = kernel_shape.len() == input_shape.len() + 1;
        let filters = if multi { kernel_shape[0] } else { 1 };
        let spatial_kernel: Vec<usize> = if multi {
            kernel_shape[1..kernel_shape.len() - 1].to_vec()
        } else {
            kernel_shape[..kernel_shape.len() - 1].to_vec()
        };
        let channels = input_shape[spatial];
        let win_counts: Vec<usize> = (0..spatial)
            .map(|d| window_count(input_shape[d], spatial_kernel[d], steps[d]))
            .collect();
        let kernel_elems = spatial_kernel.iter().product::<usize>() * channels;
        let mut kwin_dims = spatial_kernel.clone();
        kwin_dims.push(channels);
        ConvGeometry {
            spatial,
            multi,
            filters,
            steps: steps.to_vec(),
            kernel_sizes: spatial_kernel,
            win_counts,
            acc_input: acc_sizes(input_shape),
            acc_kwin: acc_sizes(&kwin_dims),
            kernel_elems,
        }
    }
}

fn convolve_kern<T: CpuNum>(
    out: &mut [T],
    input: &[T],
    from: usize,
    len: usize,
    kernel: &[T],
    g: &ConvGeometry,
    acc_out: &[usize],
    out_shape: &[usize],
) {
    for i in from..from + len {
        let filter = if g.multi {
            i % out_shape[out_shape.len() - 1]
        } else {
            0
        };
        let mut origin = 0usize;
        let mut rest = i;
        for d in 0..g.spatial {
            let w = (rest / acc_out[d]) % out_shape[d];
            rest %= acc_out[d];
            origin += w * g.steps[d] * g.acc_input[d];
        }
        let mut acc = T::zero();
        for kk in 0..g.kernel_elems {
            let mut kr = kk;
            let mut src = origin;
            for d in 0..g.spatial {
                src += (kr / g.acc_kwin[d]) * g.acc_input[d];
                kr %= g.acc_kwin[d];
            }
            src += kr; // channel axis is contiguous on the input
            acc = acc + input[src] * kernel[filter * g.kernel_elems + kk];
        }
        out[i] = acc;
    }
}

pub(crate) fn convolve(ctx: &KernelCtx, steps: &[usize], out: &RawBuf, from: usize, len: usize) {
    let g = ConvGeometry::new(&ctx.preds[0].shape, &ctx.preds[1].shape, steps);
    let acc_out = acc_sizes(&ctx.shape);
    let a = ctx.preds[0].data.as_ref();
    macro_rules! arms {
        ($($variant:ident => $t:ty),*) => {
            match (a, ctx.preds[1].data.as_ref()) {
                $((crate::tensor::Data::$variant(x), crate::tensor::Data::$variant(k)) => {
                    convolve_kern::<$t>(
                        unsafe { out.slice_mut() },
                        x,
                        from,
                        len,
                        k,
                        &g,
                        &acc_out,
                        &ctx.shape,
                    )
                })*
                _ => unreachable!("convolution operands must share a type"),
            }
        };
    }
    arms!(I32 => i32, I64 => i64, F32 => f32, F64 => f64)
}

fn grad_conv_input_kern<T: CpuNum>(
    out: &mut [T],
    kernel: &[T],
    from: usize,
    len: usize,
    adj: &[T],
    g: &ConvGeometry,
    acc_adj: &[usize],
    acc_node: &[usize],
    node_shape: &[usize],
) {
    for i in from..from + len {
        let mut pos = [0usize; 16];
        let mut rest = i;
        for d in 0..g.spatial {
            pos[d] = (rest / acc_node[d]) % node_shape[d];
            rest %= acc_node[d];
        }
        let channel = rest;
        let mut acc = T::zero();
        let mut k = vec![0usize; g.spatial];
        loop {
            let mut adj_idx = 0usize;
            let mut kflat = 0usize;
            let mut valid = true;
            for d in 0..g.spatial {
                kflat += k[d] * g.acc_kwin[d];
                if pos[d] < k[d] {
                    valid = false;
                    break;
                }
                let rel = pos[d] - k[d];
                if rel % g.steps[d] != 0 {
                    valid = false;
                    break;
                }
                let w = rel / g.steps[d];
                if w >= g.win_counts[d] {
                    valid = false;
                    break;
                }
                adj_idx += w * acc_adj[d];
            }
            if valid {
                kflat += channel;
                for f in 0..g.filters {
                    let ai = if g.multi { adj_idx + f } else { adj_idx };
                    acc = acc + adj[ai] * kernel[f * g.kernel_elems + kflat];
                }
            }
            if !advance(&mut k, &g.kernel_sizes) {
                break;
            }
        }
        out[i] = acc;
    }
}

/// Adjoint of the convolution input. Predecessors: `[kernel, adjoint]`.
pub(crate) fn gradient_convolve1(
    ctx: &KernelCtx,
    steps: &[usize],
    out: &RawBuf,
    from: usize,
    len: usize,
) {
    let g = ConvGeometry::new(&ctx.shape, &ctx.preds[0].shape, steps);
    let acc_adj = acc_sizes(&ctx.preds[1].shape);
    let acc_node = acc_sizes(&ctx.shape);
    macro_rules! arms {
        ($($variant:ident => $t:ty),*) => {
            match (ctx.preds[0].data.as_ref(), ctx.preds[1].data.as_ref()) {
                $((crate::tensor::Data::$variant(k), crate::tensor::Data::$variant(adj)) => {
                    grad_conv_input_kern::<$t>(
                        unsafe { out.slice_mut() },
                        k,
                        from,
                        len,
                        adj,
                        &g,
                        &acc_adj,
                        &acc_node,
                        &ctx.shape,
                    )
                })*
                _ => unreachable!("convolution operands must share a type"),
            }
        };
    }
    arms!(I32 => i32, I64 => i64, F32 => f32, F64 => f64)
}

fn grad_conv_kernel_kern<T: CpuNum>(
    out: &mut [T],
    input: &[T],
    from: usize,
    len: usize,
    adj: &[T],
    g: &ConvGeometry,
    acc_adj: &[usize],
) {
    for i in from..from + len {
        let filter = if g.multi { i / g.kernel_elems } else { 0 };
        let mut kr = i % g.kernel_elems;
        let mut koff = 0usize;
        for d in 0..g.spatial {
            koff += (kr / g.acc_kwin[d]) * g.acc_input[d];
            kr %= g.acc_kwin[d];
        }
        koff += kr; // channel
        let mut acc = T::zero();
        let mut w = vec![0usize; g.spatial];
        loop {
            let mut origin = 0usize;
            let mut adj_idx = 0usize;
            for d in 0..g.spatial {
                origin += w[d] * g.steps[d] * g.acc_input[d];
                adj_idx += w[d] * acc_adj[d];
            }
            if g.multi {
                adj_idx += filter;
            }
            acc = acc + adj[adj_idx] * input[origin + koff];
            if !advance(&mut w, &g.win_counts) {
                break;
            }
        }
        out[i] = acc;
    }
}

/// Adjoint of the convolution kernel. Predecessors: `[input, adjoint]`.
pub(crate) fn gradient_convolve2(
    ctx: &KernelCtx,
    steps: &[usize],
    out: &RawBuf,
    from: usize,
    len: usize,
) {
    let g = ConvGeometry::new(&ctx.preds[0].shape, &ctx.shape, steps);
    let acc_adj = acc_sizes(&ctx.preds[1].shape);
    macro_rules! arms {
        ($($variant:ident => $t:ty),*) => {
            match (ctx.preds[0].data.as_ref(), ctx.preds[1].data.as_ref()) {
                $((crate::tensor::Data::$variant(x), crate::tensor::Data::$variant(adj)) => {
                    grad_conv_kernel_kern::<$t>(
                        unsafe { out.slice_mut() },
                        x,
                        from,
                        len,
                        adj,
                        &g,
                        &acc_adj,
                    )
                })*
                _ => unreachable!("convolution operands must share a type"),
            }
        };
    }
    arms!(I32 => i32, I64 => i64, F32 => f32, F64 => f64)
}

#[derive(Clone, Copy)]
enum PoolMode {
    Sum,
    Max,
}

/// Pooling windows cover the given sizes over the spatial axes and the whole
/// channel axis; the output drops the channel axis.
struct PoolGeometry {
    spatial: usize,
    steps: Vec<usize>,
    win_limits: Vec<usize>,
    win_counts: Vec<usize>,
    acc_input: Vec<usize>,
}

impl PoolGeometry {
    fn new(input_shape: &[usize], size: &[usize], steps: &[usize]) -> PoolGeometry {
        let spatial = input_shape.len() - 1;
        let win_counts: Vec<usize> = (0..spatial)
            .map(|d| window_count(input_shape[d], size[d], steps[d]))
            .collect();
        let mut win_limits = size.to_vec();
        win_limits.push(input_shape[spatial]);
        PoolGeometry {
            spatial,
            steps: steps.to_vec(),
            win_limits,
            win_counts,
            acc_input: acc_sizes(input_shape),
        }
    }
}

fn pooling_kern<T: CpuNum>(
    out: &mut [T],
    input: &[T],
    from: usize,
    len: usize,
    g: &PoolGeometry,
    acc_out: &[usize],
    out_shape: &[usize],
    mode: PoolMode,
) {
    for i in from..from + len {
        let mut origin = 0usize;
        let mut rest = i;
        for d in 0..g.spatial {
            let w = (rest / acc_out[d]) % out_shape[d];
            rest %= acc_out[d];
            origin += w * g.steps[d] * g.acc_input[d];
        }
        let mut offs = vec![0usize; g.spatial + 1];
        let mut acc: Option<T> = None;
        loop {
            let mut src = origin;
            for d in 0..g.spatial + 1 {
                src += offs[d] * g.acc_input[d];
            }
            let v = input[src];
            acc = Some(match (acc, mode) {
                (None, _) => v,
                (Some(a), PoolMode::Sum) => a + v,
                (Some(a), PoolMode::Max) => {
                    if a < v {
                        v
                    } else {
                        a
                    }
                }
            });
            if !advance(&mut offs, &g.win_limits) {
                break;
            }
        }
        out[i] = acc.unwrap_or_else(T::zero);
    }
}

pub(crate) fn pooling_sum(
    ctx: &KernelCtx,
    size: &[usize],
    steps: &[usize],
    out: &RawBuf,
    from: usize,
    len: usize,
) {
    pooling(ctx, size, steps, out, from, len, PoolMode::Sum)
}

pub(crate) fn pooling_max(
    ctx: &KernelCtx,
    size: &[usize],
    steps: &[usize],
    out: &RawBuf,
    from: usize,
    len: usize,
) {
    pooling(ctx, size, steps, out, from, len, PoolMode::Max)
}

fn pooling(
    ctx: &KernelCtx,
    size: &[usize],
    steps: &[usize],
    out: &RawBuf,
    from: usize,
    len: usize,
    mode: PoolMode,
) {
    let g = PoolGeometry::new(&ctx.preds[0].shape, size, steps);
    let acc_out = acc_sizes(&ctx.shape);
    let a = ctx.preds[0].data.as_ref();
    same_type_dispatch!(
        out,
        a,
        pooling_kern,
        from,
        len,
        &g,
        &acc_out,
        &ctx.shape,
        mode
    )
}

fn grad_pool_max_kern<T: CpuNum>(
    out: &mut [T],
    input: &[T],
    from: usize,
    len: usize,
    adj: &[T],
    g: &PoolGeometry,
    acc_adj: &[usize],
    acc_node: &[usize],
    node_shape: &[usize],
) {
    let rank = node_shape.len();
    for i in from..from + len {
        let mut coords = [0usize; 16];
        let mut rest = i;
        for d in 0..rank {
            coords[d] = (rest / acc_node[d]) % node_shape[d];
            rest %= acc_node[d];
        }
        // spatial windows whose footprint covers this element (the channel
        // axis is always inside the window)
        let mut candidates: Vec<Vec<usize>> = Vec::with_capacity(g.spatial);
        for d in 0..g.spatial {
            let mut ws = Vec::new();
            for w in 0..g.win_counts[d] {
                let base = w * g.steps[d];
                if base <= coords[d] && coords[d] - base < g.win_limits[d] {
                    ws.push(w);
                }
            }
            candidates.push(ws);
        }
        let mut acc = T::zero();
        let mut pick = vec![0usize; g.spatial];
        'windows: loop {
            let mut origin = 0usize;
            let mut adj_idx = 0usize;
            for d in 0..g.spatial {
                let w = candidates[d][pick[d]];
                origin += w * g.steps[d] * g.acc_input[d];
                adj_idx += w * acc_adj[d];
            }
            // first maximum in window scan order receives the adjoint
            let mut offs = vec![0usize; g.spatial + 1];
            let mut best_src = None;
            let mut best: Option<T> = None;
            loop {
                let mut src = origin;
                for d in 0..g.spatial + 1 {
                    src += offs[d] * g.acc_input[d];
                }
                let v = input[src];
                if best.map_or(true, |b| b < v) {
                    best = Some(v);
                    best_src = Some(src);
                }
                if !advance(&mut offs, &g.win_limits) {
                    break;
                }
            }
            if best_src == Some(i) {
                acc = acc + adj[adj_idx];
            }
            if g.spatial == 0 {
                break 'windows;
            }
            for d in (0..g.spatial).rev() {
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

/// Scattering adjoint of max pooling. Predecessors: `[input, adjoint]`.
pub(crate) fn gradient_pooling_max(
    ctx: &KernelCtx,
    size: &[usize],
    steps: &[usize],
    out: &RawBuf,
    from: usize,
    len: usize,
) {
    let g = PoolGeometry::new(&ctx.shape, size, steps);
    let acc_adj = acc_sizes(&ctx.preds[1].shape);
    let acc_node = acc_sizes(&ctx.shape);
    macro_rules! arms {
        ($($variant:ident => $t:ty),*) => {
            match (ctx.preds[0].data.as_ref(), ctx.preds[1].data.as_ref()) {
                $((crate::tensor::Data::$variant(x), crate::tensor::Data::$variant(adj)) => {
                    grad_pool_max_kern::<$t>(
                        unsafe { out.slice_mut() },
                        x,
                        from,
                        len,
                        adj,
                        &g,
                        &acc_adj,
                        &acc_node,
                        &ctx.shape,
                    )
                })*
                _ => unreachable!("pooling operands must share a type"),
            }
        };
    }
    arms!(I32 => i32, I64 => i64, F32 => f32, F64 => f64)
}
