use flint::{Backends, FlintError, Graph, NodeId};
use ndarray::array;

fn assert_close(actual: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        let scale = e.abs().max(1.0);
        assert!(
            (a - e).abs() / scale < tol,
            "expected {expected:?}, got {actual:?}"
        );
    }
}

#[test]
fn gradient_of_sum_of_squares() {
    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let x = g.store(&[1.0f32, 2.0, 3.0], &[3]).unwrap();
    g.mark_gradient_variable(x);
    let sq = g.mul(x, x).unwrap();
    let y = g.reduce_sum(sq, 0).unwrap();
    g.stop_gradient_context();
    let dx = g.calculate_gradient(y, x).unwrap();
    assert_eq!(g.shape(dx), &[3]);
    assert_eq!(g.values::<f64>(dx).unwrap(), vec![2.0, 4.0, 6.0]);
}

#[test]
fn gradient_shape_matches_the_variable() {
    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let x = g.store(&[1.0f64; 6], &[2, 3]).unwrap();
    g.mark_gradient_variable(x);
    let e = g.exp(x).unwrap();
    let partial = g.reduce_sum(e, 1).unwrap();
    let y = g.reduce_sum(partial, 0).unwrap();
    g.stop_gradient_context();
    let dx = g.calculate_gradient(y, x).unwrap();
    assert_eq!(g.shape(dx), &[2, 3]);
}

#[test]
fn gradients_unbroadcast_to_their_operands() {
    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let a = g.store(&[0.0f64; 6], &[2, 3]).unwrap();
    let b = g.store(&[1.0f64, 2.0, 3.0], &[3]).unwrap();
    g.mark_gradient_variable(a);
    g.mark_gradient_variable(b);
    let s = g.add(a, b).unwrap();
    let partial = g.reduce_sum(s, 1).unwrap();
    let y = g.reduce_sum(partial, 0).unwrap();
    g.stop_gradient_context();
    let grads = g.calculate_gradients(y, &[a, b]).unwrap();
    assert_eq!(g.shape(grads[0]), &[2, 3]);
    assert_eq!(g.values::<f64>(grads[0]).unwrap(), vec![1.0; 6]);
    // b is consumed by both rows
    assert_eq!(g.shape(grads[1]), &[3]);
    assert_eq!(g.values::<f64>(grads[1]).unwrap(), vec![2.0, 2.0, 2.0]);
}

#[test]
fn matmul_gradients() {
    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let a = g.store_array(&array![[1.0f64, 2.0]].into_dyn()).unwrap();
    let b = g.store_array(&array![[3.0f64], [4.0]].into_dyn()).unwrap();
    g.mark_gradient_variable(a);
    g.mark_gradient_variable(b);
    let y = g.matmul(a, b).unwrap();
    g.stop_gradient_context();
    let grads = g.calculate_gradients(y, &[a, b]).unwrap();
    assert_eq!(
        g.array::<f64>(grads[0]).unwrap(),
        array![[3.0, 4.0]].into_dyn()
    );
    assert_eq!(
        g.array::<f64>(grads[1]).unwrap(),
        array![[1.0], [2.0]].into_dyn()
    );
}

#[test]
fn central_difference_matches_analytic_gradient() {
    // y = sum(x * exp(x)), dy/dx = exp(x) * (1 + x)
    let inputs = [0.3f64, -0.8, 1.2, 0.0];
    let f = |vals: &[f64]| vals.iter().map(|v| v * v.exp()).sum::<f64>();

    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let x = g.store(&inputs, &[4]).unwrap();
    g.mark_gradient_variable(x);
    let e = g.exp(x).unwrap();
    let prod = g.mul(x, e).unwrap();
    let y = g.reduce_sum(prod, 0).unwrap();
    g.stop_gradient_context();
    let dx = g.calculate_gradient(y, x).unwrap();
    let analytic = g.values::<f64>(dx).unwrap();

    let h = 1e-5;
    for i in 0..inputs.len() {
        let mut hi = inputs.to_vec();
        let mut lo = inputs.to_vec();
        hi[i] += h;
        lo[i] -= h;
        let numeric = (f(&hi) - f(&lo)) / (2.0 * h);
        assert!(
            (numeric - analytic[i]).abs() / numeric.abs().max(1.0) < 1e-3,
            "axis {i}: numeric {numeric} vs analytic {}",
            analytic[i]
        );
    }
}

#[test]
fn division_and_power_rules() {
    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let a = g.store(&[4.0f64, 9.0], &[2]).unwrap();
    let b = g.store(&[2.0f64, 3.0], &[2]).unwrap();
    g.mark_gradient_variable(a);
    g.mark_gradient_variable(b);
    let q = g.div(a, b).unwrap();
    let y = g.reduce_sum(q, 0).unwrap();
    g.stop_gradient_context();
    let grads = g.calculate_gradients(y, &[a, b]).unwrap();
    assert_close(&g.values::<f64>(grads[0]).unwrap(), &[0.5, 1.0 / 3.0], 1e-9);
    assert_close(&g.values::<f64>(grads[1]).unwrap(), &[-1.0, -1.0], 1e-9);

    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let x = g.store(&[2.0f64, 3.0], &[2]).unwrap();
    g.mark_gradient_variable(x);
    let p = g.pow_scalar(x, 3.0f64).unwrap();
    let y = g.reduce_sum(p, 0).unwrap();
    g.stop_gradient_context();
    let dx = g.calculate_gradient(y, x).unwrap();
    assert_close(&g.values::<f64>(dx).unwrap(), &[12.0, 27.0], 1e-9);
}

#[test]
fn min_max_gradients_select_one_side() {
    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let a = g.store(&[1.0f64, 5.0], &[2]).unwrap();
    let b = g.store(&[4.0f64, 2.0], &[2]).unwrap();
    g.mark_gradient_variable(a);
    g.mark_gradient_variable(b);
    let m = g.maximum(a, b).unwrap();
    let y = g.reduce_sum(m, 0).unwrap();
    g.stop_gradient_context();
    let grads = g.calculate_gradients(y, &[a, b]).unwrap();
    assert_eq!(g.values::<f64>(grads[0]).unwrap(), vec![0.0, 1.0]);
    assert_eq!(g.values::<f64>(grads[1]).unwrap(), vec![1.0, 0.0]);
}

#[test]
fn slice_gradient_scatters_into_the_source() {
    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let x = g.store(&[1.0f64, 2.0, 3.0, 4.0, 5.0], &[5]).unwrap();
    g.mark_gradient_variable(x);
    let s = g.slice_step(x, &[1], &[4], &[1]).unwrap();
    let y = g.reduce_sum(s, 0).unwrap();
    g.stop_gradient_context();
    let dx = g.calculate_gradient(y, x).unwrap();
    assert_eq!(
        g.values::<f64>(dx).unwrap(),
        vec![0.0, 1.0, 1.0, 1.0, 0.0]
    );
}

#[test]
fn reversed_slice_gradient() {
    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let x = g.store(&[1.0f64, 2.0, 3.0, 4.0, 5.0], &[5]).unwrap();
    g.mark_gradient_variable(x);
    let s = g.slice_step(x, &[4], &[-6], &[-2]).unwrap();
    let scale = g.store(&[1.0f64, 10.0, 100.0], &[3]).unwrap();
    let scaled = g.mul(s, scale).unwrap();
    let y = g.reduce_sum(scaled, 0).unwrap();
    g.stop_gradient_context();
    let dx = g.calculate_gradient(y, x).unwrap();
    // s = [x4, x2, x0], weighted 1, 10, 100
    assert_eq!(
        g.values::<f64>(dx).unwrap(),
        vec![100.0, 0.0, 10.0, 0.0, 1.0]
    );
}

#[test]
fn reduce_max_routes_the_adjoint_to_the_winner() {
    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let x = g
        .store_array(&array![[1.0f64, 5.0], [4.0, 2.0]].into_dyn())
        .unwrap();
    g.mark_gradient_variable(x);
    let m = g.reduce_max(x, 0).unwrap();
    let y = g.reduce_sum(m, 0).unwrap();
    g.stop_gradient_context();
    let dx = g.calculate_gradient(y, x).unwrap();
    assert_eq!(
        g.array::<f64>(dx).unwrap(),
        array![[0.0, 1.0], [1.0, 0.0]].into_dyn()
    );
}

#[test]
fn transpose_gradient_transposes_back() {
    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let x = g.store(&[0.0f64; 4], &[2, 2]).unwrap();
    g.mark_gradient_variable(x);
    let t = g.transpose(x, &[1, 0]).unwrap();
    let w = g
        .store_array(&array![[1.0f64, 2.0], [3.0, 4.0]].into_dyn())
        .unwrap();
    let prod = g.mul(t, w).unwrap();
    let partial = g.reduce_sum(prod, 1).unwrap();
    let y = g.reduce_sum(partial, 0).unwrap();
    g.stop_gradient_context();
    let dx = g.calculate_gradient(y, x).unwrap();
    assert_eq!(
        g.array::<f64>(dx).unwrap(),
        array![[1.0, 3.0], [2.0, 4.0]].into_dyn()
    );
}

#[test]
fn repeat_gradient_sums_the_copies() {
    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let x = g.store(&[1.0f64, 2.0], &[2]).unwrap();
    g.mark_gradient_variable(x);
    let r = g.repeat(x, &[2]).unwrap();
    let y = g.reduce_sum(r, 0).unwrap();
    g.stop_gradient_context();
    let dx = g.calculate_gradient(y, x).unwrap();
    assert_eq!(g.values::<f64>(dx).unwrap(), vec![3.0, 3.0]);
}

#[test]
fn sliding_window_gradient_counts_coverage() {
    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let x = g.store(&[0.0f64; 5], &[5]).unwrap();
    g.mark_gradient_variable(x);
    let w = g.sliding_window(x, &[3], &[1]).unwrap();
    let flat = g.flatten(w).unwrap();
    let y = g.reduce_sum(flat, 0).unwrap();
    g.stop_gradient_context();
    let dx = g.calculate_gradient(y, x).unwrap();
    assert_eq!(
        g.values::<f64>(dx).unwrap(),
        vec![1.0, 2.0, 3.0, 2.0, 1.0]
    );
}

#[test]
fn convolution_gradients() {
    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let input = g.constant(1.0f64, &[3, 3, 1]).unwrap();
    let kernel = g
        .store(&[1.0f64, 2.0, 3.0, 4.0], &[2, 2, 1])
        .unwrap();
    g.mark_gradient_variable(input);
    g.mark_gradient_variable(kernel);
    let conv = g.convolve(input, kernel, &[1, 1]).unwrap();
    let flat = g.flatten(conv).unwrap();
    let y = g.reduce_sum(flat, 0).unwrap();
    g.stop_gradient_context();
    let grads = g.calculate_gradients(y, &[input, kernel]).unwrap();
    // every kernel element sees all four windows of ones
    assert_eq!(g.shape(grads[1]), &[2, 2, 1]);
    assert_eq!(g.values::<f64>(grads[1]).unwrap(), vec![4.0; 4]);
    // every input element accumulates the kernel entries of the windows
    // covering it
    assert_eq!(g.shape(grads[0]), &[3, 3, 1]);
    assert_eq!(
        g.values::<f64>(grads[0]).unwrap(),
        vec![1.0, 3.0, 2.0, 4.0, 10.0, 6.0, 3.0, 7.0, 4.0]
    );
}

#[test]
fn max_pooling_gradient_scatters_to_the_maximum() {
    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let x = g.store(&[1.0f64, 3.0, 2.0, 4.0], &[4, 1]).unwrap();
    g.mark_gradient_variable(x);
    let pooled = g.pooling_max(x, &[2], &[2]).unwrap();
    let y = g.reduce_sum(pooled, 0).unwrap();
    g.stop_gradient_context();
    let dx = g.calculate_gradient(y, x).unwrap();
    assert_eq!(g.values::<f64>(dx).unwrap(), vec![0.0, 1.0, 0.0, 1.0]);
}

#[test]
fn sum_pooling_gradient_is_uniform_coverage() {
    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let x = g.store(&[1.0f64, 2.0, 3.0, 4.0], &[4, 1]).unwrap();
    g.mark_gradient_variable(x);
    let pooled = g.pooling_sum(x, &[2], &[2]).unwrap();
    let y = g.reduce_sum(pooled, 0).unwrap();
    g.stop_gradient_context();
    let dx = g.calculate_gradient(y, x).unwrap();
    assert_eq!(g.values::<f64>(dx).unwrap(), vec![1.0; 4]);
}

#[test]
fn dropout_gradient_reproduces_the_mask() {
    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let x = g.constant(2.0f64, &[256]).unwrap();
    g.mark_gradient_variable(x);
    let dropped = g.dropout(x, 0.4).unwrap();
    let y = g.reduce_sum(dropped, 0).unwrap();
    g.stop_gradient_context();
    let forward = g.values::<f64>(dropped).unwrap();
    let dx = g.calculate_gradient(y, x).unwrap();
    let grad = g.values::<f64>(dx).unwrap();
    for i in 0..forward.len() {
        if forward[i] == 0.0 {
            assert_eq!(grad[i], 0.0);
        } else {
            assert_eq!(grad[i], 1.0);
        }
    }
}

#[test]
fn deriving_without_tracking_is_an_error() {
    let mut g = Graph::new(Backends::CPU);
    let x = g.store(&[1.0f64, 2.0], &[2]).unwrap();
    let y = g.reduce_sum(x, 0).unwrap();
    assert!(matches!(
        g.calculate_gradients(y, &[x]),
        Err(FlintError::IllegalDerive)
    ));
}

#[test]
fn diamond_graphs_accumulate_adjoints() {
    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let x = g.store(&[2.0f64, 3.0], &[2]).unwrap();
    g.mark_gradient_variable(x);
    let a = g.mul(x, x).unwrap();
    let b = g.add_scalar(x, 1.0f64).unwrap();
    let s = g.add(a, b).unwrap();
    let y = g.reduce_sum(s, 0).unwrap();
    g.stop_gradient_context();
    let dx = g.calculate_gradient(y, x).unwrap();
    // d/dx (x^2 + x + 1) = 2x + 1
    assert_eq!(g.values::<f64>(dx).unwrap(), vec![5.0, 7.0]);
}

fn build_square_sum(g: &mut Graph, x: NodeId) -> NodeId {
    let sq = g.mul(x, x).unwrap();
    let y = g.reduce_sum(sq, 0).unwrap();
    g.release(sq);
    y
}

#[test]
fn gradients_can_be_taken_repeatedly() {
    let mut g = Graph::new(Backends::CPU);
    g.start_gradient_context();
    let x = g.store(&[1.0f64, -2.0], &[2]).unwrap();
    g.mark_gradient_variable(x);
    let y = build_square_sum(&mut g, x);
    g.stop_gradient_context();
    let first = g.calculate_gradient(y, x).unwrap();
    let second = g.calculate_gradient(y, x).unwrap();
    assert_eq!(
        g.values::<f64>(first).unwrap(),
        g.values::<f64>(second).unwrap()
    );
}
