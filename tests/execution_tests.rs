use flint::{Backends, Graph};
use ndarray::array;

#[test]
fn broadcast_add_matches_reference() {
    let mut g = Graph::new(Backends::CPU);
    let a = g
        .store_array(&array![[1i32, 2, 3], [4, 5, 6]].into_dyn())
        .unwrap();
    let b = g.store_array(&array![10i32, 20, 30].into_dyn()).unwrap();
    let c = g.add(a, b).unwrap();
    assert_eq!(
        g.array::<i32>(c).unwrap(),
        array![[11, 22, 33], [14, 25, 36]].into_dyn()
    );
}

#[test]
fn matmul_two_by_three() {
    let mut g = Graph::new(Backends::CPU);
    let a = g
        .store_array(&array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]].into_dyn())
        .unwrap();
    let b = g
        .store_array(&array![[1.0f32, 0.0], [0.0, 1.0], [1.0, 1.0]].into_dyn())
        .unwrap();
    let c = g.matmul(a, b).unwrap();
    assert_eq!(g.shape(c), &[2, 2]);
    assert_eq!(
        g.array::<f32>(c).unwrap(),
        array![[4.0, 5.0], [10.0, 11.0]].into_dyn()
    );
}

#[test]
fn batched_matmul() {
    let mut g = Graph::new(Backends::CPU);
    // two stacked identity multiplications
    let a = g
        .store(&[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], &[2, 2, 2])
        .unwrap();
    let eye = g
        .store(&[1.0f64, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0], &[2, 2, 2])
        .unwrap();
    let c = g.matmul(a, eye).unwrap();
    assert_eq!(g.shape(c), &[2, 2, 2]);
    assert_eq!(
        g.values::<f64>(c).unwrap(),
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]
    );
}

#[test]
fn reductions_over_one_axis() {
    let mut g = Graph::new(Backends::CPU);
    let t = g
        .store_array(&array![[1i32, 2, 3], [4, 5, 6]].into_dyn())
        .unwrap();
    let s1 = g.reduce_sum(t, 1).unwrap();
    assert_eq!(g.values::<i32>(s1).unwrap(), vec![6, 15]);
    let s0 = g.reduce_sum(t, 0).unwrap();
    assert_eq!(g.values::<i32>(s0).unwrap(), vec![5, 7, 9]);
    let p = g.reduce_mul(t, 1).unwrap();
    assert_eq!(g.values::<i32>(p).unwrap(), vec![6, 120]);
    let mn = g.reduce_min(t, 0).unwrap();
    assert_eq!(g.values::<i32>(mn).unwrap(), vec![1, 2, 3]);
    let mx = g.reduce_max(t, 1).unwrap();
    assert_eq!(g.values::<i32>(mx).unwrap(), vec![3, 6]);
}

#[test]
fn convolution_of_ones() {
    let mut g = Graph::new(Backends::CPU);
    let input = g.constant(1.0f32, &[4, 4, 1]).unwrap();
    let kernel = g.constant(1.0f32, &[3, 3, 1]).unwrap();
    let out = g.convolve(input, kernel, &[1, 1]).unwrap();
    assert_eq!(g.shape(out), &[2, 2]);
    assert_eq!(g.values::<f32>(out).unwrap(), vec![9.0; 4]);
    // a bank with a single filter keeps the channel axis
    let bank = g.constant(1.0f32, &[1, 3, 3, 1]).unwrap();
    let out2 = g.convolve(input, bank, &[1, 1, 1]).unwrap();
    assert_eq!(g.shape(out2), &[2, 2, 1]);
    assert_eq!(g.values::<f32>(out2).unwrap(), vec![9.0; 4]);
}

#[test]
fn strided_convolution_shapes() {
    let mut g = Graph::new(Backends::CPU);
    let input = g.constant(1.0f64, &[5, 5, 2]).unwrap();
    let kernel = g.constant(1.0f64, &[3, 2, 2]).unwrap();
    let out = g.convolve(input, kernel, &[2, 1]).unwrap();
    // ceil((5 - 3 + 1) / 2) = 2, ceil((5 - 2 + 1) / 1) = 4
    assert_eq!(g.shape(out), &[2, 4]);
    assert_eq!(g.values::<f64>(out).unwrap(), vec![12.0; 8]);
}

#[test]
fn elementwise_mixed_type_arithmetic() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[7i32, -4, 0], &[3]).unwrap();
    let b = g.store(&[2.0f64, 2.0, 2.0], &[3]).unwrap();
    let q = g.div(a, b).unwrap();
    assert_eq!(g.values::<f64>(q).unwrap(), vec![3.5, -2.0, 0.0]);
    // integer division truncates
    let c = g.store(&[2i32, 2, 2], &[3]).unwrap();
    let iq = g.div(a, c).unwrap();
    assert_eq!(g.values::<i32>(iq).unwrap(), vec![3, -2, 0]);
}

#[test]
fn unary_and_comparison_values() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[-2i32, 0, 5], &[3]).unwrap();
    let s = g.sign(a).unwrap();
    assert_eq!(g.values::<i32>(s).unwrap(), vec![-1, 1, 1]);
    let e = g.even(a).unwrap();
    assert_eq!(g.values::<i32>(e).unwrap(), vec![1, 1, 0]);
    let n = g.neg(a).unwrap();
    assert_eq!(g.values::<i32>(n).unwrap(), vec![2, 0, -5]);
    let b = g.store(&[0i32, 0, 9], &[3]).unwrap();
    let less = g.less(a, b).unwrap();
    assert_eq!(g.values::<i32>(less).unwrap(), vec![1, 0, 1]);
    let eq = g.equal(a, b).unwrap();
    assert_eq!(g.values::<i32>(eq).unwrap(), vec![0, 1, 0]);
    let gt = g.greater(a, b).unwrap();
    assert_eq!(g.values::<i32>(gt).unwrap(), vec![0, 0, 0]);
}

#[test]
fn minimum_maximum_and_pow() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[1.0f64, 5.0, 3.0], &[3]).unwrap();
    let b = g.store(&[4.0f64, 2.0, 3.0], &[3]).unwrap();
    let mn = g.minimum(a, b).unwrap();
    assert_eq!(g.values::<f64>(mn).unwrap(), vec![1.0, 2.0, 3.0]);
    let mx = g.maximum(a, b).unwrap();
    assert_eq!(g.values::<f64>(mx).unwrap(), vec![4.0, 5.0, 3.0]);
    let p = g.pow_scalar(a, 2.0f64).unwrap();
    assert_eq!(g.values::<f64>(p).unwrap(), vec![1.0, 25.0, 9.0]);
    let ip = g.store(&[2i32, 3, 4], &[3]).unwrap();
    let ip2 = g.pow_scalar(ip, 2i32).unwrap();
    assert_eq!(g.values::<i32>(ip2).unwrap(), vec![4, 9, 16]);
}

#[test]
fn scalar_builders_wrap_constants() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[1.0f32, 2.0], &[2]).unwrap();
    let r = g.scalar_sub(10.0f32, a).unwrap();
    assert_eq!(g.values::<f32>(r).unwrap(), vec![9.0, 8.0]);
    let d = g.scalar_div(8.0f32, a).unwrap();
    assert_eq!(g.values::<f32>(d).unwrap(), vec![8.0, 4.0]);
    let half = g.max_scalar(a, 1.5f32).unwrap();
    assert_eq!(g.values::<f32>(half).unwrap(), vec![1.5, 2.0]);
}

#[test]
fn arange_counts_along_its_axis() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.arange(&[2, 3], 1).unwrap();
    assert_eq!(g.values::<i64>(a).unwrap(), vec![0, 1, 2, 0, 1, 2]);
    let b = g.arange(&[2, 3], 0).unwrap();
    assert_eq!(g.values::<i64>(b).unwrap(), vec![0, 0, 0, 1, 1, 1]);
}

#[test]
fn random_values_stay_in_unit_interval() {
    let mut g = Graph::new(Backends::CPU);
    let r = g.random(&[512]).unwrap();
    let vals = g.values::<f64>(r).unwrap();
    assert!(vals.iter().all(|&v| (0.0..1.0).contains(&v)));
    // not all identical
    assert!(vals.windows(2).any(|w| w[0] != w[1]));
}

#[test]
fn dropout_zeroes_or_passes_through() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.constant(3.0f64, &[1000]).unwrap();
    let keep_all = g.dropout(a, 0.0).unwrap();
    assert_eq!(g.values::<f64>(keep_all).unwrap(), vec![3.0; 1000]);
    let half = g.dropout(a, 0.5).unwrap();
    let vals = g.values::<f64>(half).unwrap();
    assert!(vals.iter().all(|&v| v == 0.0 || v == 3.0));
    let kept = vals.iter().filter(|&&v| v != 0.0).count();
    assert!(kept > 250 && kept < 750);
}

#[test]
fn large_outputs_take_the_parallel_path() {
    let mut g = Graph::new(Backends::CPU);
    let n = 100_000usize;
    let data: Vec<f32> = (0..n).map(|i| (i % 100) as f32).collect();
    let a = g.store(&data, &[n]).unwrap();
    let b = g.sqrt(a).unwrap();
    let c = g.add(b, b).unwrap();
    let vals = g.values::<f32>(c).unwrap();
    assert_eq!(vals.len(), n);
    for (i, &v) in vals.iter().enumerate().step_by(9973) {
        let expect = 2.0 * ((i % 100) as f32).sqrt();
        assert!((v - expect).abs() < 1e-5);
    }
}

#[test]
fn pooling_sum_and_max() {
    let mut g = Graph::new(Backends::CPU);
    let a = g
        .store(&[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], &[4, 2])
        .unwrap();
    // windows of two rows, stride two, spanning both channels
    let sum = g.pooling_sum(a, &[2], &[2]).unwrap();
    assert_eq!(g.shape(sum), &[2]);
    assert_eq!(g.values::<f64>(sum).unwrap(), vec![10.0, 26.0]);
    let mx = g.pooling_max(a, &[2], &[2]).unwrap();
    assert_eq!(g.values::<f64>(mx).unwrap(), vec![4.0, 8.0]);
}

#[test]
fn results_persist_between_execution_calls() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[1.0f64, 2.0], &[2]).unwrap();
    let b = g.mul_scalar(a, 3.0f64).unwrap();
    g.execute(b).unwrap();
    g.release(a);
    // the memoized result keeps working even after the input was released
    assert_eq!(g.values::<f64>(b).unwrap(), vec![3.0, 6.0]);
}

#[test]
fn cleanup_is_reinitializable() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[2.0f32], &[1]).unwrap();
    let b = g.exp(a).unwrap();
    g.execute(b).unwrap();
    g.cleanup();
    let c = g.log(b).unwrap();
    let vals = g.values::<f32>(c).unwrap();
    assert!((vals[0] - 2.0).abs() < 1e-6);
}
