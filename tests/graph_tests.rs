use flint::{Backends, FlintError, Graph};
use ndarray::array;

#[test]
fn binary_shapes_promote_by_rank() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[0i32; 6], &[2, 3]).unwrap();
    let b = g.store(&[0i32; 3], &[3]).unwrap();
    let c = g.add(a, b).unwrap();
    assert_eq!(g.shape(c), &[2, 3]);

    // scalar operands broadcast against anything
    let s = g.store(&[1.5f64], &[1]).unwrap();
    let d = g.mul(a, s).unwrap();
    assert_eq!(g.shape(d), &[2, 3]);
    assert_eq!(g.ftype(d), flint::FType::F64);
}

#[test]
fn type_promotion_follows_the_lattice() {
    let mut g = Graph::new(Backends::CPU);
    let i = g.store(&[1i32, 2], &[2]).unwrap();
    let l = g.store(&[1i64, 2], &[2]).unwrap();
    let f = g.store(&[1.0f32, 2.0], &[2]).unwrap();
    let il = g.add(i, l).unwrap();
    let lf = g.add(l, f).unwrap();
    assert_eq!(g.ftype(il), flint::FType::I64);
    assert_eq!(g.ftype(lf), flint::FType::F32);
    // transcendentals pull integers up to float64
    let log = g.log(i).unwrap();
    assert_eq!(g.ftype(log), flint::FType::F64);
}

#[test]
fn incompatible_shapes_are_rejected() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[0i32; 6], &[2, 3]).unwrap();
    let b = g.store(&[0i32; 4], &[4]).unwrap();
    assert!(matches!(
        g.add(a, b),
        Err(FlintError::IncompatibleShapes { .. })
    ));
    assert!(matches!(
        g.reshape(a, &[4, 2]),
        Err(FlintError::IncompatibleShapes { .. })
    ));
    let m = g.store(&[0.0f32; 6], &[3, 2]).unwrap();
    assert!(matches!(
        g.matmul(a, m),
        Err(FlintError::IncompatibleShapes { .. })
    ));
}

#[test]
fn inverse_broadcasting_aligns_leading_axes() {
    let mut g = Graph::new(Backends::CPU);
    let a_vals: Vec<f64> = (0..24).map(|v| v as f64).collect();
    let b_vals: Vec<f64> = (0..6).map(|v| (v * 10) as f64).collect();
    let a = g.store(&a_vals, &[2, 3, 4]).unwrap();
    let b = g.store(&b_vals, &[2, 3]).unwrap();
    // (2, 3) only matches the leading axes of (2, 3, 4)
    let c = g.add(a, b).unwrap();
    let vals = g.values::<f64>(c).unwrap();
    for i in 0..2 {
        for j in 0..3 {
            for k in 0..4 {
                let flat = i * 12 + j * 4 + k;
                assert_eq!(vals[flat], a_vals[flat] + b_vals[i * 3 + j]);
            }
        }
    }
}

#[test]
fn ambiguous_alignment_prefers_forward_unless_enforced() {
    let mut g = Graph::new(Backends::CPU);
    let a_vals: Vec<f64> = (0..8).map(|v| v as f64).collect();
    let a = g.store(&a_vals, &[2, 2, 2]).unwrap();
    let b = g.store(&[100.0, 200.0, 300.0, 400.0], &[2, 2]).unwrap();
    // both alignments match, forward wins by default
    let fwd = g.add(a, b).unwrap();
    let fwd_vals = g.values::<f64>(fwd).unwrap();
    assert_eq!(fwd_vals[0], 100.0);
    assert_eq!(fwd_vals[4], 4.0 + 100.0);
    // the enforced operand flips the interpretation
    g.enforce_inverse_broadcasting(b);
    let inv = g.add(a, b).unwrap();
    let inv_vals = g.values::<f64>(inv).unwrap();
    assert_eq!(inv_vals[0], 100.0);
    assert_eq!(inv_vals[1], 1.0 + 100.0);
    assert_eq!(inv_vals[4], 4.0 + 300.0);
}

#[test]
fn reference_counts_track_edges_and_handles() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[1.0f32, 2.0], &[2]).unwrap();
    assert_eq!(g.reference_count(a), 1);
    let b = g.neg(a).unwrap();
    assert_eq!(g.reference_count(a), 2);
    let c = g.add(a, b).unwrap();
    assert_eq!(g.reference_count(a), 3);
    assert_eq!(g.reference_count(b), 2);
    assert_eq!(g.reference_count(c), 1);
}

#[test]
fn release_cascades_without_leaking() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[1.0f32, 2.0], &[2]).unwrap();
    let b = g.sqrt(a).unwrap();
    let c = g.exp(b).unwrap();
    assert_eq!(g.live_nodes(), 3);
    // the root handle keeps the whole chain alive
    g.release(a);
    g.release(b);
    assert_eq!(g.live_nodes(), 3);
    g.release(c);
    assert_eq!(g.live_nodes(), 0);
}

#[test]
fn shared_nodes_survive_partial_release() {
    let mut g = Graph::new(Backends::CPU);
    let x = g.store(&[2.0f64], &[1]).unwrap();
    let a = g.mul(x, x).unwrap();
    let b = g.add_scalar(x, 1.0f64).unwrap();
    g.release(a);
    // x still reachable through b and the external handle
    assert!(g.values::<f64>(b).unwrap() == vec![3.0]);
    g.release(b);
    g.release(x);
    assert_eq!(g.live_nodes(), 0);
}

#[test]
fn optimize_memory_demotes_to_store() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[1.0f64, 2.0, 3.0], &[3]).unwrap();
    let b = g.mul_scalar(a, 2.0f64).unwrap();
    g.execute(b).unwrap();
    g.release(a);
    assert_eq!(g.live_nodes(), 3); // a, its scalar constant, b
    g.optimize_memory(b).unwrap();
    assert_eq!(g.live_nodes(), 1);
    assert_eq!(g.values::<f64>(b).unwrap(), vec![2.0, 4.0, 6.0]);
}

#[test]
fn executed_results_are_memoized() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[1.0f32, -1.0], &[2]).unwrap();
    let b = g.abs(a).unwrap();
    g.execute(b).unwrap();
    let first = g.result_data(b).expect("result attached").entries;
    assert_eq!(first, 2);
    // second execution is a no-op on the memoized result
    g.execute(b).unwrap();
    assert_eq!(g.result_data(b).unwrap().entries, 2);
}

#[test]
fn wrong_types_are_rejected() {
    let mut g = Graph::new(Backends::CPU);
    let f = g.store(&[1.0f32, 2.0], &[2]).unwrap();
    assert!(matches!(g.even(f), Err(FlintError::WrongType(_))));
    let a = g.store(&[1.0f32; 4], &[2, 2]).unwrap();
    let idx = g.store(&[0.5f32, 0.5], &[2]).unwrap();
    assert!(matches!(g.index(a, idx), Err(FlintError::WrongType(_))));
}

#[test]
fn empty_and_zero_shapes_are_illegal() {
    let mut g = Graph::new(Backends::CPU);
    assert!(matches!(
        g.store::<f32>(&[], &[]),
        Err(FlintError::IllegalDimensionality(_))
    ));
    assert!(matches!(
        g.constant(1.0f64, &[2, 0]),
        Err(FlintError::IllegalDimensionality(_))
    ));
}

#[test]
fn eager_mode_materializes_each_builder() {
    let mut g = Graph::new(Backends::CPU);
    g.set_eager(true);
    let a = g.store_array(&array![1.0f32, 4.0, 9.0].into_dyn()).unwrap();
    let b = g.sqrt(a).unwrap();
    assert!(g.result_data(b).is_some());
    assert_eq!(g.values::<f32>(b).unwrap(), vec![1.0, 2.0, 3.0]);
}
