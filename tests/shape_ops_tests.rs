use flint::{Backends, FlintError, Graph};
use ndarray::array;

#[test]
fn transpose_is_involutive() {
    let mut g = Graph::new(Backends::CPU);
    let a = g
        .store_array(&array![[1i32, 2, 3], [4, 5, 6]].into_dyn())
        .unwrap();
    let t = g.transpose(a, &[1, 0]).unwrap();
    assert_eq!(g.shape(t), &[3, 2]);
    assert_eq!(
        g.array::<i32>(t).unwrap(),
        array![[1, 4], [2, 5], [3, 6]].into_dyn()
    );
    let back = g.transpose(t, &[1, 0]).unwrap();
    assert_eq!(g.array::<i32>(back).unwrap(), g.array::<i32>(a).unwrap());

    // a three axis involution swapping the outer axes
    let c_vals: Vec<i64> = (0..24).collect();
    let c = g.store(&c_vals, &[2, 3, 4]).unwrap();
    let ct = g.transpose(c, &[2, 1, 0]).unwrap();
    let cb = g.transpose(ct, &[2, 1, 0]).unwrap();
    assert_eq!(g.values::<i64>(cb).unwrap(), c_vals);
}

#[test]
fn non_involutive_permutations_are_rejected() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[0i32; 24], &[2, 3, 4]).unwrap();
    assert!(matches!(
        g.transpose(a, &[1, 2, 0]),
        Err(FlintError::IllegalDimensionality(_))
    ));
}

#[test]
fn reshape_round_trips() {
    let mut g = Graph::new(Backends::CPU);
    let vals: Vec<f32> = (0..12).map(|v| v as f32).collect();
    let a = g.store(&vals, &[3, 4]).unwrap();
    let r = g.reshape(a, &[2, 6]).unwrap();
    let back = g.reshape(r, &[3, 4]).unwrap();
    assert_eq!(g.values::<f32>(back).unwrap(), vals);
    let flat = g.flatten(a).unwrap();
    assert_eq!(g.shape(flat), &[12]);
    let merged = g.flatten_axis(a, 1).unwrap();
    assert_eq!(g.shape(merged), &[12]);
}

#[test]
fn flattening_axis_zero_is_illegal() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[0i32; 6], &[2, 3]).unwrap();
    assert!(matches!(
        g.flatten_axis(a, 0),
        Err(FlintError::IllegalDimensionality(_))
    ));
}

#[test]
fn identity_slice_is_identity() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[5i32, 6, 7], &[3]).unwrap();
    let s = g.slice(a, &[0], &[3]).unwrap();
    assert_eq!(g.values::<i32>(s).unwrap(), vec![5, 6, 7]);
}

#[test]
fn slice_with_negative_step_reverses() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[0i32, 1, 2, 3, 4], &[5]).unwrap();
    let s = g.slice_step(a, &[4], &[-6], &[-1]).unwrap();
    assert_eq!(g.values::<i32>(s).unwrap(), vec![4, 3, 2, 1, 0]);
    // stepping two at a time from the back
    let s2 = g.slice_step(a, &[-1], &[-6], &[-2]).unwrap();
    assert_eq!(g.values::<i32>(s2).unwrap(), vec![4, 2, 0]);
}

#[test]
fn multi_axis_slicing() {
    let mut g = Graph::new(Backends::CPU);
    let vals: Vec<i32> = (0..12).collect();
    let a = g.store(&vals, &[3, 4]).unwrap();
    let s = g.slice_step(a, &[0, 1], &[3, 4], &[2, 2]).unwrap();
    assert_eq!(g.shape(s), &[2, 2]);
    assert_eq!(g.values::<i32>(s).unwrap(), vec![1, 3, 9, 11]);
}

#[test]
fn invalid_slices_are_rejected() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[0i32; 5], &[5]).unwrap();
    assert!(matches!(
        g.slice_step(a, &[0], &[5], &[0]),
        Err(FlintError::InvalidSelect(_))
    ));
    // step sign contradicts the direction
    assert!(matches!(
        g.slice_step(a, &[0], &[5], &[-1]),
        Err(FlintError::InvalidSelect(_))
    ));
    assert!(matches!(
        g.slice_step(a, &[4], &[0], &[1]),
        Err(FlintError::InvalidSelect(_))
    ));
}

#[test]
fn extend_scatters_with_stride() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[1i32, 2], &[2]).unwrap();
    let e = g.extend_step(a, &[5], &[1], &[2]).unwrap();
    assert_eq!(g.values::<i32>(e).unwrap(), vec![0, 1, 0, 2, 0]);
    // slicing the scattered positions recovers the source
    let back = g.slice_step(e, &[1], &[4], &[2]).unwrap();
    assert_eq!(g.values::<i32>(back).unwrap(), vec![1, 2]);
}

#[test]
fn repeat_tiles_additional_copies() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store_array(&array![[1i32, 2], [3, 4]].into_dyn()).unwrap();
    let r = g.repeat(a, &[1, 0]).unwrap();
    assert_eq!(g.shape(r), &[4, 2]);
    assert_eq!(
        g.array::<i32>(r).unwrap(),
        array![[1, 2], [3, 4], [1, 2], [3, 4]].into_dyn()
    );
}

#[test]
fn concat_along_each_axis() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store_array(&array![[1i32, 2], [3, 4]].into_dyn()).unwrap();
    let b = g.store_array(&array![[5i32, 6]].into_dyn()).unwrap();
    let rows = g.concat(a, b, 0).unwrap();
    assert_eq!(
        g.array::<i32>(rows).unwrap(),
        array![[1, 2], [3, 4], [5, 6]].into_dyn()
    );
    let c = g.store_array(&array![[9i32], [8]].into_dyn()).unwrap();
    let cols = g.concat(a, c, 1).unwrap();
    assert_eq!(
        g.array::<i32>(cols).unwrap(),
        array![[1, 2, 9], [3, 4, 8]].into_dyn()
    );
    // shape mismatch off the concatenation axis
    assert!(matches!(
        g.concat(a, c, 0),
        Err(FlintError::IncompatibleShapes { .. })
    ));
}

#[test]
fn expand_inserts_an_axis() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[1.0f64, 2.0], &[2]).unwrap();
    let e = g.expand(a, 0, 3).unwrap();
    assert_eq!(g.shape(e), &[3, 2]);
    assert_eq!(g.values::<f64>(e).unwrap(), vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
}

#[test]
fn indexed_read_selects_rows() {
    let mut g = Graph::new(Backends::CPU);
    let a = g
        .store_array(&array![[0i32, 1], [2, 3], [4, 5]].into_dyn())
        .unwrap();
    let idx = g.store(&[2i32, 0, 1], &[3]).unwrap();
    let picked = g.index(a, idx).unwrap();
    assert_eq!(
        g.array::<i32>(picked).unwrap(),
        array![[4, 5], [0, 1], [2, 3]].into_dyn()
    );
    // repeated and fewer selections
    let idx2 = g.store(&[1i64, 1], &[2]).unwrap();
    let doubled = g.index(a, idx2).unwrap();
    assert_eq!(
        g.array::<i32>(doubled).unwrap(),
        array![[2, 3], [2, 3]].into_dyn()
    );
}

#[test]
fn indexed_write_replaces_rows() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.constant(1i32, &[3, 2]).unwrap();
    let b = g.store_array(&array![[9i32, 8], [7, 6]].into_dyn()).unwrap();
    let idx = g.store(&[2i32, 0], &[2]).unwrap();
    let w = g.index_set(a, b, idx).unwrap();
    assert_eq!(
        g.array::<i32>(w).unwrap(),
        array![[7, 6], [1, 1], [9, 8]].into_dyn()
    );
    // the last write along the selection axis wins
    let dup = g.store(&[1i32, 1], &[2]).unwrap();
    let w2 = g.index_set(a, b, dup).unwrap();
    assert_eq!(
        g.array::<i32>(w2).unwrap(),
        array![[1, 1], [7, 6], [1, 1]].into_dyn()
    );
}

#[test]
fn sliding_windows_and_their_inverse() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[0.0f64, 1.0, 2.0, 3.0, 4.0], &[5]).unwrap();
    let windows = g.sliding_window(a, &[3], &[1]).unwrap();
    assert_eq!(g.shape(windows), &[3, 3]);
    assert_eq!(
        g.values::<f64>(windows).unwrap(),
        vec![0.0, 1.0, 2.0, 1.0, 2.0, 3.0, 2.0, 3.0, 4.0]
    );
    let summed = g.unslide_window(windows, &[5], &[1]).unwrap();
    assert_eq!(g.values::<f64>(summed).unwrap(), vec![0.0, 2.0, 6.0, 6.0, 4.0]);
    // mismatched window count is rejected
    assert!(matches!(
        g.unslide_window(windows, &[9], &[1]),
        Err(FlintError::IncompatibleShapes { .. })
    ));
}

#[test]
fn two_dimensional_sliding_window() {
    let mut g = Graph::new(Backends::CPU);
    let vals: Vec<i32> = (0..9).collect();
    let a = g.store(&vals, &[3, 3]).unwrap();
    let w = g.sliding_window(a, &[2, 2], &[1, 1]).unwrap();
    assert_eq!(g.shape(w), &[4, 2, 2]);
    let out = g.values::<i32>(w).unwrap();
    assert_eq!(&out[..4], &[0, 1, 3, 4]);
    assert_eq!(&out[12..], &[4, 5, 7, 8]);
}

#[test]
fn permutate_shuffles_within_slices() {
    let mut g = Graph::new(Backends::CPU);
    let a = g
        .store_array(&array![[1i32, 2, 3], [4, 5, 6]].into_dyn())
        .unwrap();
    let p = g.permutate(a, 1).unwrap();
    let out = g.array::<i32>(p).unwrap();
    for row in 0..2 {
        let mut vals: Vec<i32> = (0..3).map(|c| out[[row, c]]).collect();
        vals.sort_unstable();
        let expect: Vec<i32> = (0..3).map(|c| (row * 3 + c + 1) as i32).collect();
        assert_eq!(vals, expect);
    }
}
