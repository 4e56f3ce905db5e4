use std::io::{Seek, SeekFrom};

use flint::{Backends, FType, FlintError, Graph};

#[test]
fn header_layout_is_big_endian() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[1i32, 2, 3, 4], &[2, 2]).unwrap();
    let bytes = g.serialize(a).unwrap();
    assert_eq!(&bytes[0..4], &[0x00, 0x07, 0x53, 0x21]);
    assert_eq!(&bytes[4..8], &[0, 0, 0, 0]); // int32 tag
    assert_eq!(&bytes[8..12], &[0, 0, 0, 2]); // rank
    assert_eq!(&bytes[12..20], &[0, 0, 0, 0, 0, 0, 0, 2]);
    assert_eq!(&bytes[20..28], &[0, 0, 0, 0, 0, 0, 0, 2]);
    assert_eq!(bytes.len(), 28 + 4 * 4);
    assert_eq!(&bytes[28..32], &[0, 0, 0, 1]);
}

#[test]
fn round_trip_preserves_type_shape_and_values() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[-1i32, 7, 0, 42], &[4]).unwrap();
    let b = g.store(&[i64::MAX, i64::MIN, 0], &[3, 1]).unwrap();
    let c = g.store(&[1.5f32, -2.25, 0.0], &[3]).unwrap();
    let d = g
        .store(&[std::f64::consts::PI, -0.0, 1e300], &[1, 3])
        .unwrap();
    for node in [a, b, c, d] {
        let ftype = g.ftype(node);
        let shape = g.shape(node).to_vec();
        let bytes = g.serialize(node).unwrap();
        let back = g.deserialize(&bytes).unwrap();
        assert_eq!(g.ftype(back), ftype);
        assert_eq!(g.shape(back), shape.as_slice());
        assert_eq!(
            g.values::<f64>(back).unwrap(),
            g.values::<f64>(node).unwrap()
        );
    }
}

#[test]
fn computed_results_serialize_too() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[1.0f64, 4.0, 9.0], &[3]).unwrap();
    let b = g.sqrt(a).unwrap();
    // serialization executes and syncs on demand
    let bytes = g.serialize(b).unwrap();
    let back = g.deserialize(&bytes).unwrap();
    assert_eq!(g.values::<f64>(back).unwrap(), vec![1.0, 2.0, 3.0]);
}

#[test]
fn bad_magic_numbers_are_rejected() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[1i32], &[1]).unwrap();
    let mut bytes = g.serialize(a).unwrap();
    bytes[0] = 0xff;
    assert!(matches!(g.deserialize(&bytes), Err(FlintError::Io(_))));
    // truncated stream
    let good = g.serialize(a).unwrap();
    assert!(matches!(
        g.deserialize(&good[..10]),
        Err(FlintError::Io(_))
    ));
}

#[test]
fn tensors_round_trip_through_files() {
    let mut g = Graph::new(Backends::CPU);
    let a = g.store(&[3.0f32, 1.0, 4.0, 1.0, 5.0, 9.0], &[2, 3]).unwrap();
    let mut file = tempfile::tempfile().unwrap();
    g.write_tensor(a, &mut file).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    let back = g.read_tensor(&mut file).unwrap();
    assert_eq!(g.ftype(back), FType::F32);
    assert_eq!(g.shape(back), &[2, 3]);
    assert_eq!(
        g.values::<f32>(back).unwrap(),
        vec![3.0, 1.0, 4.0, 1.0, 5.0, 9.0]
    );
}
