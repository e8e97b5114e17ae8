//! index_add resolvers against the serial scatter, on colliding indices.

use hb_kernels::prelude::*;
use hb_kernels::reference::{self, OperandRng};

fn strategies() -> [ScatterStrategy; 4] {
    [
        ScatterStrategy::Rounds,
        ScatterStrategy::Locked { buckets: 1 },
        ScatterStrategy::Locked { buckets: 64 },
        ScatterStrategy::Atomic,
    ]
}

fn group(rows: u8, cols: u8) -> TileGroup {
    TileGroup::new(LaunchConfig::new(GroupDims::new(rows, cols)))
}

#[test]
fn every_resolver_matches_serial_scatter() {
    let (dst_rows, src_rows, slice) = (9, 40, 7);
    let mut rng = OperandRng::new(3);
    let values = rng.indices(src_rows, dst_rows).unwrap();
    let index = Tensor::from_vec(&[src_rows], values.clone()).unwrap();
    let src = rng.tensor(&[src_rows, slice]);
    let init = rng.tensor(&[dst_rows, slice]).to_vec();
    let expected = reference::index_add_rows(&init, &src.to_vec(), &values, slice);

    for strategy in strategies() {
        let dst = Tensor::from_vec(&[dst_rows, slice], init.clone()).unwrap();
        let config = IndexAddConfig { strategy };
        index_add(&group(3, 5), &config, &dst, &src, &index, 0, slice, src_rows, dst_rows).unwrap();
        let got = dst.to_vec();
        if strategy == ScatterStrategy::Rounds {
            assert_eq!(got, expected, "rounds adds in index order");
        } else {
            assert!(reference::max_abs_diff(&got, &expected) < 1e-5, "{strategy}");
        }
    }
}

#[test]
fn integer_valued_collisions_are_exact_for_every_resolver() {
    // small integers: every summation order gives the same result
    let values = vec![4, 0, 4, 4, 1, 0, 4, 3];
    let index = Tensor::from_vec(&[8], values.clone()).unwrap();
    let src_data: Vec<f32> = (0..8 * 3).map(|v| (v % 5) as f32).collect();
    let src = Tensor::from_vec(&[8, 3], src_data.clone()).unwrap();
    let expected = reference::index_add_rows(&[1.0; 15], &src_data, &values, 3);

    for strategy in strategies() {
        let dst = Tensor::from_vec(&[5, 3], vec![1.0; 15]).unwrap();
        index_add(&group(2, 2), &IndexAddConfig { strategy }, &dst, &src, &index, 0, 3, 8, 5)
            .unwrap();
        assert_eq!(dst.to_vec(), expected, "{strategy}");
    }
}

#[test]
fn middle_dimension_of_3d_tensor() {
    // dst [2, 3, 2] gains src [2, 4, 2] along dim 1
    let values = vec![2, 0, 2, 1];
    let index = Tensor::from_vec(&[4], values.clone()).unwrap();
    let src = Tensor::from_vec(&[2, 4, 2], (0..16).map(|v| v as f32).collect()).unwrap();

    let mut expected = vec![0.0f32; 12];
    for b in 0..2 {
        for (j, &d) in values.iter().enumerate() {
            for e in 0..2 {
                expected[(b * 3 + d as usize) * 2 + e] += src.get(&[b, j, e]).unwrap();
            }
        }
    }

    for strategy in strategies() {
        let dst = Tensor::zeros(&[2, 3, 2]);
        index_add(&group(2, 3), &IndexAddConfig { strategy }, &dst, &src, &index, 1, 4, 4, 3)
            .unwrap();
        assert_eq!(dst.to_vec(), expected, "{strategy}");
    }
}

#[test]
fn padded_destination_layout() {
    // destination rows padded to 5 cells; padding must stay untouched
    let storage = vec![-1.0f32; 4 * 5];
    let dst = Tensor::with_strides(&[4, 3], &[5, 1], storage).unwrap();
    let src = Tensor::from_vec(&[3, 3], vec![1.0; 9]).unwrap();
    let index = Tensor::from_vec(&[3], vec![3, 3, 0]).unwrap();
    index_add(&group(1, 3), &IndexAddConfig::default(), &dst, &src, &index, 0, 3, 3, 4).unwrap();
    assert_eq!(
        dst.to_vec(),
        vec![0.0, 0.0, 0.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0, 1.0, 1.0, 1.0]
    );
    for row in 0..4 {
        for pad in 3..5 {
            assert_eq!(dst.read(row * 5 + pad), -1.0);
        }
    }
}

#[test]
fn out_of_range_indices_are_skipped() {
    let dst = Tensor::<f32>::zeros(&[2, 2]);
    let src = Tensor::from_vec(&[4, 2], vec![1.0; 8]).unwrap();
    let index = Tensor::from_vec(&[4], vec![1, -1, 2, 1]).unwrap();
    for strategy in strategies() {
        let dst_s = Tensor::<f32>::zeros(&[2, 2]);
        index_add(&group(2, 2), &IndexAddConfig { strategy }, &dst_s, &src, &index, 0, 2, 4, 2)
            .unwrap();
        assert_eq!(dst_s.to_vec(), vec![0.0, 0.0, 2.0, 2.0], "{strategy}");
    }
    assert_eq!(dst.to_vec(), vec![0.0; 4]);
}

#[test]
fn registry_launch_uses_rounds() {
    let dst = Tensor::<f32>::zeros(&[3, 2]);
    let src = Tensor::from_vec(&[3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    let index = Tensor::from_vec(&[3], vec![2, 2, 0]).unwrap();
    let status = Registry::builtin()
        .invoke(
            "tensorlib_index_add",
            &group(2, 2),
            &[
                KernelArg::Tensor(&dst),
                KernelArg::Tensor(&src),
                KernelArg::Index(&index),
                KernelArg::Int(0),
                KernelArg::Int(2),
                KernelArg::Int(3),
                KernelArg::Int(3),
            ],
        )
        .unwrap();
    assert_eq!(status, 0);
    assert_eq!(dst.to_vec(), vec![5.0, 6.0, 0.0, 0.0, 4.0, 6.0]);
}
