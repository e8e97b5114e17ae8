//! End-to-end systolic convolution on every built-in role map, checked
//! bit-for-bit against a direct convolution.

use hb_kernels::eyeriss::DEFAULT_FILTERS_PER_PASS;
use hb_kernels::prelude::*;
use hb_kernels::reference::{self, OperandRng};

struct Case {
    variant: EyerissVariant,
    images: usize,
    filters: usize,
    width: usize,
    taps: usize,
    filters_per_pass: usize,
    images_per_burst: usize,
}

impl Case {
    fn new(variant: EyerissVariant) -> Self {
        Self {
            variant,
            images: 3,
            filters: 5,
            width: 12,
            taps: 3,
            filters_per_pass: DEFAULT_FILTERS_PER_PASS,
            images_per_burst: 2,
        }
    }

    fn config(&self, mode: PsumMode) -> EyerissConfig {
        EyerissConfig {
            filters_per_pass: self.filters_per_pass,
            images_per_burst: self.images_per_burst,
            ..EyerissConfig::new(self.variant)
        }
        .with_psum_mode(mode)
    }

    /// Run with `extra_rows` output rows beyond what the variant computes;
    /// returns (kernel output, expected output).
    fn run(&self, mode: PsumMode, extra_rows: usize, seed: u64) -> (Vec<f32>, Vec<f32>) {
        let v = self.variant;
        let mut rng = OperandRng::new(seed);
        let imap = rng.tensor(&[self.images, 1, v.input_rows(), self.width]);
        let filter = rng.tensor(&[self.filters, 1, v.filter_rows, self.taps]);
        let wout = self.width - self.taps + 1;
        let omap = rng.tensor(&[self.images, self.filters, v.output_rows + extra_rows, wout]);
        let expected =
            reference::conv2d(&omap, &imap, &filter, v.output_rows, mode == PsumMode::Accumulate);

        let group = TileGroup::new(LaunchConfig::new(v.map.dims));
        eyeriss(&group, &self.config(mode), &omap, &imap, &filter, &[0, 0], &[1, 1]).unwrap();
        (omap.to_vec(), expected)
    }
}

#[test]
fn single_pe_three_filters() {
    // one image of one 8-wide row, three 5-tap filters: 4 outputs each
    let case = Case {
        images: 1,
        filters: 3,
        width: 8,
        taps: 5,
        ..Case::new(EyerissVariant::EYERISS_1X1)
    };
    let (got, expected) = case.run(PsumMode::Fresh, 0, 1);
    assert_eq!(got.len(), 12);
    assert_eq!(got, expected);
}

#[test]
fn single_pe_known_values() {
    let imap = Tensor::from_vec(&[1, 1, 1, 4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    let filter = Tensor::from_vec(&[2, 1, 1, 2], vec![1.0, 1.0, 2.0, -1.0]).unwrap();
    let omap = Tensor::from_vec(&[1, 2, 1, 3], vec![9.0; 6]).unwrap();
    let group = TileGroup::new(LaunchConfig::new(GroupDims::new(3, 4)));
    let config = EyerissConfig::new(EyerissVariant::EYERISS_1X1);
    eyeriss(&group, &config, &omap, &imap, &filter, &[0, 0], &[1, 1]).unwrap();
    assert_eq!(omap.to_vec(), vec![3.0, 5.0, 7.0, 0.0, 1.0, 2.0]);
}

#[test]
fn three_by_three_partial_passes_and_bursts() {
    // 5 filters in passes of 3 + 2, 3 images in bursts of 2 + 1
    let (got, expected) = Case::new(EyerissVariant::EYERISS_3X3).run(PsumMode::Fresh, 0, 2);
    assert_eq!(got, expected);
}

#[test]
fn three_by_three_single_step() {
    let case = Case {
        filters_per_pass: 5,
        images_per_burst: 3,
        ..Case::new(EyerissVariant::EYERISS_3X3)
    };
    let (got, expected) = case.run(PsumMode::Fresh, 0, 3);
    assert_eq!(got, expected);
}

#[test]
fn three_by_three_one_filter_one_image_per_step() {
    let case = Case {
        filters_per_pass: 1,
        images_per_burst: 1,
        ..Case::new(EyerissVariant::EYERISS_3X3)
    };
    let (got, expected) = case.run(PsumMode::Fresh, 0, 4);
    assert_eq!(got, expected);
}

#[test]
fn lenet_conv1_shape() {
    // LeNet conv-1: 6 filters of 5x5, 12 of the 28 output rows per launch
    let case = Case {
        images: 2,
        filters: 6,
        width: 32,
        taps: 5,
        ..Case::new(EyerissVariant::LENET_5X6X2)
    };
    let (got, expected) = case.run(PsumMode::Fresh, 16, 5);
    assert_eq!(got, expected);
}

#[test]
fn accumulate_adds_onto_output() {
    for variant in EyerissVariant::ALL {
        let case = Case { width: 9, ..Case::new(variant) };
        let (got, expected) = case.run(PsumMode::Accumulate, 1, 6);
        assert_eq!(got, expected, "{}", variant.name());
    }
}

#[test]
fn rows_past_the_array_are_untouched() {
    let v = EyerissVariant::EYERISS_3X3;
    let imap = Tensor::zeros(&[1, 1, 8, 4]);
    let filter = Tensor::zeros(&[1, 1, 3, 2]);
    let omap = Tensor::from_vec(&[1, 1, 6, 3], vec![7.0; 18]).unwrap();
    let group = TileGroup::new(LaunchConfig::new(v.map.dims));
    eyeriss(&group, &EyerissConfig::new(v), &omap, &imap, &filter, &[0, 0], &[1, 1]).unwrap();
    let out = omap.to_vec();
    assert!(out[..9].iter().all(|&x| x == 0.0));
    assert!(out[9..].iter().all(|&x| x == 7.0));
}

#[test]
fn repeated_launches_are_independent() {
    let case = Case::new(EyerissVariant::EYERISS_3X3);
    let (first, expected) = case.run(PsumMode::Fresh, 0, 8);
    let (second, _) = case.run(PsumMode::Fresh, 0, 8);
    assert_eq!(first, expected);
    assert_eq!(first, second);
}

#[test]
fn registry_selects_variant_from_group() {
    let mut rng = OperandRng::new(9);
    let imap = rng.tensor(&[2, 1, 5, 10]);
    let filter = rng.tensor(&[4, 1, 3, 4]);
    let omap = Tensor::zeros(&[2, 4, 3, 7]);
    let expected = reference::conv2d(&omap, &imap, &filter, 3, false);

    let group = TileGroup::new(LaunchConfig::new(GroupDims::new(5, 6)));
    let pad = [0i64, 0];
    let stride = [1i64, 1];
    let status = Registry::builtin()
        .invoke(
            "tensorlib_eyeriss",
            &group,
            &[
                KernelArg::Tensor(&omap),
                KernelArg::Tensor(&imap),
                KernelArg::Tensor(&filter),
                KernelArg::Vector(&pad),
                KernelArg::Vector(&stride),
            ],
        )
        .unwrap();
    assert_eq!(status, 0);
    assert_eq!(omap.to_vec(), expected);
}

#[test]
fn unsupported_arguments_are_rejected_before_launch() {
    let v = EyerissVariant::EYERISS_3X3;
    let group = TileGroup::new(LaunchConfig::new(v.map.dims));
    let config = EyerissConfig::new(v);
    let imap = Tensor::zeros(&[1, 1, 5, 6]);
    let filter = Tensor::zeros(&[2, 1, 3, 3]);
    let omap = Tensor::zeros(&[1, 2, 3, 4]);

    let err = eyeriss(&group, &config, &omap, &imap, &filter, &[1, 1], &[1, 1]).unwrap_err();
    assert!(err.to_string().contains("padding"));
    let err = eyeriss(&group, &config, &omap, &imap, &filter, &[0, 0], &[2, 1]).unwrap_err();
    assert!(err.to_string().contains("strides"));

    let wrong_rows = Tensor::zeros(&[2, 1, 5, 3]);
    let err = eyeriss(&group, &config, &omap, &imap, &wrong_rows, &[0, 0], &[1, 1]).unwrap_err();
    assert!(err.to_string().contains("3-row filters"));

    let short = Tensor::zeros(&[1, 2, 2, 4]);
    assert!(eyeriss(&group, &config, &short, &imap, &filter, &[0, 0], &[1, 1]).is_err());

    let other = TileGroup::new(LaunchConfig::new(GroupDims::new(3, 4)));
    let err = eyeriss(&other, &config, &omap, &imap, &filter, &[0, 0], &[1, 1]).unwrap_err();
    assert!(matches!(err, KernelError::Config { .. }));
}
