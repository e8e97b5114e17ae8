//! Scatter-accumulate: `dst.index_add_(dim, index, src)`.
//!
//! Source row `j` (along `dim`) is added onto destination row `index[j]`.
//! Several source rows may name the same destination, so concurrent tiles
//! can race on a destination element. Three resolvers are provided:
//!
//! - [`ScatterStrategy::Rounds`]: split the contributors into rounds in
//!   which every destination row has at most one source, run the rounds
//!   with a group barrier in between. No two tiles ever touch the same
//!   element within a round.
//! - [`ScatterStrategy::Locked`]: every tile streams over its share of
//!   `(source row, element)` pairs and takes a bucket lock keyed by the
//!   destination offset around each read-modify-write.
//! - [`ScatterStrategy::Atomic`]: as `Locked`, with an atomic
//!   floating-point add on the destination cell instead of a lock.
//!
//! Rounds give a deterministic summation order; the other two sum in
//! whatever order tiles get there.

use crate::error::{KernelError, Result};
use crate::fabric::BufferSizes;
use crate::group::{TileContext, TileGroup};
use crate::tensor::{Element, Tensor};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Default number of lock buckets for [`ScatterStrategy::Locked`].
pub const DEFAULT_LOCK_BUCKETS: usize = 64;

/// Flat storage offset of element `element_in_slice` of row `index` along
/// `dim`.
///
/// The slice position is decomposed row-major over every dimension except
/// `dim`, `index` is substituted for `dim`, and the tensor's strides are
/// applied, which matches [`Tensor::offset_of`] for the same multi-index.
/// Returns `None` if `dim` or `index` is out of range, the slice position
/// exceeds the slice, or the offset falls outside the storage.
pub fn element_offset<T: Element>(
    t: &Tensor<T>,
    dim: usize,
    index: usize,
    element_in_slice: usize,
) -> Option<usize> {
    if dim >= t.ndim() || index >= t.dim(dim) {
        return None;
    }
    let mut rest = element_in_slice;
    let mut offset = index * t.stride(dim);
    for d in (0..t.ndim()).rev().filter(|&d| d != dim) {
        let extent = t.dim(d);
        if extent == 0 {
            return None;
        }
        offset += (rest % extent) * t.stride(d);
        rest /= extent;
    }
    (rest == 0 && offset < t.storage_len()).then_some(offset)
}

/// Elements in one row along `dim` (product of every other extent).
pub fn slice_len<T: Element>(t: &Tensor<T>, dim: usize) -> usize {
    t.shape()
        .iter()
        .enumerate()
        .filter(|&(d, _)| d != dim)
        .map(|(_, &extent)| extent)
        .product()
}

/// Contributors of every destination row, split into collision-free rounds.
///
/// Stored as compressed rows: the sources of destination `d` are
/// `sources[starts[d]..starts[d + 1]]`, in index-list order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScatterPlan {
    starts: Vec<usize>,
    sources: Vec<usize>,
    rounds: usize,
    skipped: usize,
}

impl ScatterPlan {
    /// Build the plan for `indices` scattering onto `dst_rows` rows.
    ///
    /// Negative or too-large indices are left out and counted in
    /// [`skipped`](Self::skipped).
    pub fn new(indices: &[i32], dst_rows: usize) -> Self {
        let target = |v: i32| usize::try_from(v).ok().filter(|&d| d < dst_rows);

        let mut counts = vec![0usize; dst_rows];
        let mut skipped = 0;
        for &v in indices {
            match target(v) {
                Some(d) => counts[d] += 1,
                None => skipped += 1,
            }
        }

        let mut starts = Vec::with_capacity(dst_rows + 1);
        starts.push(0);
        for &c in &counts {
            starts.push(starts[starts.len() - 1] + c);
        }

        let mut fill = starts[..dst_rows].to_vec();
        let mut sources = vec![0; starts[dst_rows]];
        for (j, &v) in indices.iter().enumerate() {
            if let Some(d) = target(v) {
                sources[fill[d]] = j;
                fill[d] += 1;
            }
        }

        let rounds = counts.iter().copied().max().unwrap_or(0);
        Self { starts, sources, rounds, skipped }
    }

    /// Number of rounds (largest number of sources on one destination).
    pub const fn rounds(&self) -> usize {
        self.rounds
    }

    /// Indices that named no destination row.
    pub const fn skipped(&self) -> usize {
        self.skipped
    }

    /// Number of destination rows.
    pub fn dst_rows(&self) -> usize {
        self.starts.len() - 1
    }

    /// Sources of destination row `dst`, in index-list order.
    pub fn contributors(&self, dst: usize) -> &[usize] {
        match (self.starts.get(dst), self.starts.get(dst + 1)) {
            (Some(&a), Some(&b)) => &self.sources[a..b],
            _ => &[],
        }
    }

    /// The source applied to `dst` in round `round`, if any.
    pub fn source(&self, dst: usize, round: usize) -> Option<usize> {
        self.contributors(dst).get(round).copied()
    }

    /// `(destination, source)` pairs of one round.
    pub fn round(&self, round: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.dst_rows()).filter_map(move |d| self.source(d, round).map(|s| (d, s)))
    }
}

/// How concurrent writes to one destination element are kept apart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScatterStrategy {
    /// Collision-free rounds separated by group barriers.
    #[default]
    Rounds,
    /// Bucket locks keyed by destination offset.
    Locked {
        /// Number of lock buckets.
        buckets: usize,
    },
    /// Atomic add on the destination cell.
    Atomic,
}

impl std::fmt::Display for ScatterStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rounds => f.write_str("rounds"),
            Self::Locked { buckets } => write!(f, "locked({buckets})"),
            Self::Atomic => f.write_str("atomic"),
        }
    }
}

/// index_add configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexAddConfig {
    /// Collision resolver
    pub strategy: ScatterStrategy,
}

/// Striped locks over destination offsets.
#[derive(Debug)]
pub struct LockTable {
    buckets: Box<[Mutex<()>]>,
}

impl LockTable {
    /// Table with `buckets` locks (at least one).
    pub fn new(buckets: usize) -> Self {
        Self {
            buckets: (0..buckets.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Bucket guarding `offset`.
    pub fn bucket(&self, offset: usize) -> usize {
        // Fibonacci hashing
        let h = (offset as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32;
        usize::try_from(h).unwrap_or(0) % self.buckets.len()
    }

    /// Lock the bucket guarding `offset`.
    pub fn lock(&self, offset: usize) -> MutexGuard<'_, ()> {
        self.buckets[self.bucket(offset)].lock()
    }
}

/// Operands of one index_add, shared by every tile.
#[derive(Debug, Clone, Copy)]
pub struct Scatter<'a> {
    /// Destination tensor.
    pub dst: &'a Tensor<f32>,
    /// Source tensor.
    pub src: &'a Tensor<f32>,
    /// Destination row of each source row.
    pub indices: &'a [i32],
    /// Dimension rows are taken along.
    pub dim: usize,
    /// Elements per row.
    pub slice: usize,
}

impl Scatter<'_> {
    /// Validate operands and parameters.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Config`] if the tensors disagree with each
    /// other or with the scalar parameters.
    pub fn check(&self, num_indices: usize, dst_idx_size: usize) -> Result<()> {
        let (dst, src, dim) = (self.dst, self.src, self.dim);
        if dim >= dst.ndim() || dst.ndim() != src.ndim() {
            return Err(KernelError::config(format!(
                "dim {dim} does not fit destination {:?} and source {:?}",
                dst.shape(),
                src.shape()
            )));
        }
        if (0..dst.ndim()).any(|d| d != dim && dst.dim(d) != src.dim(d)) {
            return Err(KernelError::config(format!(
                "destination {:?} and source {:?} differ outside dim {dim}",
                dst.shape(),
                src.shape()
            )));
        }
        if dst.may_overlap() {
            return Err(KernelError::config(format!(
                "destination {:?} with strides {:?} overlaps itself",
                dst.shape(),
                dst.strides()
            )));
        }
        if self.slice != slice_len(dst, dim) {
            return Err(KernelError::config(format!(
                "slice size {} but rows along dim {dim} hold {}",
                self.slice,
                slice_len(dst, dim)
            )));
        }
        if dst_idx_size != dst.dim(dim) {
            return Err(KernelError::config(format!(
                "destination size {dst_idx_size} but dim {dim} has {} rows",
                dst.dim(dim)
            )));
        }
        if num_indices != self.indices.len() || num_indices != src.dim(dim) {
            return Err(KernelError::config(format!(
                "{num_indices} indices for {} index values and {} source rows",
                self.indices.len(),
                src.dim(dim)
            )));
        }
        Ok(())
    }

    fn dst_rows(&self) -> usize {
        self.dst.dim(self.dim)
    }

    fn destination(&self, source_row: usize) -> Option<usize> {
        self.indices
            .get(source_row)
            .and_then(|&v| usize::try_from(v).ok())
            .filter(|&d| d < self.dst_rows())
    }

    fn offsets(&self, dst_row: usize, src_row: usize, element: usize) -> Option<(usize, usize)> {
        let d = element_offset(self.dst, self.dim, dst_row, element);
        let s = element_offset(self.src, self.dim, src_row, element);
        if let (Some(d), Some(s)) = (d, s) {
            Some((d, s))
        } else {
            warn!(
                "Skipping out-of-range write: source row {} element {} onto destination row {}",
                src_row, element, dst_row
            );
            None
        }
    }
}

/// Per-tile body of index_add.
///
/// # Errors
///
/// Returns [`KernelError::Aborted`] if another tile fails.
pub fn run_tile(
    ctx: &TileContext<'_>,
    strategy: ScatterStrategy,
    scatter: &Scatter<'_>,
    locks: &LockTable,
) -> Result<()> {
    let me = ctx.linear_id();
    let tiles = ctx.tile_count();
    let (dst, src, slice) = (scatter.dst, scatter.src, scatter.slice);

    match strategy {
        ScatterStrategy::Rounds => {
            let plan = ScatterPlan::new(scatter.indices, scatter.dst_rows());
            for round in 0..plan.rounds() {
                for linear in (me..scatter.dst_rows() * slice).step_by(tiles) {
                    let dst_row = linear / slice;
                    let Some(src_row) = plan.source(dst_row, round) else {
                        continue;
                    };
                    if let Some((d, s)) = scatter.offsets(dst_row, src_row, linear % slice) {
                        dst.write(d, dst.read(d) + src.read(s));
                    }
                }
                ctx.barrier()?;
            }
        }
        ScatterStrategy::Locked { .. } => {
            for linear in (me..scatter.indices.len() * slice).step_by(tiles) {
                let src_row = linear / slice;
                let Some(dst_row) = scatter.destination(src_row) else {
                    continue;
                };
                if let Some((d, s)) = scatter.offsets(dst_row, src_row, linear % slice) {
                    let _guard = locks.lock(d);
                    dst.write(d, dst.read(d) + src.read(s));
                }
            }
        }
        ScatterStrategy::Atomic => {
            for linear in (me..scatter.indices.len() * slice).step_by(tiles) {
                let src_row = linear / slice;
                let Some(dst_row) = scatter.destination(src_row) else {
                    continue;
                };
                if let Some((d, s)) = scatter.offsets(dst_row, src_row, linear % slice) {
                    dst.fetch_add(d, src.read(s));
                }
            }
        }
    }

    ctx.barrier()
}

/// `dst.index_add_(dim, index, src)` on `group`.
///
/// `slice_size` is the number of elements per row along `dim`,
/// `num_indices` the number of index values (= source rows) and
/// `dst_idx_size` the number of destination rows.
///
/// # Errors
///
/// Returns a configuration error before launch, or the first tile error.
#[allow(clippy::too_many_arguments)]
pub fn index_add(
    group: &TileGroup,
    config: &IndexAddConfig,
    dst: &Tensor<f32>,
    src: &Tensor<f32>,
    index: &Tensor<i32>,
    dim: usize,
    slice_size: usize,
    num_indices: usize,
    dst_idx_size: usize,
) -> Result<()> {
    let values = index.to_vec();
    let scatter = Scatter { dst, src, indices: &values, dim, slice: slice_size };
    scatter.check(num_indices, dst_idx_size)?;

    let out_of_range = values
        .iter()
        .filter(|&&v| usize::try_from(v).map_or(true, |d| d >= dst_idx_size))
        .count();
    if out_of_range > 0 {
        warn!(
            "{} of {} indices fall outside {} destination rows and are skipped",
            out_of_range, num_indices, dst_idx_size
        );
    }
    if slice_size == 0 || num_indices == 0 {
        debug!("index_add has nothing to scatter");
        return Ok(());
    }

    let strategy = config.strategy;
    let locks = LockTable::new(match strategy {
        ScatterStrategy::Locked { buckets } => buckets,
        _ => 1,
    });
    info!(
        "index_add: {} source rows onto {} rows of {} elements ({})",
        num_indices, dst_idx_size, slice_size, strategy
    );
    group.launch(BufferSizes::NONE, |ctx| run_tile(ctx, strategy, &scatter, &locks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::LaunchConfig;
    use hb_fabric::GroupDims;
    use proptest::prelude::*;

    /// Every multi-index of `shape`, row-major.
    fn all_indices(shape: &[usize]) -> Vec<Vec<usize>> {
        let mut out = vec![vec![]];
        for &extent in shape {
            out = out
                .into_iter()
                .flat_map(|prefix| {
                    (0..extent).map(move |i| {
                        let mut next = prefix.clone();
                        next.push(i);
                        next
                    })
                })
                .collect();
        }
        out
    }

    /// Position of `index` within its slice along `dim`, row-major.
    fn slice_position(shape: &[usize], index: &[usize], dim: usize) -> usize {
        (0..shape.len())
            .filter(|&d| d != dim)
            .fold(0, |acc, d| acc * shape[d] + index[d])
    }

    fn agrees_with_tensor(t: &Tensor<f32>) {
        for dim in 0..t.ndim() {
            for index in all_indices(t.shape()) {
                let e = slice_position(t.shape(), &index, dim);
                assert_eq!(
                    element_offset(t, dim, index[dim], e),
                    t.offset_of(&index),
                    "dim {dim} index {index:?}"
                );
            }
        }
    }

    #[test]
    fn offsets_match_contiguous_layout() {
        agrees_with_tensor(&Tensor::zeros(&[3, 4, 2]));
    }

    #[test]
    fn offsets_match_transposed_layout() {
        // 4x3 storage viewed as its 3x4 transpose
        let t = Tensor::with_strides(&[3, 4], &[1, 3], vec![0.0; 12]).unwrap();
        agrees_with_tensor(&t);
    }

    #[test]
    fn offsets_match_padded_layout() {
        // rows padded from 3 to 5 elements
        let t = Tensor::with_strides(&[2, 4, 3], &[20, 5, 1], vec![0.0; 40]).unwrap();
        agrees_with_tensor(&t);
    }

    #[test]
    fn offsets_out_of_range() {
        let t = Tensor::<f32>::zeros(&[3, 4]);
        assert_eq!(element_offset(&t, 0, 3, 0), None);
        assert_eq!(element_offset(&t, 0, 2, 4), None);
        assert_eq!(element_offset(&t, 2, 0, 0), None);
        assert_eq!(element_offset(&t, 1, 3, 2), Some(11));
    }

    #[test]
    fn plan_rounds_follow_multiplicity() {
        let plan = ScatterPlan::new(&[2, 2, 0, 2], 3);
        assert_eq!(plan.rounds(), 3);
        assert_eq!(plan.contributors(2), &[0, 1, 3]);
        assert_eq!(plan.contributors(0), &[2]);
        assert!(plan.contributors(1).is_empty());
        assert_eq!(plan.round(0).collect::<Vec<_>>(), vec![(0, 2), (2, 0)]);
        assert_eq!(plan.round(2).collect::<Vec<_>>(), vec![(2, 3)]);
        assert_eq!(plan.source(0, 1), None);
    }

    #[test]
    fn plan_skips_bad_indices() {
        let plan = ScatterPlan::new(&[-1, 1, 5, 1], 2);
        assert_eq!(plan.skipped(), 2);
        assert_eq!(plan.contributors(1), &[1, 3]);
        assert_eq!(plan.rounds(), 2);
        assert_eq!(ScatterPlan::new(&[], 4).rounds(), 0);
    }

    #[test]
    fn lock_buckets_stay_in_range() {
        let table = LockTable::new(7);
        assert!((0..1000).all(|o| table.bucket(o) < 7));
        assert_eq!(LockTable::new(0).bucket(123), 0);
    }

    fn group() -> TileGroup {
        TileGroup::new(LaunchConfig::new(GroupDims::new(2, 2)))
    }

    const STRATEGIES: [ScatterStrategy; 3] = [
        ScatterStrategy::Rounds,
        ScatterStrategy::Locked { buckets: 4 },
        ScatterStrategy::Atomic,
    ];

    #[test]
    fn colliding_rows_accumulate() {
        // rows a, b, c, d of width 3
        let src_data: Vec<f32> = (0..12).map(|v| v as f32).collect();
        for strategy in STRATEGIES {
            let dst = Tensor::from_vec(&[3, 3], vec![1.0; 9]).unwrap();
            let src = Tensor::from_vec(&[4, 3], src_data.clone()).unwrap();
            let index = Tensor::from_vec(&[4], vec![2, 2, 0, 2]).unwrap();
            index_add(&group(), &IndexAddConfig { strategy }, &dst, &src, &index, 0, 3, 4, 3)
                .unwrap();
            // row 2 = 1 + a + b + d, row 0 = 1 + c
            assert_eq!(dst.to_vec(), vec![7.0, 8.0, 9.0, 1.0, 1.0, 1.0, 13.0, 16.0, 19.0]);
        }
    }

    #[test]
    fn scatter_along_inner_dim() {
        let dst = Tensor::<f32>::zeros(&[2, 3]);
        let src = Tensor::from_vec(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let index = Tensor::from_vec(&[2], vec![2, 0]).unwrap();
        index_add(&group(), &IndexAddConfig::default(), &dst, &src, &index, 1, 2, 2, 3).unwrap();
        assert_eq!(dst.to_vec(), vec![2.0, 0.0, 1.0, 4.0, 0.0, 3.0]);
    }

    #[test]
    fn out_of_range_index_is_skipped() {
        let dst = Tensor::<f32>::zeros(&[2, 2]);
        let src = Tensor::from_vec(&[2, 2], vec![1.0, 1.0, 5.0, 5.0]).unwrap();
        let index = Tensor::from_vec(&[2], vec![7, 1]).unwrap();
        for strategy in STRATEGIES {
            dst.set(&[1, 0], 0.0);
            dst.set(&[1, 1], 0.0);
            index_add(&group(), &IndexAddConfig { strategy }, &dst, &src, &index, 0, 2, 2, 2)
                .unwrap();
            assert_eq!(dst.to_vec(), vec![0.0, 0.0, 5.0, 5.0]);
        }
    }

    #[test]
    fn mismatched_parameters_are_rejected() {
        let dst = Tensor::<f32>::zeros(&[2, 2]);
        let src = Tensor::<f32>::zeros(&[3, 2]);
        let index = Tensor::from_vec(&[3], vec![0, 1, 0]).unwrap();
        let config = IndexAddConfig::default();
        assert!(index_add(&group(), &config, &dst, &src, &index, 0, 3, 3, 2).is_err());
        assert!(index_add(&group(), &config, &dst, &src, &index, 0, 2, 2, 2).is_err());
        assert!(index_add(&group(), &config, &dst, &src, &index, 0, 2, 3, 3).is_err());
        assert!(index_add(&group(), &config, &dst, &src, &index, 2, 2, 3, 2).is_err());
        index_add(&group(), &config, &dst, &src, &index, 0, 2, 3, 2).unwrap();
    }

    #[test]
    fn overlapping_destination_is_rejected() {
        // every row of dst aliases the same two cells
        let dst = Tensor::with_strides(&[3, 2], &[0, 1], vec![0.0; 2]).unwrap();
        let src = Tensor::from_vec(&[2, 2], vec![1.0; 4]).unwrap();
        let index = Tensor::from_vec(&[2], vec![0, 2]).unwrap();
        for strategy in STRATEGIES {
            let config = IndexAddConfig { strategy };
            let err = index_add(&group(), &config, &dst, &src, &index, 0, 2, 2, 3).unwrap_err();
            assert!(matches!(err, KernelError::Config { .. }), "{err}");
            assert!(err.to_string().contains("overlaps"));
        }
        assert_eq!(dst.to_vec(), vec![0.0; 6]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn unique_indices_match_serial(perm in Just((0..6).collect::<Vec<i32>>()).prop_shuffle(),
                                       take in 1usize..=6,
                                       seed in prop::collection::vec(-100i32..100, 6 * 4)) {
            let indices: Vec<i32> = perm[..take].to_vec();
            let src_data: Vec<f32> = seed[..take * 4].iter().map(|&v| v as f32 * 0.25).collect();
            let base: Vec<f32> = (0..24).map(|v| v as f32).collect();

            let mut expected = base.clone();
            for (j, &d) in indices.iter().enumerate() {
                for e in 0..4 {
                    expected[d as usize * 4 + e] += src_data[j * 4 + e];
                }
            }

            for strategy in STRATEGIES {
                let dst = Tensor::from_vec(&[6, 4], base.clone()).unwrap();
                let src = Tensor::from_vec(&[take, 4], src_data.clone()).unwrap();
                let index = Tensor::from_vec(&[take], indices.clone()).unwrap();
                index_add(&group(), &IndexAddConfig { strategy }, &dst, &src, &index, 0, 4, take, 6).unwrap();
                prop_assert_eq!(dst.to_vec(), expected.clone());
            }
        }
    }
}
