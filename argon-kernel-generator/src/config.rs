//! Pooling problem description and the blocking configuration chosen
//! for it.

use crate::{
    architecture::Architecture,
    epilogue::PostOp,
    error::{Error, Result},
    view::{CANONICAL_NDIMS, canonicalize},
};
use argon_ir::{DataType, MemoryDesc};
use gcd::Gcd;

/// Execution target: hardware generation, SIMD width and the register
/// budget of one thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExecConfig {
    arch: Architecture,
    simd: u32,
    regs: u32,
}

impl ExecConfig {
    pub fn new(arch: Architecture, simd: u32, large_grf: bool) -> Result<Self> {
        if !arch.supports_simd(simd) {
            return Err(Error::UnsupportedSimd {
                simd,
                arch: format!("{arch:?}"),
            });
        }
        Ok(Self {
            arch,
            simd,
            regs: arch.max_regs(large_grf),
        })
    }

    /// Overrides the register budget.
    #[must_use]
    pub fn with_regs(self, regs: u32) -> Self {
        Self { regs, ..self }
    }

    pub fn arch(&self) -> Architecture {
        self.arch
    }

    pub fn simd(&self) -> u32 {
        self.simd
    }

    pub fn regs(&self) -> u32 {
        self.regs
    }

    pub fn grf_size(&self) -> u32 {
        self.arch.grf_size()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PoolAlg {
    Max,
    /// Average over the full window, padding included.
    AvgIncludePadding,
    /// Average over the in-bounds part of the window only.
    AvgExcludePadding,
}

impl PoolAlg {
    pub fn is_max(self) -> bool {
        self == PoolAlg::Max
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Backward,
}

/// Spatial geometry of the window along one axis.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Window {
    pub input: i64,
    pub output: i64,
    pub kernel: i64,
    pub stride: i64,
    pub padding: i64,
    /// Extra gap between taps; zero means dense.
    pub dilation: i64,
}

impl Window {
    /// A degenerate axis used to fill missing spatial dims.
    pub const UNIT: Window = Window {
        input: 1,
        output: 1,
        kernel: 1,
        stride: 1,
        padding: 0,
        dilation: 0,
    };

    /// Derives the output extent assuming symmetric padding.
    pub fn new(input: i64, kernel: i64, stride: i64, padding: i64, dilation: i64) -> Self {
        let span = (kernel - 1) * (dilation + 1) + 1;
        Self {
            input,
            output: (input + 2 * padding - span) / stride + 1,
            kernel,
            stride,
            padding,
            dilation,
        }
    }

    /// Whether a window of this axis can reach outside the input
    /// (forward) or an input can fall outside every window (backward).
    pub fn needs_bound_check(&self, direction: Direction) -> bool {
        let reach = (self.kernel - 1) * (self.dilation + 1);
        match direction {
            Direction::Forward => {
                self.padding > 0 || (self.output - 1) * self.stride - self.padding + reach >= self.input
            }
            Direction::Backward => {
                self.padding - reach < 0 || self.input - 1 + self.padding >= self.output * self.stride
            }
        }
    }

    /// Input coordinate of window tap `k` for output coordinate `o`.
    pub fn input_coord(&self, o: i64, k: i64) -> i64 {
        o * self.stride - self.padding + k * (self.dilation + 1)
    }
}

/// A pooling operation in canonical form: batch, channel and three
/// spatial axes (depth, height, width).
#[derive(Clone, Debug, PartialEq)]
pub struct PoolProblem {
    pub alg: PoolAlg,
    pub direction: Direction,
    /// Rank of the operation before normalization.
    pub ndims: usize,
    pub mb: i64,
    pub c: i64,
    /// Depth, height and width.
    pub spatial: [Window; 3],
    pub src: MemoryDesc,
    pub dst: MemoryDesc,
    pub post_ops: Vec<PostOp>,
}

impl PoolProblem {
    /// Builds a problem from up to three spatial axes given outermost
    /// first. `src_tag`/`dst_tag` describe the layouts at the original
    /// rank.
    pub fn new(
        alg: PoolAlg,
        mb: i64,
        c: i64,
        windows: &[Window],
        data_type: DataType,
        src_tag: &str,
        dst_tag: &str,
    ) -> Result<Self> {
        if windows.is_empty() || windows.len() > 3 {
            return Err(Error::RankMismatch {
                expected: 3,
                found: windows.len(),
            });
        }
        if !is_supported(data_type) {
            return Err(Error::UnsupportedDataType(data_type));
        }
        let ndims = windows.len() + 2;
        let src_dims: Vec<i64> = [mb, c]
            .into_iter()
            .chain(windows.iter().map(|w| w.input))
            .collect();
        let dst_dims: Vec<i64> = [mb, c]
            .into_iter()
            .chain(windows.iter().map(|w| w.output))
            .collect();
        let src = canonicalize(&MemoryDesc::new(data_type, &src_dims, src_tag)?, ndims);
        let dst = canonicalize(&MemoryDesc::new(data_type, &dst_dims, dst_tag)?, ndims);

        let mut spatial = [Window::UNIT; 3];
        spatial[3 - windows.len()..].copy_from_slice(windows);

        Ok(Self {
            alg,
            direction: Direction::Forward,
            ndims,
            mb,
            c,
            spatial,
            src,
            dst,
            post_ops: Vec::new(),
        })
    }

    #[must_use]
    pub fn with_post_ops(mut self, post_ops: Vec<PostOp>) -> Self {
        self.post_ops = post_ops;
        self
    }

    #[must_use]
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn data_type(&self) -> DataType {
        self.src.data_type()
    }

    pub fn window_volume(&self) -> i64 {
        self.spatial.iter().map(|w| w.kernel).product()
    }

    /// Whether a tap may fall outside the input (forward) or an input
    /// may fall outside every window (backward).
    pub fn need_src_or_dst_check(&self) -> bool {
        self.spatial
            .iter()
            .any(|w| w.needs_bound_check(self.direction))
    }

    /// Whether a forward tap may fall outside the input. The generated
    /// body is the forward reduction in both directions, so its masks
    /// and fills follow this predicate.
    pub fn needs_src_check(&self) -> bool {
        self.spatial
            .iter()
            .any(|w| w.needs_bound_check(Direction::Forward))
    }
}

/// Loop-grid entries: batch, channel, three output spatials and three
/// window axes.
pub const LG_MB: usize = 0;
pub const LG_OC: usize = 1;
pub const LG_OD: usize = 2;
pub const LG_KD: usize = 5;
pub const LOOP_GRID_LEN: usize = 8;

const MAX_MB_UNROLL: i64 = 4;
const MAX_OC_UNROLL: i64 = 4;
const MAX_WINDOW_TILE: i64 = 16;
const MAX_TG_W: i64 = 4;

/// Blocking of one pooling kernel.
///
/// `loop_grid` holds the per-thread tile (the channel entry is in
/// elements and a multiple of the SIMD width), `thread_group` the
/// number of threads per group along depth, height and width, and
/// `kernel_grid` the number of groups. The kernel grid always covers
/// the padded extents exactly:
///
/// * `kg[0] = (oc / lg_oc) * (od / (lg_od * tg[0]))`
/// * `kg[1] = (mb / lg_mb) * (oh / (lg_oh * tg[1]))`
/// * `kg[2] = ow / (lg_ow * tg[2])`
#[derive(Clone, Debug, PartialEq)]
pub struct PoolConfig {
    pub problem: PoolProblem,
    pub exec: ExecConfig,
    pub loop_grid: [i64; LOOP_GRID_LEN],
    pub thread_group: [i64; 3],
    pub kernel_grid: [i64; 3],
    /// Padded batch, channel and output spatial extents.
    pub dims_padded: [i64; CANONICAL_NDIMS],
}

/// Launch geometry in work items.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NdRange {
    pub global: [u64; 3],
    pub local: [u64; 3],
}

impl PoolConfig {
    pub fn new(problem: PoolProblem, exec: ExecConfig) -> Result<Self> {
        let simd = exec.simd() as i64;
        let src_padded = problem.src.padded_dims();

        let mb_block = batch_block(&problem.src);
        let lg_mb = (mb_block as u64).gcd(MAX_MB_UNROLL as u64) as i64;
        let lg_oc = simd * crate::div_ceil(problem.c, simd).min(MAX_OC_UNROLL);

        let [kd, kh, kw] = problem.spatial.map(|w| w.kernel);
        let (lg_kd, lg_kh, lg_kw) = if kd * kh * kw <= MAX_WINDOW_TILE {
            (kd, kh, kw)
        } else if kh * kw <= MAX_WINDOW_TILE {
            (1, kh, kw)
        } else if kw <= MAX_WINDOW_TILE {
            (1, 1, kw)
        } else {
            (1, 1, 1)
        };

        let ow = problem.spatial[2].output;
        let tg_w = (1..=MAX_TG_W)
            .rev()
            .find(|&t| (t as u64).is_power_of_two() && t <= ow)
            .unwrap_or(1);

        let loop_grid = [lg_mb, lg_oc, 1, 1, 1, lg_kd, lg_kh, lg_kw];
        let thread_group = [1, 1, tg_w];
        let dims_padded = [
            round_up(src_padded[0], lg_mb),
            round_up(src_padded[1], lg_oc),
            round_up(problem.spatial[0].output, loop_grid[2] * thread_group[0]),
            round_up(problem.spatial[1].output, loop_grid[3] * thread_group[1]),
            round_up(ow, loop_grid[4] * thread_group[2]),
        ];

        let mut config = Self {
            problem,
            exec,
            loop_grid,
            thread_group,
            kernel_grid: [0; 3],
            dims_padded,
        };
        config.kernel_grid = config.expected_kernel_grid();
        Ok(config)
    }

    pub fn simd(&self) -> i64 {
        self.exec.simd() as i64
    }

    /// Kernel grid implied by the padded dims, loop grid and thread group.
    pub fn expected_kernel_grid(&self) -> [i64; 3] {
        let lg = &self.loop_grid;
        let tg = &self.thread_group;
        let d = &self.dims_padded;
        [
            (d[1] / lg[1]) * (d[2] / (lg[2] * tg[0])),
            (d[0] / lg[0]) * (d[3] / (lg[3] * tg[1])),
            d[4] / (lg[4] * tg[2]),
        ]
    }

    /// Number of loop-grid elements along `idx` handled by one thread
    /// group: the loop-grid extent times the thread count for spatial
    /// axes.
    pub fn thread_extent(&self, idx: usize) -> i64 {
        match idx {
            2..=4 => self.loop_grid[idx] * self.thread_group[idx - 2],
            _ => self.loop_grid[idx],
        }
    }

    /// Moves work from the per-thread tile to the kernel grid. Batch
    /// is shrunk first, then channels in SIMD-width steps.
    pub fn shrink(&self) -> Result<Self> {
        let mut next = self.clone();
        if next.loop_grid[LG_MB] > 1 {
            let (dn, up) = reduce_dim(next.loop_grid[LG_MB], next.kernel_grid[1], 1)?;
            next.loop_grid[LG_MB] = dn;
            next.kernel_grid[1] = up;
        } else if next.loop_grid[LG_OC] > self.simd() {
            let (dn, up) = reduce_dim(next.loop_grid[LG_OC], next.kernel_grid[0], self.simd())?;
            next.loop_grid[LG_OC] = dn;
            next.kernel_grid[0] = up;
        } else {
            return Err(Error::GridExhausted {
                budget: self.exec.regs(),
            });
        }
        Ok(next)
    }

    /// Launch geometry; the first axis counts SIMD lanes.
    pub fn nd_range(&self) -> NdRange {
        let simd = self.exec.simd() as u64;
        let tg = self.thread_group.map(|t| t as u64);
        let kg = self.kernel_grid.map(|k| k as u64);
        let local = [tg[0] * simd, tg[1], tg[2]];
        NdRange {
            global: [kg[0] * local[0], kg[1] * local[1], kg[2] * local[2]],
            local,
        }
    }
}

impl NdRange {
    pub fn local_size(&self) -> u64 {
        self.local.iter().product()
    }
}

/// Batch block of the source layout when batch is the second innermost
/// blocked dim (e.g. `NCHW32n16c`), else 1.
fn batch_block(md: &MemoryDesc) -> i64 {
    let blocks = md.layout.blocks();
    match md.layout.second_innermost_dim() {
        Some(0) => blocks
            .iter()
            .filter(|b| b.size > 1)
            .nth(1)
            .map_or(1, |b| b.size),
        _ => 1,
    }
}

/// Element types the reduction handles. Integer sources accumulate in
/// s32, so wider integers are out.
fn is_supported(data_type: DataType) -> bool {
    matches!(
        data_type,
        DataType::U8
            | DataType::S8
            | DataType::U16
            | DataType::S16
            | DataType::S32
            | DataType::F16
            | DataType::Bf16
            | DataType::F32
    )
}

fn round_up(x: i64, m: i64) -> i64 {
    crate::div_ceil(x, m) * m
}

const REDUCE_PRIMES: [i64; 11] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31];

/// Moves a factor from `dn` to `up` so that `dn` stays a multiple of
/// `scale`. Returns the new `(dn, up)`, with `dn` strictly smaller and
/// `dn * up` unchanged.
pub fn reduce_dim(dn: i64, up: i64, scale: i64) -> Result<(i64, i64)> {
    if dn <= scale {
        return Err(Error::IrreducibleDim { extent: dn, scale });
    }
    if let Some(p) = REDUCE_PRIMES.iter().find(|&&p| dn % (p * scale) == 0) {
        return Ok((dn / p, up * p));
    }
    Ok((scale, up * (dn / scale)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn problem(mb: i64, c: i64, hw: i64, k: i64, s: i64, p: i64, tag: &str) -> PoolProblem {
        let w = Window::new(hw, k, s, p, 0);
        PoolProblem::new(PoolAlg::Max, mb, c, &[w, w], DataType::F32, tag, tag).unwrap()
    }

    fn exec(simd: u32) -> ExecConfig {
        ExecConfig::new(Architecture::XeHp, simd, true).unwrap()
    }

    #[rstest]
    #[case(8, 1, (4, 2))]
    #[case(16, 8, (8, 2))]
    #[case(48, 16, (16, 3))]
    #[case(96, 16, (48, 2))]
    #[case(592, 16, (16, 37))]
    #[case(21, 1, (7, 3))]
    #[case(37, 1, (1, 37))]
    fn reduce_dim_factors(#[case] dn: i64, #[case] scale: i64, #[case] expected: (i64, i64)) {
        let (new_dn, new_up) = reduce_dim(dn, 1, scale).unwrap();
        assert_eq!((new_dn, new_up), expected);
        assert!(new_dn < dn);
        assert_eq!(new_dn * new_up, dn);
    }

    #[test]
    fn reduce_dim_rejects_minimal() {
        assert!(matches!(
            reduce_dim(16, 2, 16),
            Err(Error::IrreducibleDim { .. })
        ));
    }

    #[test]
    fn window_output_extent() {
        let w = Window::new(8, 3, 2, 1, 0);
        assert_eq!(w.output, 4);
        assert_eq!(w.input_coord(0, 0), -1);
        assert_eq!(w.input_coord(3, 2), 7);
    }

    #[test]
    fn unsupported_simd() {
        assert!(matches!(
            ExecConfig::new(Architecture::XeHpc, 8, false),
            Err(Error::UnsupportedSimd { simd: 8, .. })
        ));
    }

    #[rstest]
    #[case(3, 1, 0, false)]
    #[case(3, 1, 1, true)]
    #[case(2, 2, 0, false)]
    // Windows ending short of the input edge need no check.
    #[case(3, 2, 0, false)]
    fn boundary_checks(#[case] k: i64, #[case] s: i64, #[case] p: i64, #[case] expected: bool) {
        let prob = problem(1, 16, 8, k, s, p, "abcd");
        assert_eq!(prob.need_src_or_dst_check(), expected);
    }

    #[rstest]
    #[case(DataType::S64)]
    #[case(DataType::U32)]
    #[case(DataType::Bool)]
    fn unsupported_data_types_are_rejected(#[case] dt: DataType) {
        let w = Window::new(8, 2, 2, 0, 0);
        let err = PoolProblem::new(PoolAlg::Max, 1, 16, &[w, w], dt, "abcd", "abcd").unwrap_err();
        assert!(matches!(err, Error::UnsupportedDataType(found) if found == dt));
    }

    #[rstest]
    // Forward taps stay inside the input; edge inputs miss some window
    // offsets.
    #[case(Window::new(8, 3, 2, 0, 0), false, true)]
    #[case(Window::new(8, 1, 1, 0, 0), false, false)]
    // Padding covers the whole reach.
    #[case(Window::new(8, 3, 1, 2, 0), true, false)]
    #[case(Window::new(9, 3, 2, 1, 0), true, true)]
    fn backward_boundary_check(#[case] w: Window, #[case] forward: bool, #[case] backward: bool) {
        assert_eq!(w.needs_bound_check(Direction::Forward), forward);
        assert_eq!(w.needs_bound_check(Direction::Backward), backward);
    }

    #[test]
    fn backward_masks_follow_the_forward_reduction() {
        let w = Window::new(8, 3, 2, 0, 0);
        let prob = PoolProblem::new(PoolAlg::Max, 1, 16, &[w, w], DataType::F32, "abcd", "abcd")
            .unwrap()
            .with_direction(Direction::Backward);
        assert!(prob.need_src_or_dst_check());
        assert!(!prob.needs_src_check());
    }

    #[test]
    fn initial_grid_is_consistent() {
        let config = PoolConfig::new(problem(2, 40, 8, 3, 2, 1, "aBcd16b"), exec(16)).unwrap();
        assert_eq!(config.loop_grid, [1, 48, 1, 1, 1, 1, 3, 3]);
        assert_eq!(config.thread_group, [1, 1, 4]);
        assert_eq!(config.dims_padded, [2, 48, 1, 4, 4]);
        assert_eq!(config.kernel_grid, [1, 8, 1]);
        assert_eq!(config.kernel_grid, config.expected_kernel_grid());

        let range = config.nd_range();
        assert_eq!(range.local, [16, 1, 4]);
        for i in 0..3 {
            assert_eq!(range.global[i] % range.local[i], 0);
        }
    }

    #[test]
    fn batch_blocked_layout_unrolls_batch() {
        let config = PoolConfig::new(problem(5, 16, 8, 2, 2, 0, "ABcd8a16b"), exec(16)).unwrap();
        assert_eq!(config.loop_grid[LG_MB], 4);
        assert_eq!(config.dims_padded[0], 8);
        assert_eq!(config.kernel_grid, config.expected_kernel_grid());
    }

    #[test]
    fn shrink_prefers_batch_then_channels() {
        let mut config =
            PoolConfig::new(problem(8, 64, 8, 2, 2, 0, "ABcd8a16b"), exec(16)).unwrap();
        assert_eq!((config.loop_grid[LG_MB], config.loop_grid[LG_OC]), (4, 64));
        let mut seen = Vec::new();
        while let Ok(next) = config.shrink() {
            assert_eq!(next.kernel_grid, next.expected_kernel_grid());
            seen.push((next.loop_grid[LG_MB], next.loop_grid[LG_OC]));
            config = next;
        }
        assert_eq!(seen, vec![(2, 64), (1, 64), (1, 32), (1, 16)]);
        assert!(matches!(config.shrink(), Err(Error::GridExhausted { .. })));
    }
}
