use argon_ir::{DataType, LayoutError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Fatal build failures. Each indicates a configuration the caller
/// should not have handed to the generator; the caller is expected
/// to report the primitive as unimplemented.
///
/// Exceeding the register budget is not an error: it causes a
/// rejected attempt and a retry with a smaller grid.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("window dimension `{dim}` has loop extent {extent} above its bound {bound}")]
    WindowExtentExceedsBound { dim: String, extent: i64, bound: i64 },
    #[error("view rank {found} does not match the canonical rank {expected}")]
    RankMismatch { expected: usize, found: usize },
    #[error("cannot distribute `{primary}` and `{secondary}`: exactly one of them must be spatial")]
    InvalidDimPair { primary: String, secondary: String },
    #[error("kernel grid axis {axis} has extent {expected}, but bound dimensions cover {found}")]
    KernelGridMismatch { axis: usize, expected: i64, found: i64 },
    #[error("thread group axis {axis} has extent {expected}, but bound dimensions cover {found}")]
    ThreadGroupMismatch { axis: usize, expected: i64, found: i64 },
    #[error("schedule is finalized and cannot be modified")]
    ScheduleFinalized,
    #[error("unknown schedule variable `{0}`")]
    UnknownVar(String),
    #[error("schedule variable `{0}` was already split or fused")]
    NotALeaf(String),
    #[error("loop extent {extent} cannot be reduced below {scale}")]
    IrreducibleDim { extent: i64, scale: i64 },
    #[error("minimal loop grid still exceeds the register budget of {budget} registers")]
    GridExhausted { budget: u32 },
    #[error("gave up after {0} grid reductions")]
    RetryLimit(usize),
    #[error("vector width {simd} is not supported by {arch}")]
    UnsupportedSimd { simd: u32, arch: String },
    #[error("memory access tile has {found} elements per vector, expected {expected}")]
    TileMismatch { expected: i64, found: i64 },
    #[error("data type {0} is not supported for pooling")]
    UnsupportedDataType(DataType),
    #[error(transparent)]
    Layout(#[from] LayoutError),
}
