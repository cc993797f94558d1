pub mod access;
pub mod architecture;
pub mod config;
pub mod epilogue;
pub mod error;
pub mod generators;
pub mod ir_context;
pub mod passes;
pub mod schedule;
pub mod trace;
pub mod view;

pub use config::{ExecConfig, NdRange, PoolAlg, PoolConfig, PoolProblem, Window};
pub use error::Error;
pub use generators::pooling::{KernelArgs, PoolingGenerator, PoolingKernel};

/// Signed ceiling division with the same semantics as the (unstable)
/// `i64::div_ceil`.
pub(crate) fn div_ceil(a: i64, b: i64) -> i64 {
    let (q, r) = (a / b, a % b);
    if (r > 0 && b > 0) || (r < 0 && b < 0) { q + 1 } else { q }
}
