//! Generator for pooling kernels (max, average with and without
//! padding) over 1D, 2D and 3D windows.
//!
//! The generator starts from the blocking chosen by [`PoolConfig::new`]
//! and builds a kernel body for it. A body that needs more registers
//! than the thread has is rejected, the per-thread tile is shrunk by
//! moving a factor of it to the kernel grid, and the body is rebuilt
//! from scratch. This repeats until a body fits or the tile cannot be
//! shrunk any further.

use crate::{
    config::{NdRange, PoolConfig, PoolProblem},
    epilogue::{Epilogue, PostOpEpilogue},
    error::{Error, Result},
    trace::{NoTrace, TraceSink},
};
use argon_ir::{Stmt, Type, Var};
use body::Attempt;

mod body;
mod grid;

/// Upper bound on build attempts. Every shrink strictly reduces the
/// per-thread tile, so exhaustion is reached well before this.
pub const DEFAULT_MAX_ATTEMPTS: usize = 32;

/// Global memory arguments of a pooling kernel.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelArgs {
    pub src: Var,
    pub dst: Var,
    /// One per post-op that reads an operand, in post-op order.
    pub post_ops: Vec<Var>,
}

impl KernelArgs {
    pub fn new(problem: &PoolProblem) -> Self {
        let post_ops = problem
            .post_ops
            .iter()
            .filter(|p| p.has_operand())
            .enumerate()
            .map(|(i, _)| Var::new(format!("post_op{i}"), Type::byte_ptr()))
            .collect();
        Self {
            src: Var::new("src", Type::byte_ptr()),
            dst: Var::new("dst", Type::byte_ptr()),
            post_ops,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Var> {
        [&self.src, &self.dst].into_iter().chain(&self.post_ops)
    }
}

/// An accepted kernel.
#[derive(Debug, Clone)]
pub struct PoolingKernel {
    pub body: Stmt,
    pub nd_range: NdRange,
    /// The configuration the body was built for, after any shrinking.
    pub config: PoolConfig,
    pub args: KernelArgs,
    /// Peak register usage of `body`.
    pub regs: u32,
}

pub struct PoolingGenerator<'a> {
    epilogue: &'a dyn Epilogue,
    trace: &'a dyn TraceSink,
    max_attempts: usize,
}

impl Default for PoolingGenerator<'static> {
    fn default() -> Self {
        Self::new(&PostOpEpilogue, &NoTrace)
    }
}

impl<'a> PoolingGenerator<'a> {
    pub fn new(epilogue: &'a dyn Epilogue, trace: &'a dyn TraceSink) -> Self {
        Self {
            epilogue,
            trace,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_max_attempts(self, max_attempts: usize) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    pub fn generate(&self, config: PoolConfig) -> Result<PoolingKernel> {
        let args = KernelArgs::new(&config.problem);
        self.generate_with_args(config, args)
    }

    /// Builds a kernel reading and writing the given arguments.
    pub fn generate_with_args(
        &self,
        mut config: PoolConfig,
        args: KernelArgs,
    ) -> Result<PoolingKernel> {
        for attempt in 0..self.max_attempts {
            tracing::debug!(
                attempt,
                loop_grid = ?config.loop_grid,
                thread_group = ?config.thread_group,
                kernel_grid = ?config.kernel_grid,
                "building pooling kernel"
            );
            match body::try_build(&config, &args, self.epilogue, self.trace)? {
                Attempt::Accepted { body, regs } => {
                    return Ok(PoolingKernel {
                        body,
                        nd_range: config.nd_range(),
                        config,
                        args,
                        regs,
                    });
                }
                Attempt::Rejected { regs } => {
                    tracing::warn!(
                        regs,
                        budget = config.exec.regs(),
                        loop_grid = ?config.loop_grid,
                        "pooling kernel exceeds the register budget, shrinking the loop grid"
                    );
                    config = config.shrink()?;
                }
            }
        }
        Err(Error::RetryLimit(self.max_attempts))
    }
}
