//! Hooks for observing generated kernels.

use crate::config::PoolConfig;
use argon_ir::Stmt;

/// Receives every kernel body produced by an attempt, accepted or not.
pub trait TraceSink {
    fn kernel_body(&self, body: &Stmt, config: &PoolConfig, regs: u32);
}

/// Discards everything.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoTrace;

impl TraceSink for NoTrace {
    fn kernel_body(&self, _body: &Stmt, _config: &PoolConfig, _regs: u32) {}
}

/// Forwards kernel bodies to `tracing` at trace level.
#[derive(Copy, Clone, Debug, Default)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn kernel_body(&self, body: &Stmt, config: &PoolConfig, regs: u32) {
        tracing::trace!(
            regs,
            loop_grid = ?config.loop_grid,
            kernel_grid = ?config.kernel_grid,
            thread_group = ?config.thread_group,
            "pooling kernel body:\n{body}"
        );
    }
}
