//! Lowering passes run over a kernel body after it is built.
//!
//! The order is fixed; see [`lower`].

use crate::{ir_context::IrContext, schedule::Schedule};
use argon_ir::{Label, Stmt};

mod alloc;
mod cse;
mod inject;
mod overflow;
mod regs;
mod send;
mod simplify;

pub use alloc::optimize_alloc_let;
pub use cse::eliminate_common_subexprs;
pub use inject::{BufferAlloc, inject_alloc_stmts, inject_external_var_let, inject_let_stmts};
pub use overflow::fix_int32_overflow;
pub use regs::get_peak_regs;
pub use send::{inject_send, lift_buffer_offsets_in_send, split_wide_stores};
pub use simplify::{simplify, simplify_expr};

/// Turns a built body into its final form: binds grid variables,
/// defines buffers and kernel-level values, lowers memory messages,
/// guards address arithmetic against overflow, shares repeated
/// subexpressions and tightens scopes. The result is a single
/// kernel-labeled group.
pub fn lower(
    body: Stmt,
    schedule: &Schedule,
    allocs: Vec<BufferAlloc>,
    ctx: &mut IrContext,
) -> Stmt {
    let stmt = schedule.create_bind_stmt(body);
    let stmt = inject_let_stmts(stmt, schedule.grid_lets());
    let stmt = inject_alloc_stmts(stmt, allocs);
    let stmt = inject_external_var_let(stmt, ctx);
    let stmt = simplify(stmt);
    let stmt = lift_buffer_offsets_in_send(stmt, ctx);
    let stmt = inject_send(stmt, ctx);
    let stmt = split_wide_stores(stmt, ctx);
    let stmt = fix_int32_overflow(stmt, &|b| schedule.builtin_extent(b));
    let exec = ctx.exec();
    let budget = exec.regs() * exec.grf_size();
    let stmt = eliminate_common_subexprs(stmt, ctx, budget);
    let stmt = simplify(stmt);
    let stmt = optimize_alloc_let(stmt);
    Stmt::group(Label::Kernel, stmt)
}
