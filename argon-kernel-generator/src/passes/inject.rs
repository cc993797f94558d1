use crate::ir_context::IrContext;
use argon_ir::{AllocKind, Expr, Stmt, Var};

/// A buffer to be allocated around the kernel body.
#[derive(Clone, Debug, PartialEq)]
pub struct BufferAlloc {
    pub buf: Var,
    pub size: u32,
    pub kind: AllocKind,
}

impl BufferAlloc {
    pub fn grf(buf: Var, size: u32) -> Self {
        Self {
            buf,
            size,
            kind: AllocKind::Grf,
        }
    }

    pub fn global(buf: Var) -> Self {
        Self {
            buf,
            size: 0,
            kind: AllocKind::Global,
        }
    }
}

/// Wraps `stmt` in `Let`s, the first pair outermost.
pub fn inject_let_stmts(stmt: Stmt, lets: Vec<(Var, Expr)>) -> Stmt {
    lets.into_iter()
        .rev()
        .fold(stmt, |body, (var, value)| Stmt::let_(var, value, body))
}

/// Wraps `stmt` in allocations, the first outermost.
pub fn inject_alloc_stmts(stmt: Stmt, allocs: Vec<BufferAlloc>) -> Stmt {
    allocs
        .into_iter()
        .rev()
        .fold(stmt, |body, a| Stmt::alloc(a.buf, a.size, a.kind, body))
}

/// Defines the kernel-level values registered in the context that the
/// body refers to.
pub fn inject_external_var_let(stmt: Stmt, ctx: &IrContext) -> Stmt {
    let used: Vec<(Var, Expr)> = ctx
        .external_vars()
        .filter(|(var, _)| stmt.uses_var(var))
        .map(|(var, value)| (var.clone(), value.clone()))
        .collect();
    inject_let_stmts(stmt, used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon_ir::Type;

    #[test]
    fn first_injected_is_outermost() {
        let a = Var::s32("a");
        let b = Var::s32("b");
        let buf = Var::new("buf", Type::byte_ptr());
        let body = Stmt::store(&buf, 0, a.expr() + b.expr());
        let stmt = inject_let_stmts(body, vec![(a.clone(), Expr::Int(1)), (b, Expr::Int(2))]);
        let stmt = inject_alloc_stmts(stmt, vec![BufferAlloc::grf(buf.clone(), 32)]);

        let Stmt::Alloc(alloc) = &stmt else {
            panic!("expected alloc, got {stmt}");
        };
        assert_eq!(alloc.buf, buf);
        let Stmt::Let(outer) = &*alloc.body else {
            panic!("expected let");
        };
        assert_eq!(outer.var, a);
    }
}
