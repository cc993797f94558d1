use crate::ir_context::IrContext;
use ahash::{AHashMap, AHashSet};
use argon_ir::{Expr, Stmt, Var};

/// Minimum node count for an expression to be worth a variable.
const MIN_NODES: usize = 3;

/// Replaces integer subexpressions repeated within a statement list by
/// `Let`-bound variables. The registers spent on the new variables
/// never exceed `budget_bytes`.
pub fn eliminate_common_subexprs(stmt: Stmt, ctx: &mut IrContext, budget_bytes: u32) -> Stmt {
    let mut budget = budget_bytes;
    cse(stmt, ctx, &mut budget)
}

fn cse(stmt: Stmt, ctx: &mut IrContext, budget: &mut u32) -> Stmt {
    let stmt = match stmt {
        Stmt::Group(_) => eliminate_in_scope(stmt, ctx, budget),
        other => other,
    };
    // Inner scopes see what is left of the budget.
    match stmt {
        Stmt::Let(mut s) => {
            s.body = Box::new(cse(*s.body, ctx, budget));
            Stmt::Let(s)
        }
        Stmt::Alloc(mut s) => {
            s.body = Box::new(cse(*s.body, ctx, budget));
            Stmt::Alloc(s)
        }
        Stmt::For(mut s) => {
            s.body = Box::new(cse(*s.body, ctx, budget));
            Stmt::For(s)
        }
        Stmt::If(mut s) => {
            s.then_body = Box::new(cse(*s.then_body, ctx, budget));
            s.else_body = s.else_body.map(|b| Box::new(cse(*b, ctx, budget)));
            Stmt::If(s)
        }
        Stmt::Group(mut g) => {
            g.body = g.body.into_iter().map(|s| cse(s, ctx, budget)).collect();
            Stmt::Group(g)
        }
        leaf => leaf,
    }
}

/// Variables introduced by loops and lets within `stmt`.
fn bound_vars(stmt: &Stmt) -> AHashSet<Var> {
    let mut vars = AHashSet::new();
    stmt.walk(&mut |s| match s {
        Stmt::For(f) => {
            vars.insert(f.var.clone());
        }
        Stmt::Let(l) => {
            vars.insert(l.var.clone());
        }
        _ => {}
    });
    vars
}

fn candidate(e: &Expr, bound: &AHashSet<Var>) -> bool {
    let ty = e.ty();
    if !ty.is_scalar()
        || !ty.data_type.is_int()
        || e.node_count() < MIN_NODES
        || e.contains_load()
    {
        return false;
    }
    let mut ok = true;
    e.visit(&mut |e| {
        if let Expr::Var(v) = e {
            ok &= !bound.contains(v);
        }
    });
    ok
}

/// Counts how many statements reference each candidate expression.
fn count_candidates(stmt: &Stmt, bound: &AHashSet<Var>) -> AHashMap<Expr, usize> {
    let mut counts = AHashMap::new();
    stmt.walk(&mut |s| {
        let mut seen = AHashSet::new();
        for root in s.exprs() {
            root.visit(&mut |e| {
                if candidate(e, bound) && seen.insert(e.clone()) {
                    *counts.entry(e.clone()).or_insert(0) += 1;
                }
            });
        }
    });
    counts
}

fn eliminate_in_scope(mut stmt: Stmt, ctx: &mut IrContext, budget: &mut u32) -> Stmt {
    let bound = bound_vars(&stmt);
    let mut lets = Vec::new();
    loop {
        let counts = count_candidates(&stmt, &bound);
        // Largest savings first; ties broken deterministically by text.
        let best = counts
            .into_iter()
            .filter(|(_, n)| *n >= 2)
            .max_by_key(|(e, n)| (e.node_count() * n, std::cmp::Reverse(e.to_string())));
        let Some((expr, _)) = best else { break };
        let size = expr.ty().size();
        if size > *budget {
            break;
        }
        *budget -= size;
        let var = ctx.create_tmp_var(expr.ty(), "cse");
        let replacement = var.expr();
        stmt = stmt.map_exprs(&mut |e| {
            e.map(&mut |e| if e == expr { replacement.clone() } else { e })
        });
        lets.push((var, expr));
    }
    lets.into_iter()
        .rev()
        .fold(stmt, |body, (var, value)| Stmt::let_(var, value, body))
}
