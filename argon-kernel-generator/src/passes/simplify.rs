use argon_ir::{BinaryOp, Expr, Stmt, UnaryOp};

/// Folds constants and algebraic identities in every expression, then
/// removes statements made trivial by folding: constant `If`s,
/// single-iteration loops and `Let`s of constants.
pub fn simplify(stmt: Stmt) -> Stmt {
    stmt.map_exprs(&mut simplify_expr).map(&mut simplify_stmt)
}

pub fn simplify_expr(e: Expr) -> Expr {
    e.map(&mut fold)
}

fn fold(e: Expr) -> Expr {
    match e {
        Expr::Binary(op, a, b) => fold_binary(op, *a, *b),
        Expr::Unary(UnaryOp::Neg, a) => match *a {
            Expr::Int(x) => Expr::Int(-x),
            Expr::Unary(UnaryOp::Neg, inner) => *inner,
            a => Expr::Unary(UnaryOp::Neg, Box::new(a)),
        },
        Expr::Unary(UnaryOp::Not, a) => match *a {
            Expr::Bool(x) => Expr::Bool(!x),
            a => Expr::Unary(UnaryOp::Not, Box::new(a)),
        },
        Expr::Cast(ty, a) if ty == a.ty() => *a,
        Expr::Cast(ty, a) if ty.is_scalar() && ty.data_type.is_int() => match *a {
            Expr::Int(x) => Expr::Int(x),
            a => Expr::Cast(ty, Box::new(a)),
        },
        other => other,
    }
}

fn fold_binary(op: BinaryOp, a: Expr, b: Expr) -> Expr {
    use BinaryOp::*;

    if let (Expr::Int(x), Expr::Int(y)) = (&a, &b) {
        if let Some(v) = op.eval_int(*x, *y) {
            return if op.is_cmp() || matches!(op, And | Or) {
                Expr::Bool(v != 0)
            } else {
                Expr::Int(v)
            };
        }
    }
    if let (Expr::Bool(x), Expr::Bool(y)) = (&a, &b) {
        match op {
            And => return Expr::Bool(*x && *y),
            Or => return Expr::Bool(*x || *y),
            _ => {}
        }
    }

    // Canonicalize constants to the right of commutative ops.
    let (a, b) = if op.is_commutative() && a.is_const() && !b.is_const() {
        (b, a)
    } else {
        (a, b)
    };

    match (op, &a, &b) {
        (Add | Sub, _, Expr::Int(0)) => return a,
        (Mul | Div, _, Expr::Int(1)) => return a,
        (Mul, _, Expr::Int(0)) if a.ty().is_scalar() => return Expr::Int(0),
        (Mod, _, Expr::Int(1)) => return Expr::Int(0),
        (And, _, Expr::Bool(true)) | (Or, _, Expr::Bool(false)) => return a,
        (And, _, Expr::Bool(false)) => return Expr::Bool(false),
        (Or, _, Expr::Bool(true)) => return Expr::Bool(true),
        _ => {}
    }

    // Reassociate `(x op c1) op c2` for additive and multiplicative chains.
    if let (Expr::Binary(inner_op, x, c1), Expr::Int(c2)) = (&a, &b) {
        if let Expr::Int(c1) = **c1 {
            match (inner_op, op) {
                (Add, Add) => return fold_binary(Add, (**x).clone(), Expr::Int(c1 + c2)),
                (Add, Sub) => return fold_binary(Add, (**x).clone(), Expr::Int(c1 - c2)),
                (Sub, Add) => return fold_binary(Sub, (**x).clone(), Expr::Int(c1 - c2)),
                (Mul, Mul) => return fold_binary(Mul, (**x).clone(), Expr::Int(c1 * c2)),
                _ => {}
            }
        }
    }

    Expr::binary(op, a, b)
}

fn simplify_stmt(stmt: Stmt) -> Stmt {
    match stmt {
        Stmt::If(s) => match s.cond {
            Expr::Bool(true) => *s.then_body,
            Expr::Bool(false) => s.else_body.map_or_else(Stmt::empty, |b| *b),
            _ => Stmt::If(s),
        },
        Stmt::For(s) => match (s.init.as_int(), s.bound.as_int()) {
            (Some(init), Some(bound)) if bound <= init => Stmt::empty(),
            (Some(init), Some(bound)) if bound == init + 1 => {
                let value = Expr::Int(init);
                let var = s.var.clone();
                simplify(s.body.map_exprs(&mut |e| e.substitute(&var, &value)))
            }
            _ => Stmt::For(s),
        },
        Stmt::Let(s) if s.value.is_const() => {
            let (var, value) = (s.var, s.value);
            simplify(s.body.map_exprs(&mut |e| e.substitute(&var, &value)))
        }
        Stmt::Group(g) if g.label == argon_ir::Label::None => Stmt::seq(g.body),
        other => other,
    }
}
