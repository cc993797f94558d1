use ahash::AHashMap;
use argon_ir::{BinaryOp, Builtin, DataType, Expr, Stmt, Type, UnaryOp, Var};

/// Inclusive value range of an integer expression.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Interval {
    lo: i128,
    hi: i128,
}

impl Interval {
    fn point(x: i64) -> Self {
        Self {
            lo: x as i128,
            hi: x as i128,
        }
    }

    fn fits_i32(self) -> bool {
        self.lo >= i32::MIN as i128 && self.hi <= i32::MAX as i128
    }

    fn hull(values: [i128; 4]) -> Self {
        Self {
            lo: values.into_iter().min().unwrap_or(0),
            hi: values.into_iter().max().unwrap_or(0),
        }
    }
}

struct Bounds<'a> {
    vars: AHashMap<Var, Interval>,
    builtin_extent: &'a dyn Fn(Builtin) -> i64,
}

impl Bounds<'_> {
    /// Range of `e`, and whether any intermediate value leaves the
    /// 32-bit range.
    fn eval(&self, e: &Expr) -> Option<(Interval, bool)> {
        let (range, overflow) = match e {
            Expr::Int(x) => (Interval::point(*x), false),
            Expr::Bool(b) => (Interval::point(*b as i64), false),
            Expr::Var(v) => (*self.vars.get(v)?, false),
            Expr::Builtin(b) => (
                Interval {
                    lo: 0,
                    hi: (self.builtin_extent)(*b) as i128 - 1,
                },
                false,
            ),
            Expr::Unary(UnaryOp::Neg, a) => {
                let (r, o) = self.eval(a)?;
                (Interval { lo: -r.hi, hi: -r.lo }, o)
            }
            Expr::Cast(_, a) | Expr::Broadcast(a, _) => self.eval(a)?,
            Expr::Binary(op, a, b) => {
                let (ra, oa) = self.eval(a)?;
                let (rb, ob) = self.eval(b)?;
                let r = match op {
                    BinaryOp::Add => Interval {
                        lo: ra.lo + rb.lo,
                        hi: ra.hi + rb.hi,
                    },
                    BinaryOp::Sub => Interval {
                        lo: ra.lo - rb.hi,
                        hi: ra.hi - rb.lo,
                    },
                    BinaryOp::Mul => Interval::hull([
                        ra.lo * rb.lo,
                        ra.lo * rb.hi,
                        ra.hi * rb.lo,
                        ra.hi * rb.hi,
                    ]),
                    BinaryOp::Div if rb.lo > 0 => Interval::hull([
                        ra.lo.div_euclid(rb.lo),
                        ra.lo.div_euclid(rb.hi),
                        ra.hi.div_euclid(rb.lo),
                        ra.hi.div_euclid(rb.hi),
                    ]),
                    BinaryOp::Mod if rb.lo > 0 => Interval {
                        lo: 0,
                        hi: rb.hi - 1,
                    },
                    BinaryOp::Min => Interval {
                        lo: ra.lo.min(rb.lo),
                        hi: ra.hi.min(rb.hi),
                    },
                    BinaryOp::Max => Interval {
                        lo: ra.lo.max(rb.lo),
                        hi: ra.hi.max(rb.hi),
                    },
                    op if op.is_cmp() || matches!(op, BinaryOp::And | BinaryOp::Or) => {
                        Interval { lo: 0, hi: 1 }
                    }
                    _ => return None,
                };
                (r, oa || ob)
            }
            _ => return None,
        };
        Some((range, overflow || !range.fits_i32()))
    }
}

fn is_int_scalar(e: &Expr) -> bool {
    let ty = e.ty();
    ty.is_scalar() && ty.data_type.is_int()
}

/// Promotes the leaves of `e` to 64-bit so every intermediate value is
/// computed without wrapping.
fn promote(e: Expr) -> Expr {
    let s64 = Type::scalar(DataType::S64);
    e.map(&mut |e| match e {
        Expr::Var(_) | Expr::Builtin(_) if e.ty().data_type == DataType::S32 => e.cast(s64),
        other => other,
    })
}

/// Rewrites integer address arithmetic whose intermediate values can
/// exceed the 32-bit range to use 64-bit arithmetic. Ranges come from
/// loop bounds, `Let` values and the extent of each hardware index.
pub fn fix_int32_overflow(stmt: Stmt, builtin_extent: &dyn Fn(Builtin) -> i64) -> Stmt {
    let mut bounds = Bounds {
        vars: AHashMap::new(),
        builtin_extent,
    };
    fix(stmt, &mut bounds)
}

fn fix_expr(e: Expr, bounds: &Bounds<'_>) -> Expr {
    if !is_int_scalar(&e) {
        return e;
    }
    match bounds.eval(&e) {
        Some((_, true)) => promote(e),
        _ => e,
    }
}

fn fix(stmt: Stmt, bounds: &mut Bounds<'_>) -> Stmt {
    match stmt {
        Stmt::Let(mut s) => {
            s.value = fix_expr(s.value, bounds);
            if let Some((range, _)) = bounds.eval(&s.value) {
                bounds.vars.insert(s.var.clone(), range);
            }
            s.body = Box::new(fix(*s.body, bounds));
            Stmt::Let(s)
        }
        Stmt::For(mut s) => {
            let lo = bounds.eval(&s.init).map(|(r, _)| r.lo);
            let hi = bounds.eval(&s.bound).map(|(r, _)| r.hi - 1);
            if let (Some(lo), Some(hi)) = (lo, hi) {
                bounds.vars.insert(s.var.clone(), Interval { lo, hi });
            }
            s.body = Box::new(fix(*s.body, bounds));
            Stmt::For(s)
        }
        Stmt::Send(mut s) => {
            s.mem_off = fix_expr(s.mem_off, bounds);
            Stmt::Send(s)
        }
        Stmt::Alloc(mut s) => {
            s.body = Box::new(fix(*s.body, bounds));
            Stmt::Alloc(s)
        }
        Stmt::If(mut s) => {
            s.then_body = Box::new(fix(*s.then_body, bounds));
            s.else_body = s.else_body.map(|b| Box::new(fix(*b, bounds)));
            Stmt::If(s)
        }
        Stmt::Group(mut g) => {
            g.body = g.body.into_iter().map(|s| fix(s, bounds)).collect();
            Stmt::Group(g)
        }
        store @ Stmt::Store(_) => store,
    }
}
