use crate::data_type::{DataType, Type};
use indexmap::IndexSet;
use std::{
    fmt::{Display, Formatter},
    ops::{Add, BitAnd, BitOr, Div, Mul, Neg, Rem, Sub},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

/// A named, typed variable. Two variables are equal only if
/// they were produced by the same call to `Var::new`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Var {
    id: u32,
    name: Arc<str>,
    ty: Type,
}

impl Var {
    pub fn new(name: impl AsRef<str>, ty: Type) -> Self {
        static NEXT_ID: AtomicU32 = AtomicU32::new(0);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(name.as_ref()),
            ty,
        }
    }

    pub fn s32(name: impl AsRef<str>) -> Self {
        Self::new(name, Type::s32())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> Type {
        self.ty
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn expr(&self) -> Expr {
        Expr::Var(self.clone())
    }
}

impl Display for Var {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Hardware-provided index sources.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Builtin {
    /// Index of the work item within its thread group along an axis.
    LocalId(u8),
    /// Index of the thread group within the kernel grid along an axis.
    GroupId(u8),
}

impl Display for Builtin {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Builtin::LocalId(axis) => write!(f, "local_id[{axis}]"),
            Builtin::GroupId(axis) => write!(f, "group_id[{axis}]"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_cmp(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne
        )
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Mul
                | BinaryOp::Min
                | BinaryOp::Max
                | BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::And
                | BinaryOp::Or
        )
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Min => "min",
            BinaryOp::Max => "max",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    /// Evaluates the operation on integer operands.
    /// Booleans are represented as 0/1.
    pub fn eval_int(self, a: i64, b: i64) -> Option<i64> {
        Some(match self {
            BinaryOp::Add => a.checked_add(b)?,
            BinaryOp::Sub => a.checked_sub(b)?,
            BinaryOp::Mul => a.checked_mul(b)?,
            BinaryOp::Div => a.checked_div_euclid(b)?,
            BinaryOp::Mod => a.checked_rem_euclid(b)?,
            BinaryOp::Min => a.min(b),
            BinaryOp::Max => a.max(b),
            BinaryOp::Lt => (a < b) as i64,
            BinaryOp::Le => (a <= b) as i64,
            BinaryOp::Gt => (a > b) as i64,
            BinaryOp::Ge => (a >= b) as i64,
            BinaryOp::Eq => (a == b) as i64,
            BinaryOp::Ne => (a != b) as i64,
            BinaryOp::And => ((a != 0) && (b != 0)) as i64,
            BinaryOp::Or => ((a != 0) || (b != 0)) as i64,
        })
    }
}

/// Expression tree. Floating-point immediates are stored as
/// `f32` bit patterns so expressions can be hashed and compared.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Expr {
    Int(i64),
    Float(u32),
    Bool(bool),
    Var(Var),
    Builtin(Builtin),
    /// Vector `[0, 1, ..., n - 1]`.
    Iota(u32),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Cast(Type, Box<Expr>),
    /// Replicates a scalar across `n` lanes.
    Broadcast(Box<Expr>, u32),
    /// Load from a register buffer at a constant byte offset.
    Load { ty: Type, buf: Var, off: u32 },
}

impl Expr {
    pub fn float(x: f32) -> Self {
        Expr::Float(x.to_bits())
    }

    pub fn binary(op: BinaryOp, a: impl Into<Expr>, b: impl Into<Expr>) -> Self {
        Expr::Binary(op, Box::new(a.into()), Box::new(b.into()))
    }

    pub fn broadcast(self, elems: u32) -> Self {
        if elems == 1 {
            self
        } else {
            Expr::Broadcast(Box::new(self), elems)
        }
    }

    pub fn cast(self, ty: Type) -> Self {
        if self.ty() == ty {
            self
        } else {
            Expr::Cast(ty, Box::new(self))
        }
    }

    pub fn load(ty: Type, buf: &Var, off: u32) -> Self {
        Expr::Load {
            ty,
            buf: buf.clone(),
            off,
        }
    }

    pub fn lt(self, other: impl Into<Expr>) -> Self {
        Self::binary(BinaryOp::Lt, self, other)
    }

    pub fn le(self, other: impl Into<Expr>) -> Self {
        Self::binary(BinaryOp::Le, self, other)
    }

    pub fn ge(self, other: impl Into<Expr>) -> Self {
        Self::binary(BinaryOp::Ge, self, other)
    }

    pub fn gt(self, other: impl Into<Expr>) -> Self {
        Self::binary(BinaryOp::Gt, self, other)
    }

    pub fn min(self, other: impl Into<Expr>) -> Self {
        Self::binary(BinaryOp::Min, self, other)
    }

    pub fn max(self, other: impl Into<Expr>) -> Self {
        Self::binary(BinaryOp::Max, self, other)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Expr::Int(x) => Some(*x),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Expr::Int(_) | Expr::Float(_) | Expr::Bool(_))
    }

    pub fn ty(&self) -> Type {
        match self {
            Expr::Int(x) => {
                if i32::try_from(*x).is_ok() {
                    Type::s32()
                } else {
                    Type::scalar(DataType::S64)
                }
            }
            Expr::Float(_) => Type::f32(),
            Expr::Bool(_) => Type::bool(),
            Expr::Var(v) => v.ty(),
            Expr::Builtin(_) => Type::s32(),
            Expr::Iota(n) => Type::new(DataType::S32, *n),
            Expr::Unary(UnaryOp::Not, a) => Type::bool().with_elems(a.ty().elems),
            Expr::Unary(UnaryOp::Neg, a) => a.ty(),
            Expr::Binary(op, a, b) => {
                let (ta, tb) = (a.ty(), b.ty());
                let elems = ta.elems.max(tb.elems);
                if op.is_cmp() || matches!(op, BinaryOp::And | BinaryOp::Or) {
                    Type::bool().with_elems(elems)
                } else {
                    Type::new(ta.data_type.max(tb.data_type), elems)
                }
            }
            Expr::Cast(ty, _) => *ty,
            Expr::Broadcast(a, n) => a.ty().with_elems(*n),
            Expr::Load { ty, .. } => *ty,
        }
    }

    /// Rebuilds the expression bottom-up, applying `f` to every node
    /// after its children have been rewritten.
    pub fn map(self, f: &mut impl FnMut(Expr) -> Expr) -> Expr {
        let rebuilt = match self {
            Expr::Unary(op, a) => Expr::Unary(op, Box::new(a.map(f))),
            Expr::Binary(op, a, b) => Expr::Binary(op, Box::new(a.map(f)), Box::new(b.map(f))),
            Expr::Cast(ty, a) => Expr::Cast(ty, Box::new(a.map(f))),
            Expr::Broadcast(a, n) => Expr::Broadcast(Box::new(a.map(f)), n),
            other => other,
        };
        f(rebuilt)
    }

    /// Visits every node, parents first.
    pub fn visit(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Unary(_, a) | Expr::Cast(_, a) | Expr::Broadcast(a, _) => a.visit(f),
            Expr::Binary(_, a, b) => {
                a.visit(f);
                b.visit(f);
            }
            _ => {}
        }
    }

    pub fn substitute(self, var: &Var, with: &Expr) -> Expr {
        self.map(&mut |e| match e {
            Expr::Var(ref v) if v == var => with.clone(),
            e => e,
        })
    }

    /// Collects variables referenced by the expression, including
    /// buffers read by `Load` nodes.
    pub fn collect_vars(&self, out: &mut IndexSet<Var, ahash::RandomState>) {
        self.visit(&mut |e| match e {
            Expr::Var(v) => {
                out.insert(v.clone());
            }
            Expr::Load { buf, .. } => {
                out.insert(buf.clone());
            }
            _ => {}
        });
    }

    pub fn contains_var(&self, var: &Var) -> bool {
        let mut found = false;
        self.visit(&mut |e| match e {
            Expr::Var(v) | Expr::Load { buf: v, .. } if v == var => found = true,
            _ => {}
        });
        found
    }

    pub fn contains_load(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if matches!(e, Expr::Load { .. }) {
                found = true;
            }
        });
        found
    }

    pub fn node_count(&self) -> usize {
        let mut n = 0;
        self.visit(&mut |_| n += 1);
        n
    }

    /// Evaluates a scalar integer expression given values for variables.
    /// Returns `None` if any variable is unknown or the expression
    /// is not integral.
    pub fn eval_int(&self, env: &impl Fn(&Var) -> Option<i64>) -> Option<i64> {
        match self {
            Expr::Int(x) => Some(*x),
            Expr::Bool(b) => Some(*b as i64),
            Expr::Var(v) => env(v),
            Expr::Unary(UnaryOp::Neg, a) => a.eval_int(env)?.checked_neg(),
            Expr::Unary(UnaryOp::Not, a) => Some((a.eval_int(env)? == 0) as i64),
            Expr::Binary(op, a, b) => op.eval_int(a.eval_int(env)?, b.eval_int(env)?),
            Expr::Cast(ty, a) if ty.data_type.is_int() => a.eval_int(env),
            Expr::Cast(ty, a) if ty.data_type == DataType::Bool => {
                Some((a.eval_int(env)? != 0) as i64)
            }
            Expr::Broadcast(a, _) => a.eval_int(env),
            _ => None,
        }
    }

    /// Evaluates a scalar expression as `f64`, promoting integers.
    pub fn eval_f64(&self, env: &impl Fn(&Var) -> Option<i64>) -> Option<f64> {
        match self {
            Expr::Float(bits) => Some(f32::from_bits(*bits) as f64),
            Expr::Cast(ty, a) if ty.data_type.is_float() => a.eval_f64(env),
            Expr::Broadcast(a, _) => a.eval_f64(env),
            Expr::Binary(op, a, b) if self.ty().data_type.is_float() => {
                let (a, b) = (a.eval_f64(env)?, b.eval_f64(env)?);
                match op {
                    BinaryOp::Add => Some(a + b),
                    BinaryOp::Sub => Some(a - b),
                    BinaryOp::Mul => Some(a * b),
                    BinaryOp::Div => Some(a / b),
                    BinaryOp::Min => Some(a.min(b)),
                    BinaryOp::Max => Some(a.max(b)),
                    _ => None,
                }
            }
            _ => self.eval_int(env).map(|x| x as f64),
        }
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Self {
        Expr::Int(value)
    }
}

impl From<i32> for Expr {
    fn from(value: i32) -> Self {
        Expr::Int(value as i64)
    }
}

impl From<u32> for Expr {
    fn from(value: u32) -> Self {
        Expr::Int(value as i64)
    }
}

impl From<bool> for Expr {
    fn from(value: bool) -> Self {
        Expr::Bool(value)
    }
}

impl From<Var> for Expr {
    fn from(value: Var) -> Self {
        Expr::Var(value)
    }
}

impl From<&Var> for Expr {
    fn from(value: &Var) -> Self {
        Expr::Var(value.clone())
    }
}

macro_rules! impl_binary_operator {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<T: Into<Expr>> $trait<T> for Expr {
            type Output = Expr;

            fn $method(self, rhs: T) -> Expr {
                Expr::binary($op, self, rhs)
            }
        }

        impl<T: Into<Expr>> $trait<T> for &Var {
            type Output = Expr;

            fn $method(self, rhs: T) -> Expr {
                Expr::binary($op, self.expr(), rhs)
            }
        }
    };
}

impl_binary_operator!(Add, add, BinaryOp::Add);
impl_binary_operator!(Sub, sub, BinaryOp::Sub);
impl_binary_operator!(Mul, mul, BinaryOp::Mul);
impl_binary_operator!(Div, div, BinaryOp::Div);
impl_binary_operator!(Rem, rem, BinaryOp::Mod);
impl_binary_operator!(BitAnd, bitand, BinaryOp::And);
impl_binary_operator!(BitOr, bitor, BinaryOp::Or);

impl Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::Unary(UnaryOp::Neg, Box::new(self))
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Int(x) => write!(f, "{x}"),
            Expr::Float(bits) => write!(f, "{:?}f", f32::from_bits(*bits)),
            Expr::Bool(b) => write!(f, "{b}"),
            Expr::Var(v) => write!(f, "{v}"),
            Expr::Builtin(b) => write!(f, "{b}"),
            Expr::Iota(n) => write!(f, "iota({n})"),
            Expr::Unary(UnaryOp::Neg, a) => write!(f, "-{a}"),
            Expr::Unary(UnaryOp::Not, a) => write!(f, "!{a}"),
            Expr::Binary(op @ (BinaryOp::Min | BinaryOp::Max), a, b) => {
                write!(f, "{}({a}, {b})", op.symbol())
            }
            Expr::Binary(op, a, b) => write!(f, "({a} {} {b})", op.symbol()),
            Expr::Cast(ty, a) => write!(f, "cast<{ty}>({a})"),
            Expr::Broadcast(a, n) => write!(f, "bcast{n}({a})"),
            Expr::Load { ty, buf, off } => write!(f, "load<{ty}>({buf}[{off}])"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operators_build_trees() {
        let x = Var::s32("x");
        let e = &x * 2 - 1;
        assert_eq!(e.to_string(), "((x * 2) - 1)");
        assert_eq!(e.eval_int(&|v| (v == &x).then_some(5)), Some(9));
    }

    #[test]
    fn substitution_replaces_only_target() {
        let x = Var::s32("x");
        let y = Var::s32("y");
        let e = (&x + &y).substitute(&x, &Expr::Int(3));
        assert!(!e.contains_var(&x));
        assert!(e.contains_var(&y));
    }

    #[test]
    fn vector_types_propagate() {
        let e = Expr::float(1.0).broadcast(8) + Expr::float(2.0).broadcast(8);
        assert_eq!(e.ty(), Type::new(DataType::F32, 8));
        let cmp = Expr::Iota(8).lt(Expr::Int(4).broadcast(8));
        assert_eq!(cmp.ty(), Type::new(DataType::Bool, 8));
    }

    #[test]
    fn variables_are_unique() {
        assert_ne!(Var::s32("a"), Var::s32("a"));
    }
}
