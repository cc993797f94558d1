use crate::{
    data_type::DataType,
    expr::{Expr, Var},
};
use std::fmt::{Display, Formatter, Write};

/// Program statement. The set of node kinds is closed:
/// every pass matches exhaustively on it.
#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Alloc(Alloc),
    Send(Send),
    Store(Store),
    For(For),
    If(If),
    Let(Let),
    Group(Group),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AllocKind {
    /// Register file.
    Grf,
    /// Global memory kernel argument.
    Global,
}

/// Allocation of a buffer scoped to `body`.
#[derive(Clone, Debug, PartialEq)]
pub struct Alloc {
    pub buf: Var,
    pub size: u32,
    pub kind: AllocKind,
    pub body: Box<Stmt>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SendOp {
    Load,
    Store,
}

/// Memory message moving `elems` elements between global memory
/// and a register buffer.
///
/// Lane `i` accesses `mem_buf + mem_off + i * mem_stride * size(data_type)`.
/// A message is abstract until the lowering pass splits it into
/// hardware-supported widths and marks it `lowered`.
#[derive(Clone, Debug, PartialEq)]
pub struct Send {
    pub op: SendOp,
    pub mem_buf: Var,
    /// Byte offset into `mem_buf`.
    pub mem_off: Expr,
    /// Element stride between consecutive lanes in memory.
    pub mem_stride: i64,
    pub reg_buf: Var,
    /// Byte offset into `reg_buf`.
    pub reg_off: u32,
    pub data_type: DataType,
    pub elems: u32,
    /// Per-lane predicate; masked-off lanes neither read nor write
    /// memory, and loads leave their register contents untouched.
    pub mask: Option<Expr>,
    pub lowered: bool,
}

impl Send {
    pub fn is_block(&self) -> bool {
        self.mem_stride == 1
    }

    pub fn size(&self) -> u32 {
        self.data_type.size() * self.elems
    }
}

/// Register store of `value` at a constant byte offset.
#[derive(Clone, Debug, PartialEq)]
pub struct Store {
    pub buf: Var,
    pub off: u32,
    pub value: Expr,
    pub mask: Option<Expr>,
}

/// Sequential loop `for var in init..bound`.
#[derive(Clone, Debug, PartialEq)]
pub struct For {
    pub var: Var,
    pub init: Expr,
    pub bound: Expr,
    pub body: Box<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct If {
    pub cond: Expr,
    pub then_body: Box<Stmt>,
    pub else_body: Option<Box<Stmt>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Let {
    pub var: Var,
    pub value: Expr,
    pub body: Box<Stmt>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Label {
    None,
    Kernel,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Group {
    pub label: Label,
    pub body: Vec<Stmt>,
}

impl Stmt {
    pub fn empty() -> Self {
        Stmt::Group(Group {
            label: Label::None,
            body: Vec::new(),
        })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Stmt::Group(Group { body, .. }) if body.iter().all(Stmt::is_empty))
    }

    pub fn seq(stmts: impl IntoIterator<Item = Stmt>) -> Self {
        stmts.into_iter().fold(Stmt::empty(), Stmt::append)
    }

    /// Sequences `other` after `self`, flattening unlabeled groups.
    #[must_use]
    pub fn append(self, other: Stmt) -> Stmt {
        fn into_items(stmt: Stmt) -> Vec<Stmt> {
            match stmt {
                Stmt::Group(Group {
                    label: Label::None,
                    body,
                }) => body,
                other => vec![other],
            }
        }
        let mut body = into_items(self);
        body.extend(into_items(other));
        if body.len() == 1 {
            body.remove(0)
        } else {
            Stmt::Group(Group {
                label: Label::None,
                body,
            })
        }
    }

    pub fn alloc(buf: Var, size: u32, kind: AllocKind, body: Stmt) -> Self {
        Stmt::Alloc(Alloc {
            buf,
            size,
            kind,
            body: Box::new(body),
        })
    }

    pub fn let_(var: Var, value: Expr, body: Stmt) -> Self {
        Stmt::Let(Let {
            var,
            value,
            body: Box::new(body),
        })
    }

    pub fn for_(var: Var, init: impl Into<Expr>, bound: impl Into<Expr>, body: Stmt) -> Self {
        Stmt::For(For {
            var,
            init: init.into(),
            bound: bound.into(),
            body: Box::new(body),
        })
    }

    pub fn if_(cond: Expr, then_body: Stmt, else_body: Option<Stmt>) -> Self {
        Stmt::If(If {
            cond,
            then_body: Box::new(then_body),
            else_body: else_body.map(Box::new),
        })
    }

    pub fn store(buf: &Var, off: u32, value: Expr) -> Self {
        Stmt::Store(Store {
            buf: buf.clone(),
            off,
            value,
            mask: None,
        })
    }

    pub fn group(label: Label, body: Stmt) -> Self {
        Stmt::Group(Group {
            label,
            body: vec![body],
        })
    }

    /// Expressions held directly by this node (not by children).
    pub fn exprs(&self) -> Vec<&Expr> {
        match self {
            Stmt::Alloc(_) | Stmt::Group(_) => vec![],
            Stmt::Send(s) => std::iter::once(&s.mem_off).chain(s.mask.as_ref()).collect(),
            Stmt::Store(s) => std::iter::once(&s.value).chain(s.mask.as_ref()).collect(),
            Stmt::For(s) => vec![&s.init, &s.bound],
            Stmt::If(s) => vec![&s.cond],
            Stmt::Let(s) => vec![&s.value],
        }
    }

    pub fn children(&self) -> Vec<&Stmt> {
        match self {
            Stmt::Alloc(s) => vec![&s.body],
            Stmt::Send(_) | Stmt::Store(_) => vec![],
            Stmt::For(s) => vec![&s.body],
            Stmt::If(s) => std::iter::once(&*s.then_body)
                .chain(s.else_body.as_deref())
                .collect(),
            Stmt::Let(s) => vec![&s.body],
            Stmt::Group(g) => g.body.iter().collect(),
        }
    }

    /// Visits every statement, parents first.
    pub fn walk(&self, f: &mut impl FnMut(&Stmt)) {
        f(self);
        for child in self.children() {
            child.walk(f);
        }
    }

    /// Rebuilds the tree bottom-up, applying `f` to each node after
    /// its children have been rewritten.
    pub fn map(self, f: &mut impl FnMut(Stmt) -> Stmt) -> Stmt {
        let rebuilt = match self {
            Stmt::Alloc(mut s) => {
                s.body = Box::new(s.body.map(f));
                Stmt::Alloc(s)
            }
            Stmt::For(mut s) => {
                s.body = Box::new(s.body.map(f));
                Stmt::For(s)
            }
            Stmt::If(mut s) => {
                s.then_body = Box::new(s.then_body.map(f));
                s.else_body = s.else_body.map(|b| Box::new(b.map(f)));
                Stmt::If(s)
            }
            Stmt::Let(mut s) => {
                s.body = Box::new(s.body.map(f));
                Stmt::Let(s)
            }
            Stmt::Group(mut g) => {
                g.body = g.body.into_iter().map(|s| s.map(f)).collect();
                Stmt::Group(g)
            }
            leaf => leaf,
        };
        f(rebuilt)
    }

    /// Rewrites every expression in the tree with `f`.
    pub fn map_exprs(self, f: &mut impl FnMut(Expr) -> Expr) -> Stmt {
        self.map(&mut |stmt| match stmt {
            Stmt::Send(mut s) => {
                s.mem_off = f(s.mem_off);
                s.mask = s.mask.map(&mut *f);
                Stmt::Send(s)
            }
            Stmt::Store(mut s) => {
                s.value = f(s.value);
                s.mask = s.mask.map(&mut *f);
                Stmt::Store(s)
            }
            Stmt::For(mut s) => {
                s.init = f(s.init);
                s.bound = f(s.bound);
                Stmt::For(s)
            }
            Stmt::If(mut s) => {
                s.cond = f(s.cond);
                Stmt::If(s)
            }
            Stmt::Let(mut s) => {
                s.value = f(s.value);
                Stmt::Let(s)
            }
            other => other,
        })
    }

    /// Whether `var` is referenced anywhere in the tree, either in an
    /// expression or as a buffer operand.
    pub fn uses_var(&self, var: &Var) -> bool {
        let mut found = false;
        self.walk(&mut |stmt| {
            if found {
                return;
            }
            found = stmt.exprs().iter().any(|e| e.contains_var(var))
                || match stmt {
                    Stmt::Send(s) => &s.mem_buf == var || &s.reg_buf == var,
                    Stmt::Store(s) => &s.buf == var,
                    _ => false,
                };
        });
        found
    }

    pub fn count(&self, pred: impl Fn(&Stmt) -> bool) -> usize {
        let mut n = 0;
        self.walk(&mut |s| {
            if pred(s) {
                n += 1;
            }
        });
        n
    }

    fn write_indented(&self, out: &mut String, depth: usize) -> std::fmt::Result {
        let pad = "  ".repeat(depth);
        match self {
            Stmt::Alloc(s) => {
                let kind = match s.kind {
                    AllocKind::Grf => "grf",
                    AllocKind::Global => "global",
                };
                writeln!(out, "{pad}alloc {}[{}] ({kind})", s.buf, s.size)?;
                s.body.write_indented(out, depth)
            }
            Stmt::Send(s) => {
                let op = match s.op {
                    SendOp::Load => "load",
                    SendOp::Store => "store",
                };
                let stage = if s.lowered { "send" } else { "access" };
                write!(
                    out,
                    "{pad}{stage}.{op}.{}x{} {}[{}] <-> {}[{}] stride {}",
                    s.data_type, s.elems, s.mem_buf, s.mem_off, s.reg_buf, s.reg_off, s.mem_stride
                )?;
                if let Some(mask) = &s.mask {
                    write!(out, " mask {mask}")?;
                }
                writeln!(out)
            }
            Stmt::Store(s) => {
                write!(out, "{pad}{}[{}] = {}", s.buf, s.off, s.value)?;
                if let Some(mask) = &s.mask {
                    write!(out, " mask {mask}")?;
                }
                writeln!(out)
            }
            Stmt::For(s) => {
                writeln!(out, "{pad}for {} in {}..{} {{", s.var, s.init, s.bound)?;
                s.body.write_indented(out, depth + 1)?;
                writeln!(out, "{pad}}}")
            }
            Stmt::If(s) => {
                writeln!(out, "{pad}if {} {{", s.cond)?;
                s.then_body.write_indented(out, depth + 1)?;
                if let Some(else_body) = &s.else_body {
                    writeln!(out, "{pad}}} else {{")?;
                    else_body.write_indented(out, depth + 1)?;
                }
                writeln!(out, "{pad}}}")
            }
            Stmt::Let(s) => {
                writeln!(out, "{pad}{}.{} = {}", s.var, s.var.ty(), s.value)?;
                s.body.write_indented(out, depth)
            }
            Stmt::Group(g) => {
                let depth = match g.label {
                    Label::None => depth,
                    Label::Kernel => {
                        writeln!(out, "{pad}kernel {{")?;
                        depth + 1
                    }
                };
                for stmt in &g.body {
                    stmt.write_indented(out, depth)?;
                }
                if g.label == Label::Kernel {
                    writeln!(out, "{pad}}}")?;
                }
                Ok(())
            }
        }
    }
}

impl Display for Stmt {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        self.write_indented(&mut s, 0)?;
        f.write_str(&s)
    }
}
