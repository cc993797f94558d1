//! Memory message lowering and register store legalization.

use crate::{architecture::Architecture, ir_context::IrContext};
use ahash::AHashMap;
use argon_ir::{BinaryOp, Expr, Group, Send, Stmt, Store, Type};

/// Extracts lanes `off..off + n` of a vector expression. Scalars are
/// returned unchanged.
fn slice_lanes(e: &Expr, off: u32, n: u32) -> Expr {
    if e.ty().is_scalar() {
        return e.clone();
    }
    match e {
        Expr::Iota(_) if off == 0 => Expr::Iota(n),
        Expr::Iota(_) => Expr::Iota(n) + Expr::Int(off as i64).broadcast(n),
        Expr::Broadcast(a, _) => (**a).clone().broadcast(n),
        Expr::Unary(op, a) => Expr::Unary(*op, Box::new(slice_lanes(a, off, n))),
        Expr::Binary(op, a, b) => {
            Expr::binary(*op, slice_lanes(a, off, n), slice_lanes(b, off, n))
        }
        Expr::Cast(ty, a) => Expr::Cast(ty.with_elems(n), Box::new(slice_lanes(a, off, n))),
        Expr::Load { ty, buf, off: base } => Expr::Load {
            ty: ty.with_elems(n),
            buf: buf.clone(),
            off: base + off * ty.data_type.size(),
        },
        other => other.clone(),
    }
}

/// Splits `e` into a variable part and a constant byte offset.
fn split_const(e: &Expr) -> (Expr, i64) {
    match e {
        Expr::Int(c) => (Expr::Int(0), *c),
        Expr::Binary(BinaryOp::Add, a, b) => {
            let (a_base, a_c) = split_const(a);
            let (b_base, b_c) = split_const(b);
            let base = match (a_base.as_int(), b_base.as_int()) {
                (Some(0), _) => b_base,
                (_, Some(0)) => a_base,
                _ => a_base + b_base,
            };
            (base, a_c + b_c)
        }
        Expr::Binary(BinaryOp::Sub, a, b) if b.as_int().is_some() => {
            let (base, c) = split_const(a);
            (base, c - b.as_int().unwrap_or(0))
        }
        Expr::Binary(BinaryOp::Mul, a, b) if b.as_int().is_some() => {
            let k = b.as_int().unwrap_or(1);
            let (base, c) = split_const(a);
            let base = if base.as_int() == Some(0) {
                base
            } else {
                base * k
            };
            (base, c * k)
        }
        other => (other.clone(), 0),
    }
}

/// Hoists the variable part of send offsets shared by several messages
/// of the same statement list into a `Let`, leaving each message with
/// `base + constant`.
pub fn lift_buffer_offsets_in_send(stmt: Stmt, ctx: &mut IrContext) -> Stmt {
    stmt.map(&mut |s| match s {
        Stmt::Group(g) => lift_in_group(g, ctx),
        other => other,
    })
}

fn lift_in_group(mut g: Group, ctx: &mut IrContext) -> Stmt {
    let mut uses: AHashMap<Expr, usize> = AHashMap::new();
    for item in &g.body {
        if let Stmt::Send(send) = item {
            let (base, _) = split_const(&send.mem_off);
            if base.node_count() > 1 {
                *uses.entry(base).or_insert(0) += 1;
            }
        }
    }

    let mut lets = Vec::new();
    let mut lifted: AHashMap<Expr, Expr> = AHashMap::new();
    for item in &mut g.body {
        let Stmt::Send(send) = item else { continue };
        let (base, c) = split_const(&send.mem_off);
        if uses.get(&base).copied().unwrap_or(0) < 2 {
            continue;
        }
        let var = lifted
            .entry(base.clone())
            .or_insert_with(|| {
                let var = ctx.create_tmp_var(Type::s32(), "off");
                lets.push((var.clone(), base));
                var.expr()
            })
            .clone();
        send.mem_off = if c == 0 { var } else { var + c };
    }

    lets.into_iter()
        .rev()
        .fold(Stmt::Group(g), |body, (var, value)| Stmt::let_(var, value, body))
}

/// Lowers abstract messages into hardware-sized ones. Contiguous
/// messages with a uniform predicate become block messages of at most
/// four registers; the rest become scattered messages of at most 16
/// lanes (32 on wide-register hardware).
pub fn inject_send(stmt: Stmt, ctx: &IrContext) -> Stmt {
    let arch = ctx.exec().arch();
    stmt.map(&mut |s| match s {
        Stmt::Send(send) if !send.lowered => lower_send(send, arch),
        other => other,
    })
}

fn lower_send(send: Send, arch: Architecture) -> Stmt {
    let elem_size = send.data_type.size();
    let uniform_mask = send.mask.as_ref().is_none_or(|m| m.ty().is_scalar());
    let max_elems = if send.is_block() && uniform_mask {
        (arch.max_block_message_bytes() / elem_size).max(1)
    } else {
        arch.max_scattered_elems()
    };

    let pieces = (0..send.elems).step_by(max_elems as usize).map(|lane0| {
        let n = max_elems.min(send.elems - lane0);
        let mem_delta = lane0 as i64 * send.mem_stride * elem_size as i64;
        Stmt::Send(Send {
            mem_off: if mem_delta == 0 {
                send.mem_off.clone()
            } else {
                send.mem_off.clone() + mem_delta
            },
            reg_off: send.reg_off + lane0 * elem_size,
            elems: n,
            mask: send.mask.as_ref().map(|m| slice_lanes(m, lane0, n)),
            lowered: true,
            ..send.clone()
        })
    });
    Stmt::seq(pieces.collect::<Vec<_>>())
}

/// Splits register stores wider than two registers.
pub fn split_wide_stores(stmt: Stmt, ctx: &IrContext) -> Stmt {
    let max_bytes = ctx.exec().arch().max_store_bytes();
    stmt.map(&mut |s| match s {
        Stmt::Store(store) if store.value.ty().size() > max_bytes => {
            split_store(store, max_bytes)
        }
        other => other,
    })
}

fn split_store(store: Store, max_bytes: u32) -> Stmt {
    let ty = store.value.ty();
    let scalar_size = ty.data_type.size();
    let per_piece = (max_bytes / scalar_size).max(1);
    let pieces = (0..ty.elems).step_by(per_piece as usize).map(|lane0| {
        let n = per_piece.min(ty.elems - lane0);
        Stmt::Store(Store {
            buf: store.buf.clone(),
            off: store.off + lane0 * scalar_size,
            value: slice_lanes(&store.value, lane0, n),
            mask: store.mask.as_ref().map(|m| slice_lanes(m, lane0, n)),
        })
    });
    Stmt::seq(pieces.collect::<Vec<_>>())
}
