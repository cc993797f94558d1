//! Memory access builder: moves a thread's view tile between global
//! memory and a register buffer using abstract send messages.

use crate::{
    error::{Error, Result},
    ir_context::IrContext,
    view::View,
};
use argon_ir::{DataType, Expr, Layout, Send, SendOp, Stmt, Var};
use gcd::Gcd;

/// Channel (the vectorized dimension) in canonical order.
const VECTOR_DIM: usize = 1;

/// Result of building an access: the send statements, the register
/// layout of the tile and the register bytes it needs.
#[derive(Debug, Clone)]
pub struct Access {
    stmt: Stmt,
    reg_layout: Layout,
    reg_buf_size: u32,
}

impl Access {
    pub fn stmt(&self) -> &Stmt {
        &self.stmt
    }

    pub fn into_stmt(self) -> Stmt {
        self.stmt
    }

    pub fn reg_layout(&self) -> &Layout {
        &self.reg_layout
    }

    pub fn reg_buf_size(&self) -> u32 {
        self.reg_buf_size
    }
}

/// Dense register layout over the view's tile with the vector dim
/// innermost and the remaining dims last-fastest.
pub fn reg_layout_for(view: &View, data_type: DataType) -> Layout {
    let n = view.nvdims();
    let order: Vec<usize> = std::iter::once(VECTOR_DIM)
        .chain((0..n).rev().filter(|&d| d != VECTOR_DIM))
        .collect();
    Layout::dense(data_type, view.vdims(), &order)
}

/// Tile of one SIMD vector along the vector dim.
pub fn simd_tile(ndims: usize, simd: i64) -> Vec<i64> {
    let mut tile = vec![1; ndims];
    tile[VECTOR_DIM] = simd;
    tile
}

/// Builds loads (or stores) of `view` between `mem_buf` and `reg_buf`.
///
/// Every SIMD-wide run along the channel dim becomes one message, or
/// several when the memory layout's channel blocks are narrower than
/// the SIMD width.
pub fn build_access(
    ctx: &IrContext,
    op: SendOp,
    view: &View,
    mem_buf: &Var,
    reg_buf: &Var,
) -> Result<Access> {
    let simd = ctx.exec().simd() as i64;
    let data_type = view.tlayout().data_type();
    let elem_size = data_type.size();
    if view.vdims()[VECTOR_DIM] % simd != 0 {
        return Err(Error::TileMismatch {
            expected: simd,
            found: view.vdims()[VECTOR_DIM],
        });
    }

    let broadcast_channels = view.tdims()[VECTOR_DIM].expr == Expr::Int(0);
    let mem_stride = if broadcast_channels {
        0
    } else {
        view.tlayout().inner_stride(VECTOR_DIM)
    };
    let chunk = if broadcast_channels {
        simd
    } else {
        channel_run(view.tlayout(), simd)
    };

    let reg_layout = reg_layout_for(view, data_type);
    let mut sends = Vec::new();
    reg_layout.for_each_tile(&simd_tile(view.nvdims(), simd), |start| {
        let reg_base = reg_layout.offset_of(start) as u32 * elem_size;
        for lane0 in (0..simd).step_by(chunk as usize) {
            let mut coords: Vec<Expr> = start.iter().map(|&c| Expr::Int(c)).collect();
            coords[VECTOR_DIM] = Expr::Int(start[VECTOR_DIM] + lane0);
            let mem_off = view.offset_at(&coords) * elem_size;

            let mut lane_coords = coords.clone();
            lane_coords[VECTOR_DIM] =
                Expr::Int(start[VECTOR_DIM] + lane0).broadcast(chunk as u32)
                    + Expr::Iota(chunk as u32);
            let mask = view.mask_at(&lane_coords);

            sends.push(Stmt::Send(Send {
                op,
                mem_buf: mem_buf.clone(),
                mem_off,
                mem_stride,
                reg_buf: reg_buf.clone(),
                reg_off: reg_base + lane0 as u32 * elem_size,
                data_type,
                elems: chunk as u32,
                mask,
                lowered: false,
            }));
        }
    });

    let grf = ctx.exec().grf_size();
    let bytes = reg_layout.elems() as u32 * elem_size;
    Ok(Access {
        stmt: Stmt::seq(sends),
        reg_layout,
        reg_buf_size: bytes.div_ceil(grf) * grf,
    })
}

/// Number of consecutive channel lanes that share one memory stride.
fn channel_run(layout: &Layout, simd: i64) -> i64 {
    let mut channel_blocks = layout
        .blocks()
        .iter()
        .filter(|b| b.dim == VECTOR_DIM && b.size > 1);
    match (channel_blocks.next(), channel_blocks.next()) {
        (Some(inner), Some(_)) => (inner.size as u64).gcd(simd as u64) as i64,
        _ => simd,
    }
}
