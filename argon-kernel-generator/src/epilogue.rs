//! Epilogue: converts the accumulator, applies post-ops and stores
//! the destination tile.

use crate::{
    access::{build_access, reg_layout_for, simd_tile},
    error::Result,
    ir_context::IrContext,
    view::PostOpViewMapper,
};
use argon_ir::{DataType, Expr, Layout, MemoryDesc, SendOp, Stmt, Type, Var};

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum EltwiseAlg {
    /// `max(x, 0) + alpha * min(x, 0)`
    Relu { alpha: f32 },
    /// `alpha * x + beta`
    Linear { alpha: f32, beta: f32 },
    Clip { lo: f32, hi: f32 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BinaryAlg {
    Add,
    Mul,
    Max,
    Min,
}

/// Operation fused after the pooling reduction, applied in f32.
#[derive(Clone, Debug, PartialEq)]
pub enum PostOp {
    Eltwise(EltwiseAlg),
    /// Elementwise binary op with a tensor operand, broadcast along its
    /// unit dims. `src` is given in the operation's original rank.
    Binary { alg: BinaryAlg, src: MemoryDesc },
    /// Multiplication by an f32 operand spanning the dims in `mask`
    /// (bit `i` for original dim `i`), e.g. `0b10` for per-channel.
    Scale { mask: u32 },
}

impl PostOp {
    /// Whether the post-op reads a kernel argument.
    pub fn has_operand(&self) -> bool {
        !matches!(self, PostOp::Eltwise(_))
    }
}

/// Inputs of an epilogue build.
pub struct EpilogueContext<'a> {
    pub ir_ctx: &'a mut IrContext,
    pub view_mapper: PostOpViewMapper<'a>,
    /// Origin and extents of the thread's destination tile.
    pub tile_starts: &'a [Expr],
    pub tile_extents: &'a [i64],
    /// Register layout of the accumulator over the destination tile.
    pub acc_layout: &'a Layout,
    pub acc_buf: &'a Var,
    pub dst_buf: &'a Var,
    /// Kernel arguments of post-ops with operands, in post-op order.
    pub post_op_args: &'a [Var],
}

/// Epilogue statements plus the register buffers they need.
#[derive(Debug)]
pub struct EpilogueOutput {
    pub stmt: Stmt,
    pub allocs: Vec<(Var, u32)>,
}

pub trait Epilogue {
    fn build(&self, ctx: EpilogueContext<'_>, post_ops: &[PostOp]) -> Result<EpilogueOutput>;
}

/// Default epilogue: accumulator to f32, post-ops, conversion to the
/// destination type, masked store.
#[derive(Copy, Clone, Debug, Default)]
pub struct PostOpEpilogue;

struct Operand {
    buf: Var,
    layout: Layout,
}

impl Epilogue for PostOpEpilogue {
    fn build(&self, ctx: EpilogueContext<'_>, post_ops: &[PostOp]) -> Result<EpilogueOutput> {
        let EpilogueContext {
            ir_ctx,
            view_mapper,
            tile_starts,
            tile_extents,
            acc_layout,
            acc_buf,
            dst_buf,
            post_op_args,
        } = ctx;
        let simd = ir_ctx.exec().simd();
        let grf = ir_ctx.exec().grf_size();
        let dst_view = view_mapper
            .cp_view()
            .create_sub_view(tile_starts, tile_extents);

        let mut stmt = Stmt::empty();
        let mut allocs = Vec::new();
        let mut operands = Vec::new();
        for (post_op, arg) in post_ops
            .iter()
            .filter(|p| p.has_operand())
            .zip(post_op_args)
        {
            let view = match post_op {
                PostOp::Binary { src, .. } => view_mapper.create_view(src)?,
                PostOp::Scale { mask } => view_mapper.create_mask_view(Type::f32(), *mask),
                PostOp::Eltwise(_) => unreachable!("eltwise post-ops have no operand"),
            };
            let view = view.create_sub_view(tile_starts, tile_extents);
            let buf = ir_ctx.create_tmp_var(Type::byte_ptr(), "po");
            let access = build_access(ir_ctx, SendOp::Load, &view, arg, &buf)?;
            allocs.push((buf.clone(), access.reg_buf_size()));
            operands.push(Operand {
                buf,
                layout: access.reg_layout().clone(),
            });
            stmt = stmt.append(access.into_stmt());
        }

        let dst_type = dst_view.tlayout().data_type();
        let c_buf = ir_ctx.create_tmp_var(Type::byte_ptr(), "c");
        let c_layout = reg_layout_for(&dst_view, dst_type);
        let acc_type = Type::new(acc_layout.data_type(), simd);
        let f32_vec = Type::new(DataType::F32, simd);

        let mut converts = Vec::new();
        acc_layout.for_each_tile(&simd_tile(acc_layout.ndims(), simd as i64), |start| {
            let acc_off = acc_layout.offset_of(start) as u32 * acc_type.data_type.size();
            let mut value = Expr::load(acc_type, acc_buf, acc_off).cast(f32_vec);
            let mut operand_iter = operands.iter();
            for post_op in post_ops {
                value = match post_op {
                    PostOp::Eltwise(alg) => apply_eltwise(ir_ctx, *alg, value, simd),
                    PostOp::Binary { alg, .. } => {
                        let rhs = operand_iter.next().map(|op| load_operand(op, start, simd));
                        match rhs {
                            Some(rhs) => apply_binary(*alg, value, rhs),
                            None => value,
                        }
                    }
                    PostOp::Scale { .. } => match operand_iter.next() {
                        Some(op) => value * load_operand(op, start, simd),
                        None => value,
                    },
                };
            }
            let c_off = c_layout.offset_of(start) as u32 * dst_type.size();
            converts.push(Stmt::store(&c_buf, c_off, convert(value, dst_type, simd)));
        });
        stmt = stmt.append(Stmt::seq(converts));

        let store = build_access(ir_ctx, SendOp::Store, &dst_view, dst_buf, &c_buf)?;
        stmt = stmt.append(store.into_stmt());
        let c_size = (c_layout.elems() as u32 * dst_type.size()).div_ceil(grf) * grf;
        allocs.push((c_buf, c_size));

        Ok(EpilogueOutput { stmt, allocs })
    }
}

/// Converts an f32 vector to the destination type. Integer
/// destinations saturate at the type's range.
pub(crate) fn convert(value: Expr, dst_type: DataType, simd: u32) -> Expr {
    let value = match (dst_type.int_min(), dst_type.int_max()) {
        (Some(lo), Some(hi)) => {
            // Largest f32 not above `hi`; s32 max itself rounds up.
            let mut upper = hi as f32;
            if upper as f64 > hi as f64 {
                upper = f32::from_bits(upper.to_bits() - 1);
            }
            value
                .max(Expr::float(lo as f32).broadcast(simd))
                .min(Expr::float(upper).broadcast(simd))
        }
        _ => value,
    };
    value.cast(Type::new(dst_type, simd))
}

fn load_operand(operand: &Operand, start: &[i64], simd: u32) -> Expr {
    let data_type = operand.layout.data_type();
    let off = operand.layout.offset_of(start) as u32 * data_type.size();
    Expr::load(Type::new(data_type, simd), &operand.buf, off).cast(Type::new(DataType::F32, simd))
}

fn scalar(ir_ctx: &mut IrContext, name: &str, value: f32, simd: u32) -> Expr {
    ir_ctx
        .external_var(name, Expr::float(value))
        .expr()
        .broadcast(simd)
}

pub(crate) fn apply_eltwise(ir_ctx: &mut IrContext, alg: EltwiseAlg, x: Expr, simd: u32) -> Expr {
    let zero = Expr::float(0.0).broadcast(simd);
    match alg {
        EltwiseAlg::Relu { alpha } if alpha == 0.0 => x.max(zero),
        EltwiseAlg::Relu { alpha } => {
            let alpha = scalar(ir_ctx, "relu_alpha", alpha, simd);
            x.clone().max(zero.clone()) + alpha * x.min(zero)
        }
        EltwiseAlg::Linear { alpha, beta } => {
            let alpha = scalar(ir_ctx, "linear_alpha", alpha, simd);
            let beta = scalar(ir_ctx, "linear_beta", beta, simd);
            alpha * x + beta
        }
        EltwiseAlg::Clip { lo, hi } => {
            let lo = scalar(ir_ctx, "clip_lo", lo, simd);
            let hi = scalar(ir_ctx, "clip_hi", hi, simd);
            x.max(lo).min(hi)
        }
    }
}

fn apply_binary(alg: BinaryAlg, x: Expr, y: Expr) -> Expr {
    match alg {
        BinaryAlg::Add => x + y,
        BinaryAlg::Mul => x * y,
        BinaryAlg::Max => x.max(y),
        BinaryAlg::Min => x.min(y),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{architecture::Architecture, config::ExecConfig};
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn eval(ctx: &IrContext, e: Expr) -> f64 {
        let e = ctx
            .external_vars()
            .fold(e, |e, (var, value)| e.substitute(var, value));
        e.eval_f64(&|_| None).unwrap()
    }

    #[rstest]
    #[case(EltwiseAlg::Relu { alpha: 0.0 }, -2.0, 0.0)]
    #[case(EltwiseAlg::Relu { alpha: 0.1 }, -2.0, -0.2)]
    #[case(EltwiseAlg::Relu { alpha: 0.1 }, 3.0, 3.0)]
    #[case(EltwiseAlg::Linear { alpha: 2.0, beta: 1.0 }, 1.5, 4.0)]
    #[case(EltwiseAlg::Clip { lo: -1.0, hi: 1.0 }, 7.0, 1.0)]
    #[case(EltwiseAlg::Clip { lo: -1.0, hi: 1.0 }, -0.25, -0.25)]
    fn eltwise(#[case] alg: EltwiseAlg, #[case] x: f32, #[case] expected: f64) {
        let exec = ExecConfig::new(Architecture::XeHp, 8, false).unwrap();
        let mut ctx = IrContext::new(exec);
        let e = apply_eltwise(&mut ctx, alg, Expr::float(x).broadcast(8), 8);
        assert_relative_eq!(eval(&ctx, e), expected, epsilon = 1e-6);
    }

    #[rstest]
    #[case(DataType::U8, 300.0, 255.0)]
    #[case(DataType::U8, -4.0, 0.0)]
    #[case(DataType::S8, -200.0, -128.0)]
    #[case(DataType::S8, 77.0, 77.0)]
    #[case(DataType::S32, 1.0e10, 2_147_483_520.0)]
    fn integer_destination_saturates(#[case] dt: DataType, #[case] x: f32, #[case] expected: f64) {
        let converted = convert(Expr::float(x).broadcast(8), dt, 8);
        let Expr::Cast(ty, clamped) = &converted else {
            panic!("expected conversion, got {converted:?}");
        };
        assert_eq!(*ty, Type::new(dt, 8));
        assert_eq!(clamped.eval_f64(&|_| None), Some(expected));
    }

    #[test]
    fn float_destination_is_not_clamped() {
        let x = Expr::float(1.0e10).broadcast(8);
        assert_eq!(convert(x.clone(), DataType::F32, 8), x);
        assert_eq!(
            convert(x.clone(), DataType::F16, 8),
            x.cast(Type::new(DataType::F16, 8))
        );
    }

    #[test]
    fn binary_ops() {
        let (a, b) = (Expr::float(2.0), Expr::float(-3.0));
        let values: Vec<f64> = [BinaryAlg::Add, BinaryAlg::Mul, BinaryAlg::Max, BinaryAlg::Min]
            .into_iter()
            .map(|alg| {
                apply_binary(alg, a.clone(), b.clone())
                    .eval_f64(&|_| None)
                    .unwrap()
            })
            .collect();
        assert_eq!(values, vec![-1.0, -6.0, 2.0, -3.0]);
    }
}
