//! A single build attempt: views, schedule, accumulation, epilogue,
//! guards and the lowering pipeline.

use super::{KernelArgs, grid::build_schedule};
use crate::{
    access::{build_access, simd_tile},
    config::{Direction, PoolAlg, PoolConfig},
    epilogue::{Epilogue, EpilogueContext},
    error::Result,
    ir_context::IrContext,
    passes::{self, BufferAlloc},
    trace::TraceSink,
    view::{PostOpViewMapper, View, placeholder_var},
};
use argon_ir::{DataType, Expr, Layout, SendOp, Stmt, Type, Var};
use itertools::Itertools;

/// Outcome of one attempt. A rejected body needs more registers than
/// the thread has.
#[derive(Debug)]
pub(super) enum Attempt {
    Accepted { body: Stmt, regs: u32 },
    Rejected { regs: u32 },
}

/// Source view over `mb, oc, od, oh, ow, kd, kh, kw` and destination
/// view over `mb, oc, od, oh, ow`, sharing variables.
pub(super) fn pooling_views(config: &PoolConfig) -> Result<(View, View)> {
    let problem = &config.problem;
    let dims = config.dims_padded;
    let vars = ["mb", "oc", "od", "oh", "ow", "kd", "kh", "kw"]
        .iter()
        .map(Var::s32)
        .collect_vec();
    let x = placeholder_var().expr();

    let mut src = View::new(vars.clone(), problem.src.layout.clone());
    for (i, var) in vars.iter().enumerate() {
        let extent = match i {
            0..5 => dims[i],
            _ => problem.spatial[i - 5].kernel,
        };
        src.set_vdim(var, extent)?;
    }
    src.set_tdim(0, vars[0].expr(), None);
    src.set_tdim(1, vars[1].expr(), None);
    for (i, w) in problem.spatial.iter().enumerate() {
        let coord =
            vars[2 + i].expr() * w.stride - w.padding + vars[5 + i].expr() * (w.dilation + 1);
        let mask = w
            .needs_bound_check(Direction::Forward)
            .then(|| x.clone().ge(0) & x.clone().lt(w.input));
        src.set_tdim(2 + i, coord, mask);
    }
    let src_dims = src.tlayout().dims();
    src.set_tmasks(&src_dims);

    let mut dst = View::new(vars[..5].to_vec(), problem.dst.layout.clone());
    for (i, var) in vars[..5].iter().enumerate() {
        dst.set_vdim(var, dims[i])?;
        dst.set_tdim(i, var.expr(), None);
    }
    let dst_dims = dst.tlayout().dims();
    dst.set_tmasks(&dst_dims);
    Ok((src, dst))
}

fn accumulator_type(alg: PoolAlg, read: DataType) -> DataType {
    if read.is_int() {
        DataType::S32
    } else if alg.is_max() {
        read
    } else {
        DataType::F32
    }
}

/// Value every position of the read tile takes before the masked load,
/// so masked-off taps do not change the reduction. Integer sources are
/// filled with packed 32-bit words.
fn read_fill_value(alg: PoolAlg, read: DataType, simd: u32) -> Expr {
    if read.is_float() {
        let init = if alg.is_max() { f32::NEG_INFINITY } else { 0.0 };
        return Expr::float(init)
            .broadcast(simd)
            .cast(Type::new(read, simd));
    }
    let per_word = (4 / read.size()).max(1);
    let pattern: u32 = match (alg.is_max() && read.is_signed(), per_word) {
        (true, 1) => 0x8000_0000,
        (true, 2) => 0x8000_8000,
        (true, _) => 0x8080_8080,
        (false, _) => 0,
    };
    Expr::Int(pattern as i32 as i64).broadcast(simd / per_word)
}

fn accumulator_init(alg: PoolAlg, read: DataType, acc: DataType, simd: u32) -> Expr {
    if read.is_int() {
        let init = if alg.is_max() && read.is_signed() {
            i32::MIN as i64
        } else {
            0
        };
        return Expr::Int(init).broadcast(simd);
    }
    let init = if alg.is_max() { f32::NEG_INFINITY } else { 0.0 };
    Expr::float(init).broadcast(simd).cast(Type::new(acc, simd))
}

/// Number of in-bounds taps along one axis for the window starting at
/// output coordinate `o`.
fn clamped_extent(o: &Expr, stride: i64, padding: i64, kernel: i64, input: i64) -> Expr {
    if kernel <= 1 {
        return Expr::Int(1);
    }
    let start = o.clone() * stride - padding;
    (start.clone() + kernel).min(input) - start.max(0)
}

/// Builds one attempt for `config`.
pub(super) fn try_build(
    config: &PoolConfig,
    args: &KernelArgs,
    epilogue: &dyn Epilogue,
    trace: &dyn TraceSink,
) -> Result<Attempt> {
    let problem = &config.problem;
    let exec = config.exec;
    let simd = exec.simd();
    let check_idhw = problem.needs_src_check();

    let (src_view, dst_view) = pooling_views(config)?;
    let schedule = build_schedule(config, &src_view, &dst_view)?;
    let (src_starts, src_extents) = schedule.thread_tile(&src_view)?;
    let src_thr_view = src_view.create_sub_view(&src_starts, &src_extents);
    let (dst_starts, dst_extents) = schedule.thread_tile(&dst_view)?;
    let dst_thr_view = dst_view.create_sub_view(&dst_starts, &dst_extents);

    let mut ctx = IrContext::new(exec);
    let mut allocs: Vec<BufferAlloc> = args.iter().cloned().map(BufferAlloc::global).collect();

    let read_buf = ctx.create_tmp_var(Type::byte_ptr(), "read");
    let read = build_access(&ctx, SendOp::Load, &src_thr_view, &args.src, &read_buf)?;
    // Only used to zero the destination of out-of-range batch lanes.
    let write = build_access(&ctx, SendOp::Store, &dst_thr_view, &args.dst, &read_buf)?;
    allocs.push(BufferAlloc::grf(
        read_buf.clone(),
        read.reg_buf_size().max(write.reg_buf_size()),
    ));

    let read_layout = read.reg_layout().clone();
    let read_dt = read_layout.data_type();
    let read_type = Type::new(read_dt, simd);
    let tile = simd_tile(src_thr_view.nvdims(), simd as i64);
    let acc_elems = dst_extents.iter().product::<i64>() as u32;

    let (mut stmt, acc_buf, acc_dt) = if problem.window_volume() <= 1 {
        (read.into_stmt(), read_buf.clone(), read_dt)
    } else {
        let acc_buf = ctx.create_tmp_var(Type::byte_ptr(), "acc");
        let mut acc_dt = accumulator_type(problem.alg, read_dt);
        let acc_layout = write.reg_layout().retype(acc_dt);
        allocs.push(BufferAlloc::grf(acc_buf.clone(), acc_elems * acc_dt.size()));

        let init = accumulator_init(problem.alg, read_dt, acc_dt, simd);
        let mut stmt = acc_chunks(acc_elems, acc_dt, simd)
            .map(|off| Stmt::store(&acc_buf, off, init.clone()))
            .fold(Stmt::empty(), Stmt::append);

        let fill_value = read_fill_value(problem.alg, read_dt, simd);
        let mut fill = Vec::new();
        let mut compute = Vec::new();
        read_layout.for_each_tile(&tile, |start| {
            let read_off = byte_offset(&read_layout, start);
            fill.push(Stmt::store(&read_buf, read_off, fill_value.clone()));

            let acc_type = Type::new(acc_dt, simd);
            let acc_off = byte_offset(&acc_layout, &start[..acc_layout.ndims()]);
            let tap = Expr::load(read_type, &read_buf, read_off).cast(acc_type);
            let acc = Expr::load(acc_type, &acc_buf, acc_off);
            let value = if problem.alg.is_max() {
                acc.max(tap)
            } else {
                acc + tap
            };
            compute.push(Stmt::store(&acc_buf, acc_off, value));
        });
        let compute = read.into_stmt().append(Stmt::seq(compute));
        let body = if check_idhw {
            Stmt::seq(fill).append(compute)
        } else {
            compute
        };
        stmt = stmt.append(schedule.create_loop_nest(body));

        if !problem.alg.is_max() {
            let filter = if problem.alg == PoolAlg::AvgExcludePadding && check_idhw {
                problem
                    .spatial
                    .iter()
                    .zip(&dst_starts[2..])
                    .map(|(w, o)| clamped_extent(o, w.stride, w.padding, w.kernel, w.input))
                    .reduce(|a, b| a * b)
                    .unwrap_or(Expr::Int(1))
                    .cast(Type::f32())
            } else {
                Expr::float(problem.window_volume() as f32)
            };
            let filter = filter.broadcast(simd);
            let f32_vec = Type::new(DataType::F32, simd);
            let acc_type = Type::new(acc_dt, simd);
            let divide = acc_chunks(acc_elems, acc_dt, simd).map(|off| {
                let acc = Expr::load(acc_type, &acc_buf, off).cast(f32_vec);
                Stmt::store(&acc_buf, off, acc / filter.clone())
            });
            stmt = stmt.append(Stmt::seq(divide));
            acc_dt = DataType::F32;
        }
        (stmt, acc_buf, acc_dt)
    };

    let acc_layout = write.reg_layout().retype(acc_dt);
    let out = epilogue.build(
        EpilogueContext {
            ir_ctx: &mut ctx,
            view_mapper: PostOpViewMapper::new(&dst_view, problem.ndims),
            tile_starts: &dst_starts,
            tile_extents: &dst_extents,
            acc_layout: &acc_layout,
            acc_buf: &acc_buf,
            dst_buf: &args.dst,
            post_op_args: &args.post_ops,
        },
        &problem.post_ops,
    )?;
    stmt = stmt.append(out.stmt);
    allocs.extend(
        out.allocs
            .into_iter()
            .map(|(buf, size)| BufferAlloc::grf(buf, size)),
    );

    // Batch lanes past the true batch still write zeros.
    if config.dims_padded[0] > problem.mb {
        let zero = Expr::Int(0).broadcast(simd).cast(read_type);
        let zeros = (0..acc_elems)
            .step_by(simd as usize)
            .map(|i| Stmt::store(&read_buf, i * read_dt.size(), zero.clone()));
        let stop = Stmt::seq(zeros).append(write.into_stmt());
        let out_of_range = dst_starts[0].clone().ge(problem.mb).broadcast(simd);
        stmt = Stmt::if_(out_of_range, stop, Some(stmt));
    }

    let exit_cond = (2..5)
        .rev()
        .filter_map(|i| {
            let o = &dst_starts[i];
            let extent = problem.spatial[i - 2].output;
            schedule
                .max_value(o)
                .is_none_or(|max| max >= extent)
                .then(|| o.clone().lt(extent))
        })
        .reduce(|inner, outer| outer & inner);
    if let Some(cond) = exit_cond {
        stmt = Stmt::if_(cond.broadcast(simd), stmt, None);
    }

    let body = passes::lower(stmt, &schedule, allocs, &mut ctx);
    let regs = passes::get_peak_regs(&body, exec.grf_size());
    trace.kernel_body(&body, config, regs);
    Ok(if regs > exec.regs() {
        Attempt::Rejected { regs }
    } else {
        Attempt::Accepted { body, regs }
    })
}

/// Byte offsets of the SIMD-wide chunks of an accumulator.
fn acc_chunks(elems: u32, data_type: DataType, simd: u32) -> impl Iterator<Item = u32> {
    (0..elems)
        .step_by(simd as usize)
        .map(move |i| i * data_type.size())
}

fn byte_offset(layout: &Layout, coords: &[i64]) -> u32 {
    layout.offset_of(coords) as u32 * layout.data_type().size()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(DataType::S32, 8, 0x8000_0000u32)]
    #[case(DataType::S16, 4, 0x8000_8000u32)]
    #[case(DataType::S8, 2, 0x8080_8080u32)]
    fn packed_int_fill(#[case] dt: DataType, #[case] lanes: u32, #[case] pattern: u32) {
        let fill = read_fill_value(PoolAlg::Max, dt, 8);
        assert_eq!(fill.ty(), Type::new(DataType::S32, lanes));
        let Expr::Broadcast(word, _) = &fill else {
            panic!("expected broadcast, got {fill:?}");
        };
        let word = word.as_int().unwrap() as i32 as u32;
        assert_eq!(word, pattern);
        // Every packed element is the type's minimum.
        let elem_bits = dt.size() * 8;
        let elem = (word & ((1u64 << elem_bits) - 1) as u32) as i64;
        let min = dt.int_min().unwrap();
        assert_eq!(elem - (1 << elem_bits), min);
    }

    #[rstest]
    #[case(PoolAlg::AvgIncludePadding, DataType::S8)]
    #[case(PoolAlg::Max, DataType::U8)]
    fn non_negative_int_fill_is_zero(#[case] alg: PoolAlg, #[case] dt: DataType) {
        let fill = read_fill_value(alg, dt, 16);
        assert_eq!(fill, Expr::Int(0).broadcast(4));
    }

    #[rstest]
    #[case(PoolAlg::Max, DataType::F16, DataType::F16)]
    #[case(PoolAlg::AvgExcludePadding, DataType::F16, DataType::F32)]
    #[case(PoolAlg::AvgIncludePadding, DataType::S8, DataType::S32)]
    #[case(PoolAlg::Max, DataType::U8, DataType::S32)]
    fn accumulator_types(#[case] alg: PoolAlg, #[case] read: DataType, #[case] acc: DataType) {
        assert_eq!(accumulator_type(alg, read), acc);
    }

    #[rstest]
    // Top-left corner of a 3x3 window with padding 1.
    #[case(0, 2)]
    // Interior.
    #[case(2, 3)]
    // Bottom edge of an 8-wide input.
    #[case(4, 1)]
    fn clamped_window(#[case] o: i64, #[case] expected: i64) {
        let e = clamped_extent(&Expr::Int(o), 2, 1, 3, 8);
        assert_eq!(e.eval_int(&|_| None), Some(expected));
    }
}
