use argon_ir::{BinaryOp, DataType, Expr, MemoryDesc, SendOp, Stmt};
use argon_kernel_generator::{
    Error, ExecConfig, PoolAlg, PoolConfig, PoolProblem, PoolingGenerator, PoolingKernel, Window,
    architecture::Architecture,
    config::reduce_dim,
    epilogue::{BinaryAlg, EltwiseAlg, PostOp, PostOpEpilogue},
    trace::{TraceSink, TracingSink},
};
use rstest::rstest;
use std::cell::RefCell;

/// Remembers the loop grid and register count of every attempt.
#[derive(Default)]
struct Recorder {
    attempts: RefCell<Vec<([i64; 8], u32)>>,
}

impl TraceSink for Recorder {
    fn kernel_body(&self, _body: &Stmt, config: &PoolConfig, regs: u32) {
        self.attempts.borrow_mut().push((config.loop_grid, regs));
    }
}

#[allow(clippy::too_many_arguments)]
fn pool_2d(
    alg: PoolAlg,
    mb: i64,
    c: i64,
    hw: i64,
    k: i64,
    s: i64,
    p: i64,
    data_type: DataType,
    tag: &str,
) -> PoolProblem {
    let w = Window::new(hw, k, s, p, 0);
    PoolProblem::new(alg, mb, c, &[w, w], data_type, tag, tag).unwrap()
}

fn config(problem: PoolProblem, arch: Architecture, simd: u32) -> PoolConfig {
    let exec = ExecConfig::new(arch, simd, true).unwrap();
    PoolConfig::new(problem, exec).unwrap()
}

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn generate(config: PoolConfig) -> PoolingKernel {
    PoolingGenerator::default().generate(config).unwrap()
}

/// Every expression node in the program.
fn all_exprs(body: &Stmt) -> Vec<Expr> {
    let mut out = Vec::new();
    body.walk(&mut |s| {
        for root in s.exprs() {
            root.visit(&mut |e| out.push(e.clone()));
        }
    });
    out
}

fn stores(body: &Stmt) -> Vec<Expr> {
    let mut out = Vec::new();
    body.walk(&mut |s| {
        if let Stmt::Store(store) = s {
            out.push(store.value.clone());
        }
    });
    out
}

/// Right-hand sides of every division.
fn divisors(body: &Stmt) -> Vec<Expr> {
    all_exprs(body)
        .into_iter()
        .filter_map(|e| match e {
            Expr::Binary(BinaryOp::Div, _, b) if b.ty().data_type == DataType::F32 => Some(*b),
            _ => None,
        })
        .collect()
}

fn contains(e: &Expr, pred: impl Fn(&Expr) -> bool) -> bool {
    let mut found = false;
    e.visit(&mut |e| found |= pred(e));
    found
}

#[rstest]
#[case(pool_2d(PoolAlg::Max, 2, 40, 8, 3, 2, 1, DataType::F32, "aBcd16b"), Architecture::XeHp, 16)]
#[case(pool_2d(PoolAlg::AvgIncludePadding, 3, 24, 13, 3, 1, 1, DataType::F32, "abcd"), Architecture::XeLp, 8)]
#[case(pool_2d(PoolAlg::Max, 16, 64, 6, 2, 2, 0, DataType::F16, "ABcd8a16b"), Architecture::XeHpc, 16)]
#[case(pool_2d(PoolAlg::AvgExcludePadding, 1, 8, 7, 3, 2, 1, DataType::F32, "acdb"), Architecture::Gen9, 8)]
fn launch_geometry_divides(
    #[case] problem: PoolProblem,
    #[case] arch: Architecture,
    #[case] simd: u32,
) {
    init_logging();
    let kernel = PoolingGenerator::new(&PostOpEpilogue, &TracingSink)
        .generate(config(problem, arch, simd))
        .unwrap();
    let range = kernel.nd_range;
    let tg = kernel.config.thread_group;
    assert_eq!(
        range.local,
        [tg[0] as u64 * simd as u64, tg[1] as u64, tg[2] as u64]
    );
    for i in 0..3 {
        assert_eq!(range.global[i] % range.local[i], 0);
        assert_eq!(
            range.global[i] / range.local[i],
            kernel.config.kernel_grid[i] as u64
        );
    }
}

#[test]
fn padded_max_pooling_masks_reads_and_starts_at_negative_infinity() {
    let problem = pool_2d(PoolAlg::Max, 1, 8, 8, 3, 2, 1, DataType::F32, "aBcd8b");
    assert!(problem.need_src_or_dst_check());
    let kernel = generate(config(problem, Architecture::XeLp, 8));

    let mut masked_loads = 0;
    kernel.body.walk(&mut |s| {
        if let Stmt::Send(send) = s {
            assert!(send.lowered);
            if send.op == SendOp::Load && send.mask.is_some() {
                masked_loads += 1;
            }
        }
    });
    assert!(masked_loads > 0);

    let neg_inf = Expr::float(f32::NEG_INFINITY).broadcast(8);
    assert!(stores(&kernel.body).contains(&neg_inf));
    assert!(divisors(&kernel.body).is_empty());
}

#[test]
fn average_including_padding_divides_by_window_volume() {
    let problem = pool_2d(PoolAlg::AvgIncludePadding, 1, 8, 8, 3, 2, 1, DataType::F32, "aBcd8b");
    let kernel = generate(config(problem, Architecture::XeLp, 8));
    let divisors = divisors(&kernel.body);
    assert!(!divisors.is_empty());
    let nine = Expr::float(9.0).broadcast(8);
    assert!(divisors.iter().all(|d| *d == nine));
    assert!(
        !all_exprs(&kernel.body)
            .iter()
            .any(|e| matches!(e, Expr::Binary(BinaryOp::Min, ..)))
    );
}

#[test]
fn average_excluding_padding_clamps_the_divisor() {
    let problem = pool_2d(PoolAlg::AvgExcludePadding, 1, 8, 8, 3, 2, 1, DataType::F32, "aBcd8b");
    let kernel = generate(config(problem, Architecture::XeLp, 8));
    let divisors = divisors(&kernel.body);
    assert!(!divisors.is_empty());
    let nine = Expr::float(9.0).broadcast(8);
    assert!(divisors.iter().all(|d| *d != nine));
    let exprs = all_exprs(&kernel.body);
    assert!(exprs.iter().any(|e| matches!(e, Expr::Binary(BinaryOp::Min, ..))));
    assert!(exprs.iter().any(|e| matches!(e, Expr::Binary(BinaryOp::Max, ..))));
}

#[test]
fn average_excluding_padding_without_overhang_uses_window_volume() {
    let problem = pool_2d(PoolAlg::AvgExcludePadding, 1, 8, 8, 2, 2, 0, DataType::F32, "aBcd8b");
    assert!(!problem.need_src_or_dst_check());
    let kernel = generate(config(problem, Architecture::XeLp, 8));
    let four = Expr::float(4.0).broadcast(8);
    assert!(divisors(&kernel.body).iter().all(|d| *d == four));
}

#[rstest]
#[case(DataType::S8, 0x8080_8080u32, 4)]
#[case(DataType::S32, 0x8000_0000u32, 1)]
fn integer_max_fills_with_packed_minimum(
    #[case] data_type: DataType,
    #[case] pattern: u32,
    #[case] per_word: u32,
) {
    let problem = pool_2d(PoolAlg::Max, 1, 16, 8, 3, 2, 1, data_type, "aBcd16b");
    let kernel = generate(config(problem, Architecture::XeHp, 16));
    let stores = stores(&kernel.body);
    let fill = Expr::Int(pattern as i32 as i64).broadcast(16 / per_word);
    assert!(stores.contains(&fill));
    let acc_init = Expr::Int(i32::MIN as i64).broadcast(16);
    assert!(stores.contains(&acc_init));
}

#[test]
fn unsigned_max_starts_at_zero() {
    let problem = pool_2d(PoolAlg::Max, 1, 16, 8, 3, 2, 1, DataType::U8, "aBcd16b");
    let kernel = generate(config(problem, Architecture::XeHp, 16));
    let stores = stores(&kernel.body);
    assert!(stores.contains(&Expr::Int(0).broadcast(16)));
    assert!(!stores.contains(&Expr::Int(i32::MIN as i64).broadcast(16)));
}

#[test]
fn fitting_schedule_is_accepted_first_time() {
    let problem = pool_2d(PoolAlg::Max, 2, 40, 8, 3, 2, 1, DataType::F32, "aBcd16b");
    let initial = config(problem, Architecture::XeHp, 16);
    let recorder = Recorder::default();
    let kernel = PoolingGenerator::new(&PostOpEpilogue, &recorder)
        .generate(initial.clone())
        .unwrap();
    assert_eq!(recorder.attempts.borrow().len(), 1);
    assert_eq!(kernel.config, initial);
    assert!(kernel.regs <= initial.exec.regs());
    assert!(matches!(&kernel.body, Stmt::Group(g) if g.label == argon_ir::Label::Kernel));
}

#[test]
fn over_budget_schedule_is_shrunk_and_rebuilt() {
    init_logging();
    let problem = pool_2d(PoolAlg::Max, 16, 64, 6, 2, 2, 0, DataType::F32, "ABcd8a16b");
    let mut initial = config(problem, Architecture::XeHp, 16);
    let first = generate(initial.clone());
    assert_eq!(first.config, initial);

    initial.exec = initial.exec.with_regs(first.regs - 1);
    let recorder = Recorder::default();
    let kernel = PoolingGenerator::new(&PostOpEpilogue, &recorder)
        .generate(initial.clone())
        .unwrap();

    let attempts = recorder.attempts.borrow();
    assert!(attempts.len() >= 2);
    assert_eq!(attempts[0], (initial.loop_grid, first.regs));
    assert!(kernel.regs < first.regs);
    assert!(kernel.config.loop_grid[0] < initial.loop_grid[0]);
    assert_eq!(kernel.config.kernel_grid, kernel.config.expected_kernel_grid());
    let range = kernel.nd_range;
    for i in 0..3 {
        assert_eq!(range.global[i] % range.local[i], 0);
    }
}

#[test]
fn exhausted_grid_is_fatal() {
    init_logging();
    let problem = pool_2d(PoolAlg::Max, 16, 64, 6, 2, 2, 0, DataType::F32, "ABcd8a16b");
    let mut config = config(problem, Architecture::XeHp, 16);
    config.exec = config.exec.with_regs(1);
    let recorder = Recorder::default();
    let result = PoolingGenerator::new(&PostOpEpilogue, &recorder).generate(config);
    assert!(matches!(result, Err(Error::GridExhausted { budget: 1 })));
    let grids: Vec<(i64, i64)> = recorder
        .attempts
        .borrow()
        .iter()
        .map(|(lg, _)| (lg[0], lg[1]))
        .collect();
    assert_eq!(grids, vec![(4, 64), (2, 64), (1, 64), (1, 32), (1, 16)]);
}

#[test]
fn retry_guard_stops_the_loop() {
    let problem = pool_2d(PoolAlg::Max, 16, 64, 6, 2, 2, 0, DataType::F32, "ABcd8a16b");
    let mut config = config(problem, Architecture::XeHp, 16);
    config.exec = config.exec.with_regs(1);
    let result = PoolingGenerator::default()
        .with_max_attempts(2)
        .generate(config);
    assert!(matches!(result, Err(Error::RetryLimit(2))));
}

#[rstest]
#[case(64, 1, 1)]
#[case(64, 1, 16)]
#[case(96, 3, 16)]
#[case(37, 2, 1)]
fn reduce_dim_terminates(#[case] dn: i64, #[case] up: i64, #[case] scale: i64) {
    let (mut dn, mut up) = (dn, up);
    let total = dn * up;
    loop {
        match reduce_dim(dn, up, scale) {
            Ok((next_dn, next_up)) => {
                assert!(next_dn < dn);
                assert_eq!(next_dn * next_up, total);
                assert_eq!(next_dn % scale, 0);
                (dn, up) = (next_dn, next_up);
            }
            Err(Error::IrreducibleDim { .. }) => break,
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    assert_eq!(dn, scale);
}

#[test]
fn batch_tail_is_zero_written() {
    let problem = pool_2d(PoolAlg::Max, 5, 8, 4, 2, 2, 0, DataType::F32, "ABcd8a8b");
    let config = config(problem, Architecture::XeLp, 8);
    assert_eq!(config.dims_padded[0], 8);
    let kernel = generate(config);

    let mut guards = Vec::new();
    kernel.body.walk(&mut |s| {
        if let Stmt::If(guard) = s {
            let is_batch = contains(&guard.cond, |e| {
                matches!(e, Expr::Binary(BinaryOp::Ge, _, b) if **b == Expr::Int(5))
            });
            if is_batch {
                guards.push(guard.clone());
            }
        }
    });
    assert_eq!(guards.len(), 1);
    let guard = &guards[0];

    // Out-of-range lanes: zeros, then a store of them to the destination.
    let zero = Expr::Int(0).broadcast(8).cast(argon_ir::Type::new(DataType::F32, 8));
    assert!(stores(&guard.then_body).contains(&zero));
    assert!(guard.then_body.count(|s| matches!(s, Stmt::Send(send) if send.op == SendOp::Store)) > 0);

    // In-range lanes: the full reduction.
    let normal = guard.else_body.as_deref().unwrap();
    assert!(normal.count(|s| matches!(s, Stmt::Send(send) if send.op == SendOp::Load)) > 0);
}

#[test]
fn exact_batch_has_no_tail_guard() {
    let problem = pool_2d(PoolAlg::Max, 8, 8, 4, 2, 2, 0, DataType::F32, "ABcd8a8b");
    let kernel = generate(config(problem, Architecture::XeLp, 8));
    let has_guard = all_exprs(&kernel.body)
        .iter()
        .any(|e| matches!(e, Expr::Binary(BinaryOp::Ge, _, b) if **b == Expr::Int(8)));
    assert!(!has_guard);
}

#[test]
fn padded_width_is_guarded() {
    // Five outputs along width, four threads per group: eight are launched.
    let problem = pool_2d(PoolAlg::Max, 1, 8, 6, 2, 1, 0, DataType::F32, "aBcd8b");
    let config = config(problem, Architecture::XeLp, 8);
    assert_eq!(config.dims_padded[4], 8);
    let kernel = generate(config);
    let guarded = all_exprs(&kernel.body)
        .iter()
        .any(|e| matches!(e, Expr::Binary(BinaryOp::Lt, _, b) if **b == Expr::Int(5)));
    assert!(guarded);
}

#[test]
fn identity_window_skips_the_accumulator() {
    let problem = pool_2d(PoolAlg::Max, 2, 16, 8, 1, 1, 0, DataType::F32, "aBcd16b");
    let kernel = generate(config(problem, Architecture::XeHp, 16));
    let mut buffers = Vec::new();
    kernel.body.walk(&mut |s| {
        if let Stmt::Alloc(alloc) = s {
            buffers.push(alloc.buf.name().to_owned());
        }
    });
    assert!(buffers.iter().any(|b| b == "read"));
    assert!(!buffers.iter().any(|b| b == "acc"));
}

#[rstest]
#[case(&[Window::new(9, 3, 1, 1, 0)], "aBc16b")]
#[case(&[Window::new(4, 2, 2, 0, 0), Window::new(6, 3, 1, 1, 0), Window::new(6, 3, 2, 0, 0)], "aBcde16b")]
fn one_and_three_dimensional_windows(#[case] windows: &[Window], #[case] tag: &str) {
    let problem =
        PoolProblem::new(PoolAlg::AvgIncludePadding, 2, 32, windows, DataType::F32, tag, tag)
            .unwrap();
    let volume: i64 = windows.iter().map(|w| w.kernel).product();
    assert_eq!(problem.window_volume(), volume);
    let kernel = generate(config(problem, Architecture::XeHp, 16));
    let expected = Expr::float(volume as f32).broadcast(16);
    assert!(divisors(&kernel.body).iter().all(|d| *d == expected));
}

#[test]
fn post_ops_read_their_operands() {
    let bias = MemoryDesc::new(DataType::F32, &[2, 16, 4, 4], "aBcd16b").unwrap();
    let problem = pool_2d(PoolAlg::Max, 2, 16, 8, 2, 2, 0, DataType::F32, "aBcd16b")
        .with_post_ops(vec![
            PostOp::Binary {
                alg: BinaryAlg::Add,
                src: bias,
            },
            PostOp::Eltwise(EltwiseAlg::Relu { alpha: 0.5 }),
            PostOp::Scale { mask: 0b10 },
        ]);
    let kernel = generate(config(problem, Architecture::XeHp, 16));
    assert_eq!(kernel.args.post_ops.len(), 2);
    for arg in &kernel.args.post_ops {
        let reads = kernel.body.count(
            |s| matches!(s, Stmt::Send(send) if send.op == SendOp::Load && send.mem_buf == *arg),
        );
        assert!(reads > 0, "no loads of {}", arg.name());
    }
    assert!(
        all_exprs(&kernel.body)
            .iter()
            .any(|e| *e == Expr::float(0.5))
    );
}
