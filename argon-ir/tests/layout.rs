use argon_ir::{DataType, Expr, Layout, MemoryDesc, Var};
use rstest::rstest;

/// Every coordinate of a `dims`-shaped box, outermost first.
fn coords(dims: &[i64]) -> Vec<Vec<i64>> {
    dims.iter().fold(vec![Vec::new()], |acc, &d| {
        acc.into_iter()
            .flat_map(|prefix| {
                (0..d).map(move |x| {
                    let mut c = prefix.clone();
                    c.push(x);
                    c
                })
            })
            .collect()
    })
}

#[rstest]
#[case(&[2, 20, 3, 3], "aBcd16b")]
#[case(&[10, 8, 2, 3], "ABcd8a8b")]
#[case(&[2, 3, 4, 5], "acdb")]
#[case(&[3, 5, 2, 2, 2], "aBcde8b")]
fn symbolic_offsets_match_constant_offsets(#[case] dims: &[i64], #[case] tag: &str) {
    let layout = Layout::from_tag(DataType::F32, dims, tag).unwrap();
    let vars: Vec<Var> = (0..dims.len()).map(|i| Var::s32(format!("x{i}"))).collect();
    let exprs: Vec<Expr> = vars.iter().map(Var::expr).collect();
    let offset = layout.offset_expr(&exprs);

    let mut seen = Vec::new();
    for c in coords(&layout.dims()) {
        let env = |v: &Var| vars.iter().position(|x| x == v).map(|i| c[i]);
        let expected = layout.offset_of(&c);
        assert_eq!(offset.eval_int(&env), Some(expected), "at {c:?}");
        seen.push(expected);
    }

    // A dense layout visits every element exactly once.
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len() as i64, layout.elems());
}

#[test]
fn padded_descriptor_keeps_logical_dims() {
    let md = MemoryDesc::new(DataType::F16, &[5, 12, 7, 7], "ABcd8a16b").unwrap();
    assert_eq!(md.dims, vec![5, 12, 7, 7]);
    assert_eq!(md.padded_dims(), vec![8, 16, 7, 7]);
    assert_eq!(md.data_type(), DataType::F16);
    assert_eq!(md.ndims(), 4);
}

#[test]
fn substitution_then_evaluation() {
    let i = Var::s32("i");
    let j = Var::s32("j");
    let e = (i.expr() * 4 + j.expr()).min(10);
    let e = e.substitute(&j, &Expr::Int(3));
    let env = |v: &Var| (*v == i).then_some(1);
    assert_eq!(e.eval_int(&env), Some(7));
    let env = |v: &Var| (*v == i).then_some(5);
    assert_eq!(e.eval_int(&env), Some(10));
}
