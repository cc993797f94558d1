use argon_ir::{AllocKind, Stmt};

/// Upper bound on the registers live at once: the largest total size
/// of register buffers and scalar variables in scope at any leaf
/// statement, in units of `grf_size` bytes.
pub fn get_peak_regs(stmt: &Stmt, grf_size: u32) -> u32 {
    peak_bytes(stmt, 0).div_ceil(grf_size)
}

fn peak_bytes(stmt: &Stmt, live: u32) -> u32 {
    match stmt {
        Stmt::Alloc(s) => {
            let size = match s.kind {
                AllocKind::Grf => s.size,
                AllocKind::Global => 0,
            };
            peak_bytes(&s.body, live + size)
        }
        Stmt::Let(s) => peak_bytes(&s.body, live + s.var.ty().size()),
        Stmt::For(s) => peak_bytes(&s.body, live + s.var.ty().size()),
        Stmt::If(s) => {
            let then = peak_bytes(&s.then_body, live);
            s.else_body
                .as_deref()
                .map_or(then, |e| then.max(peak_bytes(e, live)))
        }
        Stmt::Group(g) => g
            .body
            .iter()
            .map(|s| peak_bytes(s, live))
            .max()
            .unwrap_or(live),
        Stmt::Send(_) | Stmt::Store(_) => live,
    }
}
