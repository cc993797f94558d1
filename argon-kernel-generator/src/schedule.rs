//! Loop schedule: how logical dimensions are split, fused and mapped
//! onto the kernel grid, the thread group and SIMD lanes.

use crate::{
    error::{Error, Result},
    view::View,
};
use argon_ir::{Builtin, Expr, Stmt, Var};
use indexmap::IndexMap;

/// Three grid extents plus the variables indexing them.
#[derive(Clone, Debug, PartialEq)]
pub struct Grid {
    extents: [i64; 3],
    idx: [Var; 3],
}

impl Grid {
    pub fn new(extents: [i64; 3], prefix: &str) -> Self {
        Self {
            extents,
            idx: [0, 1, 2].map(|i| Var::s32(format!("{prefix}_idx{i}"))),
        }
    }

    pub fn extent(&self, axis: usize) -> i64 {
        self.extents[axis]
    }

    pub fn extents(&self) -> [i64; 3] {
        self.extents
    }

    pub fn idx(&self, axis: usize) -> &Var {
        &self.idx[axis]
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BindTarget {
    Kernel(usize),
    ThreadGroup(usize),
}

/// How a non-leaf variable is recovered from the variables it was
/// replaced with.
#[derive(Clone, Debug)]
enum Expansion {
    /// `var = outer * factor + inner`
    Split { outer: Var, inner: Var, factor: i64 },
    /// `var = (fused / stride) % bound`; the outermost component
    /// skips the modulo.
    Fused {
        fused: Var,
        stride: i64,
        outermost: bool,
    },
}

#[derive(Clone, Debug)]
struct LoopInfo {
    bound: i64,
    expansion: Option<Expansion>,
    bind: Option<BindTarget>,
    tensorized: bool,
}

impl LoopInfo {
    fn leaf(bound: i64) -> Self {
        Self {
            bound,
            expansion: None,
            bind: None,
            tensorized: false,
        }
    }

    fn is_serial(&self) -> bool {
        self.expansion.is_none() && self.bind.is_none() && !self.tensorized
    }
}

#[derive(Clone, Debug)]
pub struct Schedule {
    kernel_grid: Grid,
    thread_group: Grid,
    simd: i64,
    loops: IndexMap<Var, LoopInfo, ahash::RandomState>,
    finalized: bool,
}

impl Schedule {
    pub fn new(kernel_grid: Grid, thread_group: Grid, simd: i64) -> Self {
        Self {
            kernel_grid,
            thread_group,
            simd,
            loops: IndexMap::default(),
            finalized: false,
        }
    }

    pub fn kernel_grid(&self) -> &Grid {
        &self.kernel_grid
    }

    pub fn thread_group(&self) -> &Grid {
        &self.thread_group
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Registers the virtual dims of a view as root loop variables.
    pub fn set_view(&mut self, view: &View) {
        for (var, &extent) in view.vvars().iter().zip(view.vdims()) {
            self.loops
                .entry(var.clone())
                .or_insert_with(|| LoopInfo::leaf(extent));
        }
    }

    fn info(&self, var: &Var) -> Result<&LoopInfo> {
        self.loops
            .get(var)
            .ok_or_else(|| Error::UnknownVar(var.name().to_owned()))
    }

    fn leaf_mut(&mut self, var: &Var) -> Result<&mut LoopInfo> {
        if self.finalized {
            return Err(Error::ScheduleFinalized);
        }
        let info = self
            .loops
            .get_mut(var)
            .ok_or_else(|| Error::UnknownVar(var.name().to_owned()))?;
        if info.expansion.is_some() {
            return Err(Error::NotALeaf(var.name().to_owned()));
        }
        Ok(info)
    }

    pub fn var_bound(&self, var: &Var) -> Result<i64> {
        Ok(self.info(var)?.bound)
    }

    /// Replaces `var` by `outer * factor + inner`.
    pub fn split(
        &mut self,
        var: &Var,
        factor: i64,
        outer_name: &str,
        inner_name: &str,
    ) -> Result<(Var, Var)> {
        let bound = self.leaf_mut(var)?.bound;
        let outer = Var::s32(outer_name);
        let inner = Var::s32(inner_name);
        self.leaf_mut(var)?.expansion = Some(Expansion::Split {
            outer: outer.clone(),
            inner: inner.clone(),
            factor,
        });
        self.loops
            .insert(outer.clone(), LoopInfo::leaf(crate::div_ceil(bound, factor)));
        self.loops.insert(inner.clone(), LoopInfo::leaf(factor));
        Ok((outer, inner))
    }

    /// Replaces `vars` (outermost first) by a single variable ranging
    /// over the product of their bounds.
    pub fn fuse(&mut self, vars: &[Var]) -> Result<Var> {
        let bounds = vars
            .iter()
            .map(|v| Ok(self.leaf_mut(v)?.bound))
            .collect::<Result<Vec<_>>>()?;
        let name = vars.iter().map(Var::name).collect::<Vec<_>>().join("_");
        let fused = Var::s32(name);
        let mut stride = bounds.iter().product::<i64>();
        for (i, (var, bound)) in vars.iter().zip(&bounds).enumerate() {
            stride /= bound;
            self.leaf_mut(var)?.expansion = Some(Expansion::Fused {
                fused: fused.clone(),
                stride,
                outermost: i == 0,
            });
        }
        self.loops
            .insert(fused.clone(), LoopInfo::leaf(bounds.iter().product()));
        Ok(fused)
    }

    pub fn bind(&mut self, var: &Var, target: BindTarget) -> Result<()> {
        self.leaf_mut(var)?.bind = Some(target);
        Ok(())
    }

    /// Maps `var` onto SIMD lanes / unrolled register tile.
    pub fn tensorize(&mut self, var: &Var) -> Result<()> {
        self.leaf_mut(var)?.tensorized = true;
        Ok(())
    }

    /// Checks that bindings cover the grids exactly and locks the
    /// schedule.
    pub fn finalize(&mut self) -> Result<()> {
        for axis in 0..3 {
            let bound_product = |target: BindTarget| -> i64 {
                self.loops
                    .values()
                    .filter(|l| l.expansion.is_none() && l.bind == Some(target))
                    .map(|l| l.bound)
                    .product()
            };
            let kg = bound_product(BindTarget::Kernel(axis));
            if kg != self.kernel_grid.extent(axis) {
                return Err(Error::KernelGridMismatch {
                    axis,
                    expected: self.kernel_grid.extent(axis),
                    found: kg,
                });
            }
            let tg = bound_product(BindTarget::ThreadGroup(axis));
            if tg != self.thread_group.extent(axis) {
                return Err(Error::ThreadGroupMismatch {
                    axis,
                    expected: self.thread_group.extent(axis),
                    found: tg,
                });
            }
        }
        self.finalized = true;
        Ok(())
    }

    /// Rewrites `var` as the origin of the current thread's tile in
    /// terms of grid-bound and serial loop variables. Tensorized parts
    /// contribute zero.
    pub fn expand(&self, var: &Var) -> Result<Expr> {
        let info = self.info(var)?;
        Ok(match &info.expansion {
            Some(Expansion::Split {
                outer,
                inner,
                factor,
            }) => self.expand(outer)? * *factor + self.expand(inner)?,
            Some(Expansion::Fused {
                fused,
                stride,
                outermost,
            }) => {
                let quotient = self.expand(fused)? / *stride;
                if *outermost {
                    quotient
                } else {
                    quotient % info.bound
                }
            }
            None if info.tensorized => Expr::Int(0),
            None => var.expr(),
        })
    }

    /// Extent of the thread tile along `var`.
    pub fn tile_extent(&self, var: &Var) -> Result<i64> {
        let info = self.info(var)?;
        Ok(match &info.expansion {
            Some(Expansion::Split {
                outer,
                inner,
                factor,
            }) => (self.tile_extent(outer)? - 1) * factor + self.tile_extent(inner)?,
            Some(Expansion::Fused { fused, .. }) => {
                if self.tile_extent(fused)? > 1 {
                    info.bound
                } else {
                    1
                }
            }
            None if info.tensorized => info.bound,
            None => 1,
        })
    }

    /// Tile origin and extents of the current thread along every
    /// virtual dim of `view`.
    pub fn thread_tile(&self, view: &View) -> Result<(Vec<Expr>, Vec<i64>)> {
        let starts = view
            .vvars()
            .iter()
            .map(|v| self.expand(v))
            .collect::<Result<Vec<_>>>()?;
        let extents = view
            .vvars()
            .iter()
            .map(|v| self.tile_extent(v))
            .collect::<Result<Vec<_>>>()?;
        Ok((starts, extents))
    }

    /// Largest value `expr` takes over the schedule's iteration space,
    /// found by giving every loop variable its last value.
    pub fn max_value(&self, expr: &Expr) -> Option<i64> {
        expr.eval_int(&|v: &Var| self.loops.get(v).map(|l| l.bound - 1))
    }

    /// Wraps `body` in loops over the serial leaves, first created
    /// outermost.
    pub fn create_loop_nest(&self, body: Stmt) -> Stmt {
        self.loops
            .iter()
            .filter(|(_, l)| l.is_serial())
            .rev()
            .fold(body, |body, (var, l)| {
                if l.bound == 1 {
                    Stmt::let_(var.clone(), Expr::Int(0), body)
                } else {
                    Stmt::for_(var.clone(), 0, l.bound, body)
                }
            })
    }

    /// Defines every grid-bound leaf from its grid index variable.
    pub fn create_bind_stmt(&self, body: Stmt) -> Stmt {
        self.loops
            .iter()
            .filter(|(_, l)| l.expansion.is_none())
            .filter_map(|(var, l)| l.bind.map(|b| (var, b)))
            .rev()
            .fold(body, |body, (var, target)| {
                let idx = match target {
                    BindTarget::Kernel(axis) => self.kernel_grid.idx(axis),
                    BindTarget::ThreadGroup(axis) => self.thread_group.idx(axis),
                };
                Stmt::let_(var.clone(), idx.expr(), body)
            })
    }

    /// Definitions of the grid index variables in terms of hardware ids.
    /// Thread-group axis 0 counts SIMD lanes, so its local id is scaled
    /// down by the SIMD width.
    pub fn grid_lets(&self) -> Vec<(Var, Expr)> {
        let kg = (0..3).map(|i| {
            (
                self.kernel_grid.idx(i).clone(),
                Expr::Builtin(Builtin::GroupId(i as u8)),
            )
        });
        let tg = (0..3).map(|i| {
            let local = Expr::Builtin(Builtin::LocalId(i as u8));
            let value = if i == 0 { local / self.simd } else { local };
            (self.thread_group.idx(i).clone(), value)
        });
        kg.chain(tg).collect()
    }

    /// Number of distinct values a hardware index takes.
    pub fn builtin_extent(&self, builtin: Builtin) -> i64 {
        match builtin {
            Builtin::GroupId(i) => self.kernel_grid.extent(i as usize),
            Builtin::LocalId(0) => self.thread_group.extent(0) * self.simd,
            Builtin::LocalId(i) => self.thread_group.extent(i as usize),
        }
    }
}
