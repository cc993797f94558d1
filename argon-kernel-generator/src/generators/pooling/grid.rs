//! Distribution of the pooling dims over the kernel grid, the thread
//! group and the per-thread tile.

use crate::{
    config::{LG_KD, PoolConfig},
    error::{Error, Result},
    schedule::{BindTarget, Grid, Schedule},
    view::View,
};
use argon_ir::Var;

/// Builds the finalized schedule for `config` over the source view
/// (`mb, oc, od, oh, ow, kd, kh, kw`).
pub(super) fn build_schedule(
    config: &PoolConfig,
    src_view: &View,
    dst_view: &View,
) -> Result<Schedule> {
    let mut schedule = Schedule::new(
        Grid::new(config.kernel_grid, "kg"),
        Grid::new(config.thread_group, "tg"),
        config.simd(),
    );
    schedule.set_view(src_view);
    schedule.set_view(dst_view);

    let vars = src_view.vvars();
    let [mb, oc, od, oh, ow, kd, kh, kw] = [0, 1, 2, 3, 4, 5, 6, 7].map(|i| vars[i].clone());
    let mut dist = Distributor {
        schedule: &mut schedule,
        vars,
        config,
    };
    dist.distribute(&oc, &od, None)?;
    if prefers_batch_outer(config) {
        dist.distribute(&oh, &mb, Some(&ow))?;
    } else {
        dist.distribute(&mb, &oh, Some(&ow))?;
    }
    for k in [&kd, &kh, &kw] {
        dist.window(k)?;
    }

    schedule.finalize()?;
    Ok(schedule)
}

/// Batch is fused after height when it is blocked in the source
/// layout or smaller than the channel count.
fn prefers_batch_outer(config: &PoolConfig) -> bool {
    let batch_blocked = config
        .problem
        .src
        .layout
        .blocks()
        .get(1)
        .is_some_and(|b| b.dim == 0);
    batch_blocked || config.dims_padded[0] < config.dims_padded[1]
}

struct Distributor<'a> {
    schedule: &'a mut Schedule,
    vars: &'a [Var],
    config: &'a PoolConfig,
}

impl Distributor<'_> {
    fn index(&self, var: &Var) -> Result<usize> {
        self.vars
            .iter()
            .position(|v| v == var)
            .ok_or_else(|| Error::UnknownVar(var.name().to_owned()))
    }

    /// Distributes a spatial dim `s1` and a non-spatial dim `ns` (in
    /// either argument order), plus optionally the spatial dim `s0`
    /// following `s1`. The kernel-grid fuse order follows the argument
    /// order.
    fn distribute(&mut self, s1: &Var, ns: &Var, s0: Option<&Var>) -> Result<()> {
        let config = self.config;
        let (lg, tg) = (&config.loop_grid, &config.thread_group);
        let (kg, dims) = (&config.kernel_grid, &config.dims_padded);

        let (mut s1, mut ns) = (s1.clone(), ns.clone());
        let mut s1_idx = self.index(&s1)?;
        let mut ns_idx = self.index(&ns)?;
        let swapped = s1_idx <= 1;
        if swapped == (ns_idx <= 1) {
            return Err(Error::InvalidDimPair {
                primary: s1.name().to_owned(),
                secondary: ns.name().to_owned(),
            });
        }
        if swapped {
            std::mem::swap(&mut s1, &mut ns);
            std::mem::swap(&mut s1_idx, &mut ns_idx);
        }

        let s1_lg_extent = lg[s1_idx];
        let p1 = s1.name().to_owned();
        let (s1_kg, s1_tlg) = self.schedule.split(
            &s1,
            s1_lg_extent * tg[s1_idx - 2],
            &format!("{p1}_kg"),
            &format!("{p1}_tlg"),
        )?;
        let (s1_tg, s1_lg) =
            self.schedule
                .split(&s1_tlg, s1_lg_extent, &format!("{p1}_tg"), &format!("{p1}_lg"))?;
        self.schedule.tensorize(&s1_lg)?;
        self.schedule.bind(&s1_tg, BindTarget::ThreadGroup(s1_idx - 2))?;
        let mut s1_fuse = vec![s1_kg];
        let mut s0_fuse = Vec::new();

        let s0_idx = match s0 {
            Some(s0) => {
                let s0_idx = self.index(s0)?;
                if s0_idx != s1_idx + 1 {
                    return Err(Error::InvalidDimPair {
                        primary: p1,
                        secondary: s0.name().to_owned(),
                    });
                }
                let s0_lg_extent = lg[s0_idx];
                let s0_unroll = s0_lg_extent * tg[s0_idx - 2];
                let s0_full = s0_unroll * kg[s0_idx - 2];
                let p0 = s0.name().to_owned();
                let mut s0 = s0.clone();

                if dims[s0_idx] > s0_full {
                    // Part of the kernel-grid axis of `s0` moves to that of `s1`.
                    let (s0_split, s0_ktlg) = self.schedule.split(
                        &s0,
                        s0_full,
                        &format!("{p0}_split"),
                        &format!("{p0}_ktlg"),
                    )?;
                    s1_fuse.push(s0_split);
                    s0 = s0_ktlg;
                } else if dims[s0_idx] <= crate::div_ceil(s0_full, 2) {
                    // Part of the kernel-grid axis of `s1` moves to that of `s0`.
                    let s1_ext = crate::div_ceil(s0_full, dims[s0_idx]);
                    let (s1_ktlg, s1_split) = self.schedule.split(
                        &s1_fuse[0],
                        s1_ext,
                        &format!("{p1}_ktlg"),
                        &format!("{p1}_split"),
                    )?;
                    s1_fuse[0] = s1_ktlg;
                    s0_fuse.push(s1_split);
                }

                let (s0_kg, s0_tlg) = self.schedule.split(
                    &s0,
                    s0_unroll,
                    &format!("{p0}_kg"),
                    &format!("{p0}_tlg"),
                )?;
                let (s0_tg, s0_lg) = self.schedule.split(
                    &s0_tlg,
                    s0_lg_extent,
                    &format!("{p0}_tg"),
                    &format!("{p0}_lg"),
                )?;
                self.schedule.tensorize(&s0_lg)?;
                self.schedule
                    .bind(&s0_tg, BindTarget::ThreadGroup(s0_idx - 2))?;
                s0_fuse.push(s0_kg);
                Some(s0_idx)
            }
            None => None,
        };

        let pn = ns.name().to_owned();
        let (ns_kg, ns_lg) =
            self.schedule
                .split(&ns, lg[ns_idx], &format!("{pn}_kg"), &format!("{pn}_lg"))?;
        if swapped {
            s1_fuse.insert(0, ns_kg);
        } else {
            s1_fuse.push(ns_kg);
        }
        self.schedule.tensorize(&ns_lg)?;

        if let Some(s0_idx) = s0_idx {
            self.bind_kernel(&s0_fuse, s0_idx)?;
        }
        self.bind_kernel(&s1_fuse, s1_idx)
    }

    fn bind_kernel(&mut self, fuse: &[Var], idx: usize) -> Result<()> {
        let target = BindTarget::Kernel(idx - 2);
        match fuse {
            [] => Ok(()),
            [var] => self.schedule.bind(var, target),
            _ => {
                let fused = self.schedule.fuse(fuse)?;
                self.schedule.bind(&fused, target)
            }
        }
    }

    /// Window dims: fully covered by the thread tile, tiled with a
    /// serial outer loop, or fully serial.
    fn window(&mut self, k: &Var) -> Result<()> {
        let idx = self.index(k)?;
        debug_assert!(idx >= LG_KD);
        let extent = self.config.loop_grid[idx];
        let bound = self.schedule.var_bound(k)?;
        if extent == bound {
            self.schedule.tensorize(k)
        } else if extent > bound {
            Err(Error::WindowExtentExceedsBound {
                dim: k.name().to_owned(),
                extent,
                bound,
            })
        } else if extent > 1 {
            let name = k.name();
            let (_, k_tnz) =
                self.schedule
                    .split(k, extent, &format!("{name}_lg"), &format!("{name}_tnz"))?;
            self.schedule.tensorize(&k_tnz)
        } else {
            Ok(())
        }
    }
}
