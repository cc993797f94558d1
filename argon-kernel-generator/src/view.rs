//! Views map logical iteration coordinates onto tensor memory.
//!
//! A view has ordered virtual dims (loop variables with extents) and
//! target dims: one expression per tensor dimension computed from the
//! virtual variables, optionally guarded by a bound-check mask written
//! over [`placeholder_var`]. Operands are normalized to the canonical
//! rank of batch, channel and three spatial dims.

use crate::error::{Error, Result};
use argon_ir::{Expr, Layout, MemoryDesc, Type, Var};
use std::sync::LazyLock;

/// Batch, channel and three spatial dimensions.
pub const CANONICAL_NDIMS: usize = 5;

const SPATIAL_SLOTS: usize = 3;

/// Variable standing for the target coordinate inside mask expressions.
pub fn placeholder_var() -> &'static Var {
    static PLACEHOLDER: LazyLock<Var> = LazyLock::new(|| Var::s32("_x"));
    &PLACEHOLDER
}

fn smallest_prime_factor(n: i64) -> i64 {
    (2..)
        .take_while(|p| p * p <= n)
        .find(|p| n % p == 0)
        .unwrap_or(n)
}

/// Pads `dims` with trailing broadcast dims up to `ndims`.
pub fn pad_dims(dims: &[i64], ndims: usize) -> Vec<i64> {
    let mut dims = dims.to_vec();
    if dims.len() < ndims {
        dims.resize(ndims, 1);
    }
    dims
}

/// Normalizes `[n, c, spatial...]` extents to exactly three spatial
/// slots. Missing leading spatial dims become 1; extra trailing dims
/// are folded into the preceding slot one smallest prime factor at
/// a time.
pub fn spatials_to_3d(dims: &[i64]) -> Vec<i64> {
    let (outer, spatial) = dims.split_at(2.min(dims.len()));
    let mut spatial = spatial.to_vec();
    while spatial.len() < SPATIAL_SLOTS {
        spatial.insert(0, 1);
    }
    while spatial.len() > SPATIAL_SLOTS {
        let Some(last) = spatial.pop() else { break };
        if last <= 1 {
            continue;
        }
        let p = smallest_prime_factor(last);
        if let Some(prev) = spatial.last_mut() {
            *prev *= p;
        }
        spatial.push(last / p);
    }
    let mut out = pad_dims(outer, 2);
    out.extend(spatial);
    out
}

/// Applies the same normalization as [`spatials_to_3d`] to a layout.
pub fn layout_to_3d(layout: &Layout) -> Layout {
    let nspatial = layout.ndims().saturating_sub(2);
    layout.map_dims(CANONICAL_NDIMS, |dim| {
        if dim < 2 {
            dim
        } else if nspatial <= SPATIAL_SLOTS {
            dim + (SPATIAL_SLOTS - nspatial)
        } else {
            dim.min(CANONICAL_NDIMS - 1)
        }
    })
}

/// Brings a memory descriptor of the original rank `ndims` into
/// canonical form.
pub fn canonicalize(md: &MemoryDesc, ndims: usize) -> MemoryDesc {
    let dims = pad_dims(&md.dims, ndims);
    let layout = if md.layout.ndims() < ndims {
        md.layout.map_dims(ndims, |d| d)
    } else {
        md.layout.clone()
    };
    MemoryDesc {
        dims: spatials_to_3d(&dims),
        layout: layout_to_3d(&layout),
    }
}

/// Converts a dimension bit-mask given for `orig_ndims` dimensions
/// into the equivalent mask over canonical dimensions.
pub fn normalize_mask(orig_mask: u32, orig_ndims: usize) -> u32 {
    const SENTINEL: i64 = 2;
    let dummy: Vec<i64> = (0..orig_ndims)
        .map(|i| {
            if orig_mask & (1 << i) != 0 {
                SENTINEL
            } else {
                1
            }
        })
        .collect();
    spatials_to_3d(&dummy)
        .iter()
        .enumerate()
        .filter(|(_, d)| **d % SENTINEL == 0)
        .fold(0, |mask, (i, _)| mask | (1 << i))
}

/// Target dimension: coordinate expression plus an optional mask
/// over [`placeholder_var`].
#[derive(Debug, Clone, PartialEq)]
pub struct TDim {
    pub expr: Expr,
    pub mask: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct View {
    vvars: Vec<Var>,
    vdims: Vec<i64>,
    /// Origin of each virtual dim, non-zero for sub-views.
    vstart: Vec<Expr>,
    /// Extent each virtual coordinate must stay below, for sub-views
    /// whose tiles may overhang the parent extent.
    vbounds: Vec<Option<i64>>,
    tdims: Vec<TDim>,
    tlayout: Layout,
}

impl View {
    pub fn new(vvars: Vec<Var>, tlayout: Layout) -> Self {
        let n = vvars.len();
        let tdims = (0..tlayout.ndims())
            .map(|_| TDim {
                expr: Expr::Int(0),
                mask: None,
            })
            .collect();
        Self {
            vvars,
            vdims: vec![1; n],
            vstart: vec![Expr::Int(0); n],
            vbounds: vec![None; n],
            tdims,
            tlayout,
        }
    }

    pub fn vvars(&self) -> &[Var] {
        &self.vvars
    }

    pub fn vdims(&self) -> &[i64] {
        &self.vdims
    }

    pub fn tdims(&self) -> &[TDim] {
        &self.tdims
    }

    pub fn tlayout(&self) -> &Layout {
        &self.tlayout
    }

    pub fn nvdims(&self) -> usize {
        self.vvars.len()
    }

    pub fn ntdims(&self) -> usize {
        self.tdims.len()
    }

    pub fn vvar_index(&self, var: &Var) -> Option<usize> {
        self.vvars.iter().position(|v| v == var)
    }

    pub fn set_vdim(&mut self, var: &Var, extent: i64) -> Result<()> {
        let idx = self
            .vvar_index(var)
            .ok_or_else(|| Error::UnknownVar(var.name().to_owned()))?;
        self.vdims[idx] = extent;
        Ok(())
    }

    pub fn set_tdim(&mut self, idx: usize, expr: impl Into<Expr>, mask: Option<Expr>) {
        self.tdims[idx] = TDim {
            expr: expr.into(),
            mask,
        };
    }

    /// Adds `x < true_dims[i]` masks to target dims that map directly to
    /// a virtual dim whose (padded) extent exceeds the tensor's extent.
    pub fn set_tmasks(&mut self, true_dims: &[i64]) {
        for i in 0..self.tdims.len() {
            let Expr::Var(var) = &self.tdims[i].expr else {
                continue;
            };
            let Some(vidx) = self.vvar_index(var) else {
                continue;
            };
            if self.vdims[vidx] > true_dims[i] {
                let bound = placeholder_var().expr().lt(true_dims[i]);
                self.tdims[i].mask = Some(match self.tdims[i].mask.take() {
                    Some(mask) => mask & bound,
                    None => bound,
                });
            }
        }
    }

    pub fn has_tmask(&self, idx: usize) -> bool {
        self.tdims[idx].mask.is_some()
    }

    /// Bit `i` is set when target dim `i` needs a runtime bound check.
    pub fn bound_check_mask(&self) -> u32 {
        (0..self.tdims.len())
            .filter(|&i| self.has_tmask(i))
            .fold(0, |mask, i| mask | (1 << i))
    }

    /// Restricts the view to a tile: `starts[i]..starts[i] + extents[i]`
    /// along each virtual dim. Coordinates of the sub-view are relative
    /// to the tile origin.
    pub fn create_sub_view(&self, starts: &[Expr], extents: &[i64]) -> View {
        let vbounds = self
            .vdims
            .iter()
            .zip(extents)
            .zip(&self.vbounds)
            .map(|((&full, &ext), &prev)| {
                if ext < full && full % ext != 0 {
                    Some(full)
                } else {
                    prev
                }
            })
            .collect();
        View {
            vvars: self.vvars.clone(),
            vdims: extents.to_vec(),
            vstart: starts
                .iter()
                .zip(&self.vstart)
                .map(|(s, prev)| prev.clone() + s.clone())
                .collect(),
            vbounds,
            tdims: self.tdims.clone(),
            tlayout: self.tlayout.clone(),
        }
    }

    /// Absolute virtual coordinates for tile-relative ones.
    fn absolute(&self, coords: &[Expr]) -> Vec<Expr> {
        assert_eq!(coords.len(), self.vvars.len(), "view rank mismatch");
        self.vstart
            .iter()
            .zip(coords)
            .map(|(start, c)| start.clone() + c.clone())
            .collect()
    }

    fn substitute(&self, expr: &Expr, abs: &[Expr]) -> Expr {
        self.vvars
            .iter()
            .zip(abs)
            .fold(expr.clone(), |e, (var, value)| e.substitute(var, value))
    }

    /// Target coordinates at the given tile-relative virtual coordinates.
    pub fn target_coords(&self, coords: &[Expr]) -> Vec<Expr> {
        let abs = self.absolute(coords);
        self.tdims
            .iter()
            .map(|t| self.substitute(&t.expr, &abs))
            .collect()
    }

    /// Element offset in the target layout.
    pub fn offset_at(&self, coords: &[Expr]) -> Expr {
        self.tlayout.offset_expr(&self.target_coords(coords))
    }

    /// Conjunction of all masks at the given coordinates, or `None`
    /// if every access is in bounds.
    pub fn mask_at(&self, coords: &[Expr]) -> Option<Expr> {
        let abs = self.absolute(coords);
        let tcoords = self.target_coords(coords);
        let tmasks = self
            .tdims
            .iter()
            .zip(&tcoords)
            .filter_map(|(t, c)| {
                t.mask
                    .as_ref()
                    .map(|m| m.clone().substitute(placeholder_var(), c))
            });
        let vmasks = self
            .vbounds
            .iter()
            .zip(&abs)
            .filter_map(|(b, c)| b.map(|bound| c.clone().lt(bound)));
        tmasks.chain(vmasks).reduce(|a, b| a & b)
    }
}

/// Builds views of post-op operands aligned with the pooling
/// destination view.
#[derive(Debug)]
pub struct PostOpViewMapper<'a> {
    cp_view: &'a View,
    ndims: usize,
}

impl<'a> PostOpViewMapper<'a> {
    /// `ndims` is the rank of the pooling operation before
    /// normalization (batch + channel + spatial dims).
    pub fn new(cp_view: &'a View, ndims: usize) -> Self {
        Self { cp_view, ndims }
    }

    pub fn cp_view(&self) -> &View {
        self.cp_view
    }

    /// View of a tensor operand.
    pub fn create_view(&self, md: &MemoryDesc) -> Result<View> {
        let cp_ndims = self.cp_view.ntdims();
        let canonical = canonicalize(md, self.ndims);
        if canonical.layout.ndims() != cp_ndims {
            return Err(Error::RankMismatch {
                expected: cp_ndims,
                found: canonical.layout.ndims(),
            });
        }
        let pad_dims = canonical.layout.dims();
        let cp_dims = self.cp_view.tlayout().dims();
        let mut bound_check_mask = 0u32;
        for i in 0..cp_ndims {
            if canonical.dims[i] == 1 {
                continue;
            }
            if pad_dims[i] != cp_dims[i] || self.cp_view.has_tmask(i) {
                bound_check_mask |= 1 << i;
            }
        }
        Ok(self.aligned_view(canonical.layout, &canonical.dims, bound_check_mask))
    }

    /// View of a non-tensor operand (e.g. per-channel scales) given as a
    /// mask over the original dimensions: masked dims span the
    /// destination extent, the others are broadcast.
    pub fn create_mask_view(&self, ty: Type, mask: u32) -> View {
        let mask = normalize_mask(mask, self.ndims);
        let cp_dims = self.cp_view.tlayout().dims();
        let dims: Vec<i64> = (0..cp_dims.len())
            .map(|i| if mask & (1 << i) != 0 { cp_dims[i] } else { 1 })
            .collect();
        let order: Vec<usize> = (0..dims.len()).rev().collect();
        let layout = Layout::dense(ty.data_type, &dims, &order);
        let bound_check_mask = (0..dims.len())
            .filter(|&i| dims[i] != 1 && self.cp_view.has_tmask(i))
            .fold(0, |m, i| m | (1 << i));
        self.aligned_view(layout, &dims, bound_check_mask)
    }

    fn aligned_view(&self, layout: Layout, dims: &[i64], bound_check_mask: u32) -> View {
        let mut view = View::new(self.cp_view.vvars().to_vec(), layout);
        view.vdims = self.cp_view.vdims().to_vec();
        let x = placeholder_var().expr();
        for (i, var) in self.cp_view.vvars().iter().enumerate().take(dims.len()) {
            let expr = if dims[i] == 1 {
                Expr::Int(0)
            } else {
                var.expr()
            };
            let mask = (bound_check_mask & (1 << i) != 0).then(|| x.clone().lt(dims[i]));
            view.set_tdim(i, expr, mask);
        }
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon_ir::DataType;
    use rstest::rstest;

    #[rstest]
    #[case(&[2, 16, 9], &[2, 16, 1, 1, 9])]
    #[case(&[2, 16, 4, 9], &[2, 16, 1, 4, 9])]
    #[case(&[2, 16, 3, 4, 5], &[2, 16, 3, 4, 5])]
    #[case(&[2, 16, 3, 4, 5, 6], &[2, 16, 3, 4, 30])]
    #[case(&[2, 16, 3, 4, 5, 6, 7], &[2, 16, 3, 4, 210])]
    fn spatial_normalization(#[case] dims: &[i64], #[case] expected: &[i64]) {
        assert_eq!(spatials_to_3d(dims), expected);
    }

    #[test]
    fn folding_preserves_volume() {
        let dims = [1, 1, 2, 3, 4, 12, 9];
        let out = spatials_to_3d(&dims);
        assert_eq!(out.len(), CANONICAL_NDIMS);
        assert_eq!(out.iter().product::<i64>(), dims.iter().product::<i64>());
    }

    #[rstest]
    // Per-channel mask on a 2D op (n, c, h, w).
    #[case(0b0010, 4, 0b00010)]
    // Spatial mask on a 1D op lands on the last slot.
    #[case(0b100, 3, 0b10000)]
    // Masks on merged trailing dims of a 4D op collapse into slot 4.
    #[case(0b100000, 6, 0b10000)]
    #[case(0b000100, 6, 0b00100)]
    fn mask_normalization(#[case] mask: u32, #[case] ndims: usize, #[case] expected: u32) {
        assert_eq!(normalize_mask(mask, ndims), expected);
    }

    #[test]
    fn canonical_layout_keeps_offsets() {
        let md = MemoryDesc::new(DataType::F32, &[2, 16, 6, 7], "aBcd8b").unwrap();
        let canonical = canonicalize(&md, 4);
        assert_eq!(canonical.dims, vec![2, 16, 1, 6, 7]);
        assert_eq!(canonical.layout.dims(), vec![2, 16, 1, 6, 7]);
        assert_eq!(
            canonical.layout.offset_of(&[1, 9, 0, 2, 3]),
            md.layout.offset_of(&[1, 9, 2, 3])
        );
    }

    #[test]
    fn sub_view_masks() {
        let n = Var::s32("n");
        let k = Var::s32("k");
        let layout = Layout::dense(DataType::F32, &[10], &[0]);
        let mut view = View::new(vec![n.clone(), k.clone()], layout);
        view.set_vdim(&n, 4).unwrap();
        view.set_vdim(&k, 3).unwrap();
        let x = placeholder_var().expr();
        view.set_tdim(0, &n * 2 - 1 + k.expr(), Some(x.clone().ge(0) & x.lt(10)));
        assert_eq!(view.bound_check_mask(), 0b1);

        let sub = view.create_sub_view(&[n.expr(), Expr::Int(0)], &[1, 2]);
        let mask = sub.mask_at(&[Expr::Int(0), Expr::Int(1)]).unwrap();
        let eval = |nv: i64| mask.eval_int(&|v: &Var| (v == &n).then_some(nv));
        // n=0: coordinate 0 in range; window overhang k < 3 holds.
        assert_eq!(eval(0), Some(1));
        // n=5: coordinate 10 out of range.
        assert_eq!(eval(5), Some(0));
    }

    #[test]
    fn post_op_views_skip_broadcast_dims() {
        let vars: Vec<Var> = ["mb", "oc", "od", "oh", "ow"].iter().map(Var::s32).collect();
        let dst = Layout::from_tag(DataType::F32, &[2, 16, 1, 4, 4], "aBcde16b").unwrap();
        let mut cp = View::new(vars.clone(), dst);
        for (i, v) in vars.iter().enumerate() {
            cp.set_vdim(v, [2, 16, 1, 4, 4][i]).unwrap();
            cp.set_tdim(i, v.expr(), None);
        }
        let mapper = PostOpViewMapper::new(&cp, 4);
        let bias = MemoryDesc::new(DataType::F32, &[1, 16], "ab").unwrap();
        let view = mapper.create_view(&bias).unwrap();
        assert_eq!(view.ntdims(), CANONICAL_NDIMS);
        assert_eq!(view.tdims()[0].expr, Expr::Int(0));
        assert_eq!(view.tdims()[1].expr, vars[1].expr());
        assert_eq!(view.bound_check_mask(), 0);

        let scales = mapper.create_mask_view(Type::f32(), 0b10);
        assert_eq!(scales.tlayout().dims(), vec![1, 16, 1, 1, 1]);
    }
}
