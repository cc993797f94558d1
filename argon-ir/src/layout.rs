//! Physical memory layouts.
//!
//! A layout is a list of blocks ordered innermost first. Each block
//! covers a factor of one logical dimension with a stride in elements.
//! Blocked formats such as `aBcd16b` (16 channels innermost) are
//! expressed by giving one dimension several blocks.

use crate::{data_type::DataType, expr::Expr};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("format tag `{tag}` does not describe {ndims} dimensions")]
    TagRank { tag: String, ndims: usize },
    #[error("malformed format tag `{0}`")]
    MalformedTag(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Block {
    pub dim: usize,
    pub size: i64,
    pub stride: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layout {
    data_type: DataType,
    ndims: usize,
    blocks: Vec<Block>,
    offset: i64,
}

impl Layout {
    pub fn new(data_type: DataType, ndims: usize, blocks: Vec<Block>, offset: i64) -> Self {
        debug_assert!(blocks.iter().all(|b| b.dim < ndims));
        Self {
            data_type,
            ndims,
            blocks,
            offset,
        }
    }

    /// Densely packed layout; `order` lists dimensions innermost first.
    pub fn dense(data_type: DataType, dims: &[i64], order: &[usize]) -> Self {
        let mut stride = 1;
        let blocks = order
            .iter()
            .map(|&dim| {
                let block = Block {
                    dim,
                    size: dims[dim],
                    stride,
                };
                stride *= dims[dim];
                block
            })
            .collect();
        Self::new(data_type, dims.len(), blocks, 0)
    }

    /// Parses a oneDNN-style format tag, e.g. `abcd` (plain),
    /// `acdb` (channels last) or `aBcd16b` (16-channel blocked).
    ///
    /// Letters before the first digit give the outer order from
    /// outermost to innermost; an uppercase letter marks a dimension
    /// with inner blocks, which follow as `<size><letter>` pairs,
    /// again outermost first.
    pub fn from_tag(data_type: DataType, dims: &[i64], tag: &str) -> Result<Self, LayoutError> {
        let ndims = dims.len();
        let malformed = || LayoutError::MalformedTag(tag.to_owned());
        let dim_of = |c: char| -> Result<usize, LayoutError> {
            let idx = (c.to_ascii_lowercase() as usize).wrapping_sub('a' as usize);
            if idx < ndims {
                Ok(idx)
            } else {
                Err(LayoutError::TagRank {
                    tag: tag.to_owned(),
                    ndims,
                })
            }
        };

        let split = tag.find(|c: char| c.is_ascii_digit()).unwrap_or(tag.len());
        let (outer, inner) = tag.split_at(split);

        let outer_dims = outer.chars().map(dim_of).collect::<Result<Vec<_>, _>>()?;
        if outer_dims.len() != ndims {
            return Err(LayoutError::TagRank {
                tag: tag.to_owned(),
                ndims,
            });
        }

        let mut inner_blocks = Vec::new();
        let mut num = String::new();
        for c in inner.chars() {
            if c.is_ascii_digit() {
                num.push(c);
            } else {
                let size: i64 = num.parse().map_err(|_| malformed())?;
                inner_blocks.push((dim_of(c)?, size));
                num.clear();
            }
        }
        if !num.is_empty() {
            return Err(malformed());
        }

        let mut inner_product = vec![1i64; ndims];
        for &(dim, size) in &inner_blocks {
            inner_product[dim] *= size;
        }

        let mut blocks = Vec::new();
        let mut stride = 1;
        for &(dim, size) in inner_blocks.iter().rev() {
            blocks.push(Block { dim, size, stride });
            stride *= size;
        }
        for &dim in outer_dims.iter().rev() {
            let (a, b) = (dims[dim], inner_product[dim]);
            let (q, r) = (a / b, a % b);
            let ceil = if (r > 0 && b > 0) || (r < 0 && b < 0) { q + 1 } else { q };
            let size = ceil.max(1);
            blocks.push(Block { dim, size, stride });
            stride *= size;
        }

        Ok(Self::new(data_type, ndims, blocks, 0))
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn ndims(&self) -> usize {
        self.ndims
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Padded extent of each dimension.
    pub fn dims(&self) -> Vec<i64> {
        let mut dims = vec![1; self.ndims];
        for block in &self.blocks {
            dims[block.dim] *= block.size;
        }
        dims
    }

    pub fn dim(&self, dim: usize) -> i64 {
        self.dims()[dim]
    }

    pub fn elems(&self) -> i64 {
        self.blocks.iter().map(|b| b.size).product()
    }

    /// Size in bytes of the memory spanned by the layout.
    pub fn size(&self) -> i64 {
        let span = self
            .blocks
            .iter()
            .map(|b| (b.size - 1) * b.stride)
            .sum::<i64>()
            + 1;
        span * self.data_type.size() as i64
    }

    #[must_use]
    pub fn retype(&self, data_type: DataType) -> Self {
        Self {
            data_type,
            ..self.clone()
        }
    }

    /// Stride in elements between consecutive coordinates of `dim`.
    /// Returns 0 for dimensions that only have unit blocks.
    pub fn inner_stride(&self, dim: usize) -> i64 {
        self.blocks
            .iter()
            .find(|b| b.dim == dim && b.size > 1)
            .map_or(0, |b| b.stride)
    }

    /// Dimension of the innermost non-unit block.
    pub fn innermost_dim(&self) -> Option<usize> {
        self.non_unit_blocks().next().map(|b| b.dim)
    }

    /// Dimension of the second innermost non-unit block.
    pub fn second_innermost_dim(&self) -> Option<usize> {
        self.non_unit_blocks().nth(1).map(|b| b.dim)
    }

    fn non_unit_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.size > 1)
    }

    /// Element offset of the given coordinates as an expression.
    pub fn offset_expr(&self, coords: &[Expr]) -> Expr {
        assert_eq!(coords.len(), self.ndims, "coordinate rank mismatch");
        let mut remaining: Vec<Expr> = coords.to_vec();
        let mut outermost = vec![None; self.ndims];
        for (i, block) in self.blocks.iter().enumerate() {
            outermost[block.dim] = Some(i);
        }

        let mut offset = Expr::Int(self.offset);
        for (i, block) in self.blocks.iter().enumerate() {
            let coord = remaining[block.dim].clone();
            let term = if outermost[block.dim] == Some(i) {
                coord
            } else {
                remaining[block.dim] = coord.clone() / block.size;
                coord % block.size
            };
            offset = offset + term * block.stride;
        }
        offset
    }

    /// Element offset of constant coordinates.
    pub fn offset_of(&self, coords: &[i64]) -> i64 {
        assert_eq!(coords.len(), self.ndims, "coordinate rank mismatch");
        let mut remaining = coords.to_vec();
        let mut outermost = vec![None; self.ndims];
        for (i, block) in self.blocks.iter().enumerate() {
            outermost[block.dim] = Some(i);
        }
        let mut offset = self.offset;
        for (i, block) in self.blocks.iter().enumerate() {
            let coord = remaining[block.dim];
            let term = if outermost[block.dim] == Some(i) {
                coord
            } else {
                remaining[block.dim] = coord / block.size;
                coord % block.size
            };
            offset += term * block.stride;
        }
        offset
    }

    /// Remaps dimension indices, producing a layout of rank `ndims`.
    /// Dimensions not targeted by any block are broadcast (extent 1).
    #[must_use]
    pub fn map_dims(&self, ndims: usize, f: impl Fn(usize) -> usize) -> Self {
        let blocks = self
            .blocks
            .iter()
            .map(|b| Block {
                dim: f(b.dim),
                ..*b
            })
            .collect();
        Self::new(self.data_type, ndims, blocks, self.offset)
    }

    /// Iterates over the starting coordinates of `tile`-shaped pieces
    /// of the layout's dimensions, last dimension fastest.
    pub fn for_each_tile(&self, tile: &[i64], mut f: impl FnMut(&[i64])) {
        let dims = self.dims();
        assert_eq!(tile.len(), dims.len());
        let counts: Vec<i64> = dims.iter().zip(tile).map(|(d, t)| d / t).collect();
        let total: i64 = counts.iter().product();
        let mut coords = vec![0i64; dims.len()];
        for mut linear in 0..total {
            for i in (0..dims.len()).rev() {
                coords[i] = (linear % counts[i]) * tile[i];
                linear /= counts[i];
            }
            f(&coords);
        }
    }
}

impl Display for Layout {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.data_type)?;
        for block in self.blocks.iter().rev() {
            let letter = (b'a' + block.dim as u8) as char;
            write!(f, " {letter}{}", block.size)?;
        }
        Ok(())
    }
}

/// Memory descriptor of a tensor operand: logical extents plus
/// the physical layout (whose extents may be padded).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryDesc {
    pub dims: Vec<i64>,
    pub layout: Layout,
}

impl MemoryDesc {
    pub fn new(data_type: DataType, dims: &[i64], tag: &str) -> Result<Self, LayoutError> {
        Ok(Self {
            dims: dims.to_vec(),
            layout: Layout::from_tag(data_type, dims, tag)?,
        })
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn padded_dims(&self) -> Vec<i64> {
        self.layout.dims()
    }

    pub fn data_type(&self) -> DataType {
        self.layout.data_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn blocked_tag_pads_channels() {
        let layout = Layout::from_tag(DataType::F32, &[2, 20, 4, 4], "aBcd16b").unwrap();
        assert_eq!(layout.dims(), vec![2, 32, 4, 4]);
        assert_eq!(layout.innermost_dim(), Some(1));
        assert_eq!(layout.inner_stride(1), 1);
        assert_eq!(layout.inner_stride(3), 16);
        // n=1, c=17, h=2, w=3
        assert_eq!(
            layout.offset_of(&[1, 17, 2, 3]),
            (2 * 4 * 4 * 16) + (4 * 4 * 16) + 2 * (4 * 16) + 3 * 16 + 1
        );
    }

    #[rstest]
    #[case("abcd", 60 + 2 * 20 + 3 * 5 + 4)]
    #[case("acdb", 60 + 2 + 3 * 15 + 4 * 3)]
    fn plain_offsets(#[case] tag: &str, #[case] expected: i64) {
        let layout = Layout::from_tag(DataType::F32, &[2, 3, 4, 5], tag).unwrap();
        assert_eq!(layout.offset_of(&[1, 2, 3, 4]), expected);
    }

    #[test]
    fn bad_tags_are_rejected() {
        assert!(matches!(
            Layout::from_tag(DataType::F32, &[2, 3], "abc"),
            Err(LayoutError::TagRank { .. })
        ));
        assert!(matches!(
            Layout::from_tag(DataType::F32, &[2, 3], "aB16"),
            Err(LayoutError::MalformedTag(_))
        ));
    }

    #[test]
    fn tiles_cover_dims() {
        let layout = Layout::dense(DataType::F32, &[2, 16], &[1, 0]);
        let mut starts = Vec::new();
        layout.for_each_tile(&[1, 8], |c| starts.push(c.to_vec()));
        assert_eq!(starts, vec![vec![0, 0], vec![0, 8], vec![1, 0], vec![1, 8]]);
    }
}
