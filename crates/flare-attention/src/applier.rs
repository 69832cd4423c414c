//! Mask appliers: load a mask sub-block into fast memory and fuse it into
//! the score (or probability) block in place.
//!
//! Source offsets are row-major element offsets derived from the block
//! coordinates; broadcast batch/head axes contribute nothing.

use flare_core::Tensor;
use flare_kernels::{FastMemory, Precision, Tile};

use crate::problem::{AttentionInputs, ProblemShape};
use crate::tiling::TilingPara;

/// Multiplier applied to attention-mask values before they are added to the
/// scores; large enough to zero a probability, small enough for f16.
pub const MASK_FILL_VALUE: f32 = -10000.0;

/// Initial running row max in standard precision (the f16 minimum).
pub const PAD_FILL_VALUE: f32 = -65504.0;

/// Coordinates of one (batch-head, query-block, key-block) score block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIndex {
    pub batch_head: usize,
    pub query_block: usize,
    pub key_block: usize,
}

/// Offset of block `block_idx` (of height `block_height`) of batch-head
/// `batch_head` in a dense `[batch_heads, height, width]` tensor.
pub fn gm_offset(batch_head: usize, height: usize, width: usize, block_height: usize, block_idx: usize) -> usize {
    batch_head * height * width + block_idx * block_height * width
}

/// Offset of the dropout sub-block for `block` in a dense
/// `[batch, heads, query_len, key_len]` mask.
pub fn dropout_offset(block: BlockIndex, tiling: &TilingPara, query_len: usize, key_len: usize) -> usize {
    gm_offset(block.batch_head, query_len, key_len, tiling.br, block.query_block) + block.key_block * tiling.bc
}

/// Offset of the attention-mask sub-block for `block`, honouring batch/head broadcast.
pub fn attn_mask_offset(layout: &MaskLayout, block: BlockIndex, tiling: &TilingPara) -> usize {
    layout.offset(block.batch_head, block.query_block * tiling.br, block.key_block * tiling.bc)
}

/// Offset of the alibi bias row slice for `block`, honouring batch/head broadcast.
pub fn alibi_offset(layout: &MaskLayout, block: BlockIndex, tiling: &TilingPara) -> usize {
    layout.offset(block.batch_head, 0, block.key_block * tiling.bc)
}

/// Broadcast-aware strides of a mask tensor viewed as `[batch, heads, rows, key_len]`.
///
/// Rank-3 masks are read as `[batch, 1, rows, key_len]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskLayout {
    pub heads: usize,
    pub batch_stride: usize,
    pub head_stride: usize,
    pub row_stride: usize,
}

impl MaskLayout {
    /// Layout of a mask with dims `dims` for a problem with `heads` heads.
    /// `dims` must already be validated (rank 3 or 4).
    pub fn new(dims: &[usize], heads: usize) -> Self {
        let (b, h, rows, cols) = match *dims {
            [b, rows, cols] => (b, 1, rows, cols),
            [b, h, rows, cols] => (b, h, rows, cols),
            _ => (1, 1, 1, dims.last().copied().unwrap_or(0)),
        };
        let broadcast = |n: usize, stride: usize| if n == 1 { 0 } else { stride };
        Self {
            heads,
            batch_stride: broadcast(b, h * rows * cols),
            head_stride: broadcast(h, rows * cols),
            row_stride: broadcast(rows, cols),
        }
    }

    /// Element offset of `(row, col)` for batch-head `batch_head`.
    pub fn offset(&self, batch_head: usize, row: usize, col: usize) -> usize {
        (batch_head / self.heads) * self.batch_stride
            + (batch_head % self.heads) * self.head_stride
            + row * self.row_stride
            + col
    }
}

/// One optional mask stage of the compute engine.
pub trait MaskApplier {
    /// Element offset of the sub-block for `block` in the source tensor.
    fn offset(&self, block: BlockIndex, tiling: &TilingPara) -> usize;

    /// Fuse the `rows × cols` sub-block starting at `offset` into `dst`.
    /// Elements of `dst` outside that extent are left untouched.
    fn apply(&self, mem: &FastMemory, dst: &mut Tile<'_>, offset: usize, rows: usize, cols: usize);
}

/// Load a `rows × cols` sub-block of `source` into a scoped tile with row
/// stride `stride`, rounded to the working precision.
///
/// The tile is charged at the wider of the source and working element size.
#[allow(clippy::too_many_arguments)]
fn load_sub_block<'m>(
    mem: &'m FastMemory,
    name: &'static str,
    source: &Tensor,
    offset: usize,
    source_row_stride: usize,
    rows: usize,
    cols: usize,
    stride: usize,
    precision: Precision,
) -> Tile<'m> {
    let elem_bytes = source.dtype().element_size().max(precision.element_size());
    let mut tile = mem.alloc(name, rows, stride, elem_bytes);
    for r in 0..rows {
        let row = &mut tile.row_mut(r)[..cols];
        source.copy_to_f32(offset + r * source_row_stride, row);
        precision.round_slice(row);
    }
    tile
}

/// `S += mask * MASK_FILL_VALUE`.
#[derive(Debug, Clone, Copy)]
pub struct AttentionMaskApplier<'a> {
    mask: &'a Tensor,
    layout: MaskLayout,
    precision: Precision,
}

impl<'a> AttentionMaskApplier<'a> {
    pub fn new(mask: &'a Tensor, heads: usize, precision: Precision) -> Self {
        Self {
            mask,
            layout: MaskLayout::new(mask.dims(), heads),
            precision,
        }
    }
}

impl MaskApplier for AttentionMaskApplier<'_> {
    fn offset(&self, block: BlockIndex, tiling: &TilingPara) -> usize {
        attn_mask_offset(&self.layout, block, tiling)
    }

    fn apply(&self, mem: &FastMemory, dst: &mut Tile<'_>, offset: usize, rows: usize, cols: usize) {
        let p = self.precision;
        let mut tile = load_sub_block(
            mem,
            "attn_mask",
            self.mask,
            offset,
            self.layout.row_stride,
            rows,
            cols,
            dst.cols(),
            p,
        );
        for r in 0..rows {
            let mask_row = &mut tile.row_mut(r)[..cols];
            for x in mask_row.iter_mut() {
                *x = p.round(*x * MASK_FILL_VALUE);
            }
            flare_kernels::row_ops::add_row(&mut dst.row_mut(r)[..cols], mask_row, p);
        }
    }
}

/// `P *= dropout`, with the mask pre-scaled by `1 / keep_prob`.
#[derive(Debug, Clone, Copy)]
pub struct DropoutMaskApplier<'a> {
    mask: &'a Tensor,
    query_len: usize,
    key_len: usize,
    precision: Precision,
}

impl<'a> DropoutMaskApplier<'a> {
    pub fn new(mask: &'a Tensor, query_len: usize, key_len: usize, precision: Precision) -> Self {
        Self {
            mask,
            query_len,
            key_len,
            precision,
        }
    }
}

impl MaskApplier for DropoutMaskApplier<'_> {
    fn offset(&self, block: BlockIndex, tiling: &TilingPara) -> usize {
        dropout_offset(block, tiling, self.query_len, self.key_len)
    }

    fn apply(&self, mem: &FastMemory, dst: &mut Tile<'_>, offset: usize, rows: usize, cols: usize) {
        let tile = load_sub_block(
            mem,
            "dropout_mask",
            self.mask,
            offset,
            self.key_len,
            rows,
            cols,
            dst.cols(),
            self.precision,
        );
        for r in 0..rows {
            flare_kernels::row_ops::mul_row(&mut dst.row_mut(r)[..cols], &tile.row(r)[..cols], self.precision);
        }
    }
}

/// `S += bias`, one bias row broadcast over every query row.
#[derive(Debug, Clone, Copy)]
pub struct AlibiApplier<'a> {
    bias: &'a Tensor,
    layout: MaskLayout,
    precision: Precision,
}

impl<'a> AlibiApplier<'a> {
    pub fn new(bias: &'a Tensor, heads: usize, precision: Precision) -> Self {
        Self {
            bias,
            layout: MaskLayout::new(bias.dims(), heads),
            precision,
        }
    }
}

impl MaskApplier for AlibiApplier<'_> {
    fn offset(&self, block: BlockIndex, tiling: &TilingPara) -> usize {
        alibi_offset(&self.layout, block, tiling)
    }

    fn apply(&self, mem: &FastMemory, dst: &mut Tile<'_>, offset: usize, rows: usize, cols: usize) {
        let tile = load_sub_block(mem, "alibi", self.bias, offset, 0, 1, cols, dst.cols(), self.precision);
        let bias = &tile.row(0)[..cols];
        for r in 0..rows {
            flare_kernels::row_ops::add_row(&mut dst.row_mut(r)[..cols], bias, self.precision);
        }
    }
}

/// The optional mask stages present for one launch, in application order.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaskStages<'a> {
    pub alibi: Option<AlibiApplier<'a>>,
    pub attn: Option<AttentionMaskApplier<'a>>,
    pub dropout: Option<DropoutMaskApplier<'a>>,
}

impl<'a> MaskStages<'a> {
    pub fn from_inputs(inputs: &AttentionInputs<'a>, problem: &ProblemShape, precision: Precision) -> Self {
        Self {
            alibi: inputs
                .alibi_mask
                .map(|t| AlibiApplier::new(t, problem.heads, precision)),
            attn: inputs
                .attn_mask
                .map(|t| AttentionMaskApplier::new(t, problem.heads, precision)),
            dropout: inputs
                .dropout_mask
                .map(|t| DropoutMaskApplier::new(t, problem.query_len, problem.key_len, precision)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flare_core::DType;

    fn tiling() -> TilingPara {
        TilingPara::from_blocks(48, 64, 16, 32).unwrap()
    }

    #[test]
    fn test_gm_offset() {
        // [bh=2][48 rows][32 cols]: block 1 of head 1 starts at row 48 + 16
        assert_eq!(gm_offset(1, 48, 32, 16, 1), (48 + 16) * 32);
    }

    #[test]
    fn test_dropout_offset() {
        let b = BlockIndex { batch_head: 3, query_block: 2, key_block: 1 };
        assert_eq!(dropout_offset(b, &tiling(), 48, 64), 3 * 48 * 64 + 2 * 16 * 64 + 32);
    }

    #[test]
    fn test_attn_mask_broadcast_over_batch_heads() {
        let shared = MaskLayout::new(&[1, 48, 64], 4);
        let per_batch = MaskLayout::new(&[2, 48, 64], 4);
        let b = BlockIndex { batch_head: 6, query_block: 1, key_block: 1 };
        let local = 16 * 64 + 32;
        assert_eq!(attn_mask_offset(&shared, b, &tiling()), local);
        // batch 1, every head of that batch shares the mask
        assert_eq!(attn_mask_offset(&per_batch, b, &tiling()), 48 * 64 + local);

        let per_head = MaskLayout::new(&[2, 4, 48, 64], 4);
        assert_eq!(attn_mask_offset(&per_head, b, &tiling()), (4 + 2) * 48 * 64 + local);
    }

    #[test]
    fn test_alibi_offset() {
        let b = BlockIndex { batch_head: 5, query_block: 2, key_block: 1 };
        let full = MaskLayout::new(&[2, 3, 1, 64], 3);
        assert_eq!(alibi_offset(&full, b, &tiling()), 5 * 64 + 32);
        let shared_batch = MaskLayout::new(&[1, 3, 1, 64], 3);
        assert_eq!(alibi_offset(&shared_batch, b, &tiling()), 2 * 64 + 32);
    }

    #[test]
    fn test_attention_mask_adds_fill_value() {
        let mem = FastMemory::new(1 << 16);
        // 2x2 mask in a 2x16 padded tile; masked at (0, 1)
        let mask = Tensor::from_f32_as(&[0.0, 1.0, 0.0, 0.0], &[1, 2, 2], DType::F16);
        let applier = AttentionMaskApplier::new(&mask, 1, Precision::Half);
        let mut s = mem.alloc("s", 2, 16, 4);
        s.fill(1.0);
        applier.apply(&mem, &mut s, 0, 2, 2);
        assert_eq!(s.row(0)[0], 1.0);
        // 1 - 10000 rounds to -10000 in f16
        assert_eq!(s.row(0)[1], MASK_FILL_VALUE);
        assert_eq!(s.row(1)[1], 1.0);
        // outside the logical extent
        assert_eq!(s.row(0)[2], 1.0);
        // mask tile released
        assert_eq!(mem.in_use(), 2 * 16 * 4);
    }

    #[test]
    fn test_dropout_multiplies_probabilities() {
        let mem = FastMemory::new(1 << 16);
        let mask = Tensor::from_f32(&[2.0, 0.0, 0.0, 2.0], &[1, 1, 2, 2]);
        let applier = DropoutMaskApplier::new(&mask, 2, 2, Precision::Full);
        let mut p = mem.alloc("p", 2, 16, 4);
        p.fill(0.25);
        applier.apply(&mem, &mut p, 0, 2, 2);
        assert_eq!(&p.row(0)[..2], &[0.5, 0.0]);
        assert_eq!(&p.row(1)[..2], &[0.0, 0.5]);
        // f32 mask charged at 4 bytes per element
        assert_eq!(mem.peak(), 2 * 2 * 16 * 4);
    }

    #[test]
    fn test_alibi_broadcasts_row() {
        let mem = FastMemory::new(1 << 16);
        let bias = Tensor::from_f32(&[0.0, -1.0, -2.0], &[1, 1, 1, 3]);
        let applier = AlibiApplier::new(&bias, 1, Precision::Full);
        let mut s = mem.alloc("s", 2, 16, 4);
        applier.apply(&mem, &mut s, 0, 2, 3);
        for r in 0..2 {
            assert_eq!(&s.row(r)[..3], &[0.0, -1.0, -2.0]);
        }
    }
}
