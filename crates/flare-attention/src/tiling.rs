//! Tiling strategies: choose query/key block sizes for a problem.
//!
//! A strategy is a pure function `(query_len, key_len, head_dim) -> TilingPara`.
//! The default [`GreedyTiling`] picks the largest aligned blocks whose
//! working set fits the per-core fast-memory budget.

use flare_core::{FlareError, Result};
use flare_kernels::{align_up, BLOCK_ALIGN};

/// Block-size parameters of one kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TilingPara {
    /// Query block height (Br).
    pub br: usize,
    /// Height of the trailing query block.
    pub last_br: usize,
    /// Key block width (Bc).
    pub bc: usize,
    /// Width of the trailing key block.
    pub last_bc: usize,
    /// Number of query blocks (Tr).
    pub tr: usize,
    /// Number of key blocks (Tc).
    pub tc: usize,
}

impl TilingPara {
    /// Split `query_len` into blocks of `br` rows and `key_len` into blocks
    /// of `bc` columns; the trailing blocks take the remainder.
    pub fn from_blocks(query_len: usize, key_len: usize, br: usize, bc: usize) -> Result<Self> {
        if br == 0 || bc == 0 {
            return Err(FlareError::config("block sizes must be non-zero"));
        }
        let tr = query_len.div_ceil(br);
        let tc = key_len.div_ceil(bc);
        if tr == 0 || tc == 0 {
            return Err(FlareError::config("sequence lengths must be non-zero"));
        }
        let para = Self {
            br,
            last_br: query_len - (tr - 1) * br,
            bc,
            last_bc: key_len - (tc - 1) * bc,
            tr,
            tc,
        };
        para.validate(query_len, key_len)?;
        Ok(para)
    }

    /// Check the covering and alignment invariants against the sequence lengths.
    pub fn validate(&self, query_len: usize, key_len: usize) -> Result<()> {
        if self.tr == 0 || self.tc == 0 {
            return Err(FlareError::config("tiling has no blocks"));
        }
        if (self.tr - 1) * self.br + self.last_br != query_len {
            return Err(FlareError::config(format!(
                "query tiling {}x{} + {} does not cover {} rows",
                self.tr - 1,
                self.br,
                self.last_br,
                query_len
            )));
        }
        if (self.tc - 1) * self.bc + self.last_bc != key_len {
            return Err(FlareError::config(format!(
                "key tiling {}x{} + {} does not cover {} columns",
                self.tc - 1,
                self.bc,
                self.last_bc,
                key_len
            )));
        }
        if self.last_br == 0 || self.last_br > self.br || self.last_bc == 0 || self.last_bc > self.bc {
            return Err(FlareError::config("trailing block out of range"));
        }
        if (self.tr > 1 && self.br % BLOCK_ALIGN != 0) || (self.tc > 1 && self.bc % BLOCK_ALIGN != 0) {
            return Err(FlareError::config(format!(
                "non-trailing blocks must be multiples of {BLOCK_ALIGN} (got Br={}, Bc={})",
                self.br, self.bc
            )));
        }
        Ok(())
    }

    /// Height of query block `i` (the trailing block may be shorter).
    pub fn query_block_height(&self, i: usize) -> usize {
        if i + 1 == self.tr {
            self.last_br
        } else {
            self.br
        }
    }

    /// Width of key block `j` (the trailing block may be narrower).
    pub fn key_block_width(&self, j: usize) -> usize {
        if j + 1 == self.tc {
            self.last_bc
        } else {
            self.bc
        }
    }

    /// Tallest query block actually materialised.
    pub fn max_query_block(&self) -> usize {
        if self.tr == 1 {
            self.last_br
        } else {
            self.br
        }
    }

    /// Widest key block actually materialised.
    pub fn max_key_block(&self) -> usize {
        if self.tc == 1 {
            self.last_bc
        } else {
            self.bc
        }
    }
}

/// Pluggable block-size policy.
pub trait TilingStrategy {
    fn name(&self) -> &'static str;

    /// Choose block sizes. Pure and deterministic.
    fn tile(&self, query_len: usize, key_len: usize, head_dim: usize) -> Result<TilingPara>;
}

fn check_tileable(query_len: usize, key_len: usize, head_dim: usize) -> Result<()> {
    if query_len == 0 || key_len == 0 {
        return Err(FlareError::config(format!(
            "cannot tile empty sequences (query_len={query_len}, key_len={key_len})"
        )));
    }
    if head_dim == 0 || head_dim % BLOCK_ALIGN != 0 {
        return Err(FlareError::config(format!(
            "head dim {head_dim} must be a non-zero multiple of {BLOCK_ALIGN}; pad it and pass a dim mask"
        )));
    }
    Ok(())
}

/// Per-element byte costs of the fast-memory working set.
///
/// The peak working set of one task is the query tile, one key and one
/// value tile, the score/probability tile, the output accumulator, the row
/// max and row sum, plus the largest mask sub-block (mask stages are
/// scoped one at a time). All extents are padded to [`BLOCK_ALIGN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingSet {
    /// Bytes per Q/K/V element.
    pub input_bytes: usize,
    /// Bytes per score, probability, accumulator or statistic element.
    pub work_bytes: usize,
    /// Bytes per attention-mask element, if that mask is present.
    pub attn_mask_bytes: Option<usize>,
    /// Bytes per dropout-mask element, if that mask is present.
    pub dropout_mask_bytes: Option<usize>,
    /// Bytes per alibi element, if that mask is present.
    pub alibi_bytes: Option<usize>,
}

impl WorkingSet {
    /// Peak bytes for blocks of `br × bc` with head dim `head_dim`.
    pub fn bytes(&self, br: usize, bc: usize, head_dim: usize) -> usize {
        let (br, bc) = (align_up(br), align_up(bc));
        let q = br * head_dim * self.input_bytes;
        let kv = 2 * bc * head_dim * self.input_bytes;
        let scores = br * bc * self.work_bytes;
        let acc = br * head_dim * self.work_bytes;
        let stats = 2 * br * self.work_bytes;
        let mask = [
            self.attn_mask_bytes.map(|e| br * bc * e),
            self.dropout_mask_bytes.map(|e| br * bc * e),
            self.alibi_bytes.map(|e| bc * e),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0);
        q + kv + scores + acc + stats + mask
    }
}

/// Greedy max-block-under-budget strategy.
///
/// Starts from blocks covering each whole (aligned) sequence and shrinks
/// the larger dimension by one alignment unit until the working set fits;
/// on ties the query block shrinks first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GreedyTiling {
    pub working_set: WorkingSet,
    pub budget_bytes: usize,
}

impl GreedyTiling {
    pub fn new(working_set: WorkingSet, budget_bytes: usize) -> Self {
        Self {
            working_set,
            budget_bytes,
        }
    }
}

impl TilingStrategy for GreedyTiling {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn tile(&self, query_len: usize, key_len: usize, head_dim: usize) -> Result<TilingPara> {
        check_tileable(query_len, key_len, head_dim)?;

        let mut br = align_up(query_len);
        let mut bc = align_up(key_len);
        while self.working_set.bytes(br, bc, head_dim) > self.budget_bytes {
            if br <= BLOCK_ALIGN && bc <= BLOCK_ALIGN {
                return Err(FlareError::config(format!(
                    "no block size fits {} bytes of fast memory (head dim {head_dim} needs {} bytes at 16x16)",
                    self.budget_bytes,
                    self.working_set.bytes(BLOCK_ALIGN, BLOCK_ALIGN, head_dim)
                )));
            }
            if (br >= bc && br > BLOCK_ALIGN) || bc <= BLOCK_ALIGN {
                br -= BLOCK_ALIGN;
            } else {
                bc -= BLOCK_ALIGN;
            }
        }
        TilingPara::from_blocks(query_len, key_len, br, bc)
    }
}

/// Caller-chosen block sizes, e.g. to pin a tiling in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedTiling {
    pub query_block: usize,
    pub key_block: usize,
}

impl FixedTiling {
    pub fn new(query_block: usize, key_block: usize) -> Self {
        Self {
            query_block,
            key_block,
        }
    }
}

impl TilingStrategy for FixedTiling {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn tile(&self, query_len: usize, key_len: usize, head_dim: usize) -> Result<TilingPara> {
        check_tileable(query_len, key_len, head_dim)?;
        if self.query_block % BLOCK_ALIGN != 0 || self.key_block % BLOCK_ALIGN != 0 {
            return Err(FlareError::config(format!(
                "fixed blocks {}x{} must be multiples of {BLOCK_ALIGN}",
                self.query_block, self.key_block
            )));
        }
        TilingPara::from_blocks(query_len, key_len, self.query_block, self.key_block)
    }
}
