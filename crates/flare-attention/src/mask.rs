//! Mask builders: causal, sliding window, key padding, block window, ALiBi
//! bias rows and seeded dropout masks.
//!
//! Attention masks use 1.0 = masked, 0.0 = attend; the kernel scales them
//! by [`MASK_FILL_VALUE`](crate::applier::MASK_FILL_VALUE).

use flare_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::tiling::TilingPara;
use crate::window::Window;

fn build(batch: usize, query_len: usize, key_len: usize, dtype: DType, masked: impl Fn(usize, usize, usize) -> bool) -> Tensor {
    let mut data = vec![0.0f32; batch * query_len * key_len];
    for b in 0..batch {
        for i in 0..query_len {
            for j in 0..key_len {
                if masked(b, i, j) {
                    data[(b * query_len + i) * key_len + j] = 1.0;
                }
            }
        }
    }
    Tensor::from_f32_as(&data, &[batch, query_len, key_len], dtype)
}

/// Causal mask `[1, query_len, key_len]`: query `i` attends to keys `0..=i`.
pub fn causal_mask(query_len: usize, key_len: usize, dtype: DType) -> Tensor {
    build(1, query_len, key_len, dtype, |_, i, j| j > i)
}

/// Sliding-window causal mask: query `i` attends to at most `window_size`
/// keys ending at `i`.
pub fn sliding_window_mask(query_len: usize, key_len: usize, window_size: usize, dtype: DType) -> Tensor {
    build(1, query_len, key_len, dtype, |_, i, j| {
        j > i || i - j >= window_size
    })
}

/// Per-batch key padding mask `[batch, query_len, key_len]`: keys at or
/// beyond `lengths[b]` are masked.
pub fn key_padding_mask(lengths: &[usize], query_len: usize, key_len: usize, dtype: DType) -> Tensor {
    build(lengths.len(), query_len, key_len, dtype, |b, _, j| j >= lengths[b])
}

/// Mask `[1, query_len, key_len]` equal to the key blocks a window skips
/// under `tiling`: a dense rendition of block-level windowing.
pub fn block_window_mask(tiling: &TilingPara, window: Window, dtype: DType) -> Tensor {
    let query_len = (tiling.tr - 1) * tiling.br + tiling.last_br;
    let key_len = (tiling.tc - 1) * tiling.bc + tiling.last_bc;
    build(1, query_len, key_len, dtype, |_, i, j| {
        !window.contains(i / tiling.br, j / tiling.bc)
    })
}

/// ALiBi head slopes.
///
/// For a power-of-two head count `n` the slopes are `2^(-8 (h + 1) / n)`.
/// Otherwise the closest lower power of two `c` gets that geometric
/// sequence, and the remaining heads take every other slope of the
/// sequence for `2c`: `2^(-4 (2i + 1) / c)`.
pub fn alibi_slopes(heads: usize) -> Vec<f32> {
    let closest = if heads.is_power_of_two() {
        heads
    } else {
        heads.next_power_of_two() / 2
    };
    let ratio = 8.0 / closest as f32;

    let mut slopes: Vec<f32> = (0..closest.min(heads))
        .map(|h| 2f32.powf(-((h + 1) as f32) * ratio))
        .collect();
    if heads > closest {
        let extra_ratio = 4.0 / closest as f32;
        slopes.extend((0..heads - closest).map(|i| 2f32.powf(-((2 * i + 1) as f32) * extra_ratio)));
    }
    slopes
}

/// ALiBi bias rows `[1, heads, 1, key_len]`: `-slope_h * (key_len - 1 - j)`,
/// zero at the most recent key.
pub fn alibi_bias(heads: usize, key_len: usize, dtype: DType) -> Tensor {
    let slopes = alibi_slopes(heads);
    let data: Vec<f32> = slopes
        .iter()
        .flat_map(|&s| (0..key_len).map(move |j| -s * (key_len - 1 - j) as f32))
        .collect();
    Tensor::from_f32_as(&data, &[1, heads, 1, key_len], dtype)
}

/// Seeded dropout mask of shape `dims`: each element is `1 / keep_prob`
/// with probability `keep_prob`, else 0.
///
/// # Panics
/// Panics if `keep_prob` is not in `(0, 1]`.
pub fn dropout_mask(dims: &[usize], keep_prob: f32, seed: u64, dtype: DType) -> Tensor {
    assert!(keep_prob > 0.0 && keep_prob <= 1.0, "keep_prob must be in (0, 1]");
    let n: usize = dims.iter().product();
    let scale = 1.0 / keep_prob;
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..n)
        .map(|_| if rng.gen::<f32>() < keep_prob { scale } else { 0.0 })
        .collect();
    Tensor::from_f32_as(&data, dims, dtype)
}
