//! Direct (non-tiled) attention.
//!
//! softmax(Q·Kᵀ / sqrt(actual_d) + alibi + mask · MASK_FILL_VALUE) ⊙ dropout · V
//!
//! Materialises each full score row and computes in f64. Masks, fill value
//! and the dim-mask lane rule match the tiled kernel; used as the
//! equivalence oracle in tests and benches.

use flare_core::Result;

use crate::applier::{MaskLayout, MASK_FILL_VALUE};
use crate::problem::{AttentionInputs, ProblemShape};

/// Outputs of [`reference_attention`], all widened to f32.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceOutput {
    pub problem: ProblemShape,
    /// `[batch, heads, query_len, head_dim]`
    pub out: Vec<f32>,
    /// Softmax denominator per query row, `[batch, heads, query_len]`.
    pub row_sum: Vec<f32>,
    /// Maximum masked score per query row, `[batch, heads, query_len]`.
    pub row_max: Vec<f32>,
}

/// Standard attention over the full score matrix.
pub fn reference_attention(inputs: &AttentionInputs<'_>) -> Result<ReferenceOutput> {
    let problem = inputs.desc().validate()?;
    let ProblemShape {
        query_len: n_q,
        key_len: n_k,
        head_dim: d,
        actual_head_dim,
        heads,
        ..
    } = problem;

    let live: Vec<bool> = (0..d)
        .map(|j| j < actual_head_dim && inputs.dim_mask.get_f32(j).is_some_and(|v| v != 0.0))
        .collect();
    let widen = |t: &flare_core::Tensor| -> Vec<f64> { t.to_f32_vec().into_iter().map(f64::from).collect() };
    let q = widen(inputs.query);
    let k = widen(inputs.key);
    let v = widen(inputs.value);
    let attn = inputs.attn_mask.map(|t| (widen(t), MaskLayout::new(t.dims(), heads)));
    let alibi = inputs.alibi_mask.map(|t| (widen(t), MaskLayout::new(t.dims(), heads)));
    let dropout = inputs.dropout_mask.map(widen);
    let scale = 1.0 / (actual_head_dim as f64).sqrt();

    let bh_total = problem.batch_heads();
    let mut out = vec![0.0f32; bh_total * n_q * d];
    let mut row_sum = vec![0.0f32; bh_total * n_q];
    let mut row_max = vec![0.0f32; bh_total * n_q];
    let mut scores = vec![0.0f64; n_k];

    for bh in 0..bh_total {
        for i in 0..n_q {
            let q_row = &q[(bh * n_q + i) * d..(bh * n_q + i + 1) * d];
            for (j, s) in scores.iter_mut().enumerate() {
                let k_row = &k[(bh * n_k + j) * d..(bh * n_k + j + 1) * d];
                let dot: f64 = (0..d).filter(|&p| live[p]).map(|p| q_row[p] * k_row[p]).sum();
                *s = dot * scale;
                if let Some((bias, layout)) = &alibi {
                    *s += bias[layout.offset(bh, 0, j)];
                }
                if let Some((mask, layout)) = &attn {
                    *s += mask[layout.offset(bh, i, j)] * f64::from(MASK_FILL_VALUE);
                }
            }

            // Softmax over the key dimension
            let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let sum: f64 = scores.iter().map(|&s| (s - max).exp()).sum();

            let row = bh * n_q + i;
            let mut acc = vec![0.0f64; d];
            for (j, &s) in scores.iter().enumerate() {
                let mut w = (s - max).exp() / sum;
                if let Some(drop) = &dropout {
                    w *= drop[row * n_k + j];
                }
                if w == 0.0 {
                    continue;
                }
                let v_row = &v[(bh * n_k + j) * d..(bh * n_k + j + 1) * d];
                for (p, a) in acc.iter_mut().enumerate() {
                    if live[p] {
                        *a += w * v_row[p];
                    }
                }
            }
            for (o, a) in out[row * d..(row + 1) * d].iter_mut().zip(&acc) {
                *o = *a as f32;
            }
            row_sum[row] = sum as f32;
            row_max[row] = max as f32;
        }
    }

    Ok(ReferenceOutput {
        problem,
        out,
        row_sum,
        row_max,
    })
}
