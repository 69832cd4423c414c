//! Block matrix products for the attention inner loop.
//!
//! Both products read row-major tiles whose row stride may exceed the
//! logical extent (padded tiles). Reduction order is fixed, so a given
//! tiling always yields bit-identical results.

use crate::simd::SimdCapability;

/// Raw score block: `S[i, j] = Σ_p Q[i, p] · K[j, p]` for `i < rows`, `j < cols`.
///
/// - `q`: `[rows, d]` with row stride `d`
/// - `k`: `[cols, d]` with row stride `d`
/// - `s`: `[rows, s_stride]`; columns `cols..s_stride` are left untouched
pub fn scores_nt(q: &[f32], k: &[f32], s: &mut [f32], rows: usize, cols: usize, d: usize, s_stride: usize) {
    debug_assert!(cols <= s_stride);
    for i in 0..rows {
        let q_row = &q[i * d..(i + 1) * d];
        let s_row = &mut s[i * s_stride..i * s_stride + cols];
        for (j, out) in s_row.iter_mut().enumerate() {
            let k_row = &k[j * d..(j + 1) * d];
            *out = dot(q_row, k_row);
        }
    }
}

/// Accumulate `O[i, :] += Σ_j P[i, j] · V[j, :]` for `i < rows`, `j < cols`.
///
/// - `p`: `[rows, p_stride]`
/// - `v`: `[cols, d]` with row stride `d`
/// - `o`: `[rows, d]` with row stride `d`
pub fn accumulate_pv(p: &[f32], v: &[f32], o: &mut [f32], rows: usize, cols: usize, d: usize, p_stride: usize) {
    let cap = SimdCapability::detect();
    for i in 0..rows {
        let p_row = &p[i * p_stride..i * p_stride + cols];
        let o_row = &mut o[i * d..(i + 1) * d];
        for (j, &w) in p_row.iter().enumerate() {
            if w == 0.0 {
                continue;
            }
            let v_row = &v[j * d..(j + 1) * d];
            axpy(cap, w, v_row, o_row);
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    // Four independent partial sums, combined in a fixed order
    let mut acc = [0.0f32; 4];
    let chunks = a.len() / 4;
    for c in 0..chunks {
        for l in 0..4 {
            acc[l] += a[c * 4 + l] * b[c * 4 + l];
        }
    }
    let mut tail = 0.0f32;
    for p in chunks * 4..a.len() {
        tail += a[p] * b[p];
    }
    (acc[0] + acc[1]) + (acc[2] + acc[3]) + tail
}

fn axpy(cap: &SimdCapability, w: f32, x: &[f32], y: &mut [f32]) {
    #[cfg(target_arch = "x86_64")]
    {
        if cap.has_avx2_fma() {
            // Safety: AVX2 and FMA were detected at runtime
            unsafe { axpy_avx2(w, x, y) };
            return;
        }
    }
    let _ = cap;
    axpy_scalar(w, x, y);
}

fn axpy_scalar(w: f32, x: &[f32], y: &mut [f32]) {
    for (yi, &xi) in y.iter_mut().zip(x) {
        *yi += w * xi;
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn axpy_avx2(w: f32, x: &[f32], y: &mut [f32]) {
    use std::arch::x86_64::*;

    let n = x.len().min(y.len());
    let wv = _mm256_set1_ps(w);
    let mut j = 0;
    while j + 8 <= n {
        let x_vec = _mm256_loadu_ps(x.as_ptr().add(j));
        let y_ptr = y.as_mut_ptr().add(j);
        let y_vec = _mm256_loadu_ps(y_ptr);
        _mm256_storeu_ps(y_ptr, _mm256_fmadd_ps(wv, x_vec, y_vec));
        j += 8;
    }
    while j < n {
        *y.get_unchecked_mut(j) = w.mul_add(*x.get_unchecked(j), *y.get_unchecked(j));
        j += 1;
    }
}
