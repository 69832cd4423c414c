//! Row-wise online-softmax primitives.
//!
//! Every stored result passes through [`Precision::round`], which models
//! the working precision of the vector unit: half precision by default,
//! single precision in high-precision mode.

use half::f16;

/// Working precision for scores, probabilities and running statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Precision {
    /// f16 storage (the accelerator's native vector type)
    #[default]
    Half,
    /// f32 storage, selected by high-precision mode
    Full,
}

impl Precision {
    pub fn from_high_precision(high_precision: bool) -> Self {
        if high_precision {
            Precision::Full
        } else {
            Precision::Half
        }
    }

    /// Bytes per stored element.
    pub fn element_size(self) -> usize {
        match self {
            Precision::Half => 2,
            Precision::Full => 4,
        }
    }

    /// Round a value to the storage precision.
    #[inline]
    pub fn round(self, x: f32) -> f32 {
        match self {
            Precision::Half => f16::from_f32(x).to_f32(),
            Precision::Full => x,
        }
    }

    pub fn round_slice(self, xs: &mut [f32]) {
        if self == Precision::Half {
            for x in xs.iter_mut() {
                *x = f16::from_f32(*x).to_f32();
            }
        }
    }
}

/// Maximum of a row. The caller guarantees `row` is non-empty.
pub fn row_max(row: &[f32]) -> f32 {
    row.iter().copied().fold(f32::MIN, f32::max)
}

/// Replace each `x` with `exp(x - shift)` in place and return the row sum.
///
/// The sum is accumulated in f32 and rounded once.
pub fn exp_shift_sum(row: &mut [f32], shift: f32, precision: Precision) -> f32 {
    let mut sum = 0.0f32;
    for x in row.iter_mut() {
        let e = precision.round((*x - shift).exp());
        *x = e;
        sum += e;
    }
    precision.round(sum)
}

/// Multiply a row by `factor` in place.
pub fn scale_row(row: &mut [f32], factor: f32, precision: Precision) {
    for x in row.iter_mut() {
        *x = precision.round(*x * factor);
    }
}

/// `dst[i] += src[i]` in place.
pub fn add_row(dst: &mut [f32], src: &[f32], precision: Precision) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = precision.round(*d + s);
    }
}

/// `dst[i] *= src[i]` in place.
pub fn mul_row(dst: &mut [f32], src: &[f32], precision: Precision) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = precision.round(*d * s);
    }
}
