use half::f16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::dtype::DType;
use crate::shape::Shape;

/// Typed, contiguous element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F16(Vec<f16>),
    F32(Vec<f32>),
    I8(Vec<i8>),
}

impl TensorData {
    fn len(&self) -> usize {
        match self {
            TensorData::F16(v) => v.len(),
            TensorData::F32(v) => v.len(),
            TensorData::I8(v) => v.len(),
        }
    }
}

/// A dense, row-major host tensor.
///
/// This is the caller-owned "global memory" the kernel reads Q/K/V and
/// masks from and writes its outputs to. Kernels never alias a tensor
/// mutably across cores; each core receives a disjoint output slice.
///
/// # Examples
///
/// ```
/// use flare_core::{DType, Tensor};
///
/// let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
/// assert_eq!(t.shape().dims(), &[2, 2]);
///
/// let h = Tensor::from_f32_as(&[1.0, 2.0, 3.0, 4.0], &[2, 2], DType::F16);
/// assert_eq!(h.dtype(), DType::F16);
/// assert_eq!(h.get_f32(3), Some(4.0));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Shape,
    data: TensorData,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a tensor from f32 data with the given shape.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        Self::from_data(TensorData::F32(data.to_vec()), shape)
    }

    /// Create a tensor from f16 data with the given shape.
    pub fn from_f16(data: &[f16], shape: &[usize]) -> Self {
        Self::from_data(TensorData::F16(data.to_vec()), shape)
    }

    /// Create a tensor from i8 data with the given shape.
    pub fn from_i8(data: &[i8], shape: &[usize]) -> Self {
        Self::from_data(TensorData::I8(data.to_vec()), shape)
    }

    /// Create a tensor of `dtype` from f32 values, rounding as needed.
    pub fn from_f32_as(data: &[f32], shape: &[usize], dtype: DType) -> Self {
        Self::from_data(convert(data, dtype), shape)
    }

    /// Wrap existing storage.
    ///
    /// # Panics
    /// Panics if the element count does not match the shape.
    pub fn from_data(data: TensorData, shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "Shape {:?} requires {} elements, got {}",
            shape,
            s.numel(),
            data.len()
        );
        Self { shape: s, data }
    }

    /// Create a tensor of zeros with the given shape and dtype.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let n = Shape::new(shape).numel();
        let data = match dtype {
            DType::F16 => TensorData::F16(vec![f16::ZERO; n]),
            DType::F32 => TensorData::F32(vec![0.0; n]),
            DType::I8 => TensorData::I8(vec![0; n]),
        };
        Self::from_data(data, shape)
    }

    /// Create a tensor filled with `value`.
    pub fn full(shape: &[usize], value: f32, dtype: DType) -> Self {
        let n = Shape::new(shape).numel();
        Self::from_f32_as(&vec![value; n], shape, dtype)
    }

    /// Uniform values in `[low, high)` from a seeded generator.
    pub fn rand_uniform_seeded(shape: &[usize], low: f32, high: f32, seed: u64, dtype: DType) -> Self {
        let n = Shape::new(shape).numel();
        let mut rng = StdRng::seed_from_u64(seed);
        let data: Vec<f32> = (0..n).map(|_| rng.gen_range(low..high)).collect();
        Self::from_f32_as(&data, shape, dtype)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn dtype(&self) -> DType {
        match self.data {
            TensorData::F16(_) => DType::F16,
            TensorData::F32(_) => DType::F32,
            TensorData::I8(_) => DType::I8,
        }
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f16_slice(&self) -> Option<&[f16]> {
        match &self.data {
            TensorData::F16(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i8_slice(&self) -> Option<&[i8]> {
        match &self.data {
            TensorData::I8(v) => Some(v),
            _ => None,
        }
    }

    /// Read one element, widened to f32.
    pub fn get_f32(&self, flat_index: usize) -> Option<f32> {
        match &self.data {
            TensorData::F16(v) => v.get(flat_index).map(|x| x.to_f32()),
            TensorData::F32(v) => v.get(flat_index).copied(),
            TensorData::I8(v) => v.get(flat_index).map(|&x| x as f32),
        }
    }

    /// All elements widened to f32.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            TensorData::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
            TensorData::F32(v) => v.clone(),
            TensorData::I8(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    /// Copy `dst.len()` consecutive elements starting at `offset`, widened to f32.
    ///
    /// # Panics
    /// Panics if the range runs past the end of the tensor.
    pub fn copy_to_f32(&self, offset: usize, dst: &mut [f32]) {
        let end = offset + dst.len();
        match &self.data {
            TensorData::F16(v) => {
                for (d, s) in dst.iter_mut().zip(&v[offset..end]) {
                    *d = s.to_f32();
                }
            }
            TensorData::F32(v) => dst.copy_from_slice(&v[offset..end]),
            TensorData::I8(v) => {
                for (d, &s) in dst.iter_mut().zip(&v[offset..end]) {
                    *d = s as f32;
                }
            }
        }
    }

}

fn convert(data: &[f32], dtype: DType) -> TensorData {
    match dtype {
        DType::F16 => TensorData::F16(data.iter().map(|&x| f16::from_f32(x)).collect()),
        DType::F32 => TensorData::F32(data.to_vec()),
        DType::I8 => TensorData::I8(data.iter().map(|&x| x as i8).collect()),
    }
}
