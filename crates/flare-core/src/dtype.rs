use std::fmt;

/// Element types a kernel tensor may carry.
///
/// Q/K/V and the optional masks are half precision on the accelerator
/// (single precision in high-precision mode); the dim mask is `I8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 16-bit IEEE 754 half-precision float
    F16,
    /// 32-bit IEEE 754 single-precision float
    F32,
    /// 8-bit signed integer
    I8,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn element_size(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 => 4,
            DType::I8 => 1,
        }
    }

    /// Whether this dtype is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::F32)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F16 => write!(f, "f16"),
            DType::F32 => write!(f, "f32"),
            DType::I8 => write!(f, "i8"),
        }
    }
}
