//! # flare-core
//!
//! Host-side tensor types shared by the flare attention kernel crates.
//!
//! Provides:
//! - `DType` (F16, F32, I8) and a small-vector `Shape`
//! - A dense row-major `Tensor` standing in for accelerator global memory
//! - `FlareError`, the build-time error taxonomy

pub mod dtype;
pub mod error;
pub mod shape;
pub mod tensor;

pub use dtype::DType;
pub use error::{ErrorKind, FlareError};
pub use shape::Shape;
pub use tensor::{Tensor, TensorData};

pub type Result<T> = std::result::Result<T, FlareError>;
