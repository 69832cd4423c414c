//! # flare-kernels
//!
//! Block-level building blocks executed inside one compute core.
//!
//! Provides:
//! - A per-core fast-memory ledger with scoped, auto-released tiles
//! - Block matmuls for `Q·Kᵀ` and `P·V` with a SIMD axpy path
//! - Online-softmax row primitives with working-precision rounding

pub mod block_matmul;
pub mod fast_memory;
pub mod row_ops;
pub mod simd;

pub use fast_memory::{align_up, FastMemory, Tile, BLOCK_ALIGN};
pub use row_ops::Precision;
pub use simd::SimdCapability;
