//! # flare-attention
//!
//! Tiled, fused attention forward kernel for a many-core accelerator with a
//! small fast memory per core, emulated on the host.
//!
//! Provides:
//! - Tiling strategies (greedy max-block-under-budget, fixed)
//! - Work partitioning of (batch-head, query-block) tasks across cores
//! - Attention / dropout / ALiBi mask appliers and mask builders
//! - The online-softmax block engine and the kernel driver
//! - A direct f64 reference attention
//!
//! ```no_run
//! use flare_attention::{flash_attention, AttentionInputs, KernelConfig};
//! use flare_core::{DType, Tensor};
//!
//! let q = Tensor::rand_uniform_seeded(&[1, 8, 512, 64], -1.0, 1.0, 0, DType::F16);
//! let k = Tensor::rand_uniform_seeded(&[1, 8, 512, 64], -1.0, 1.0, 1, DType::F16);
//! let v = Tensor::rand_uniform_seeded(&[1, 8, 512, 64], -1.0, 1.0, 2, DType::F16);
//! let dim_mask = Tensor::from_i8(&[1; 64], &[64]);
//!
//! let inputs = AttentionInputs::new(&q, &k, &v, &dim_mask);
//! let fwd = flash_attention(&inputs, KernelConfig::new("fa_fwd")).unwrap();
//! assert_eq!(fwd.out.dims(), &[1, 8, 512, 64]);
//! ```

pub mod applier;
pub mod config;
pub mod driver;
pub mod engine;
pub mod mask;
pub mod partition;
pub mod problem;
pub mod reference;
pub mod tiling;
pub mod window;

pub use applier::{MaskApplier, MASK_FILL_VALUE, PAD_FILL_VALUE};
pub use config::{KernelConfig, TilingSelector};
pub use driver::{
    flash_attention, CompiledKernel, FlashAttention, ForwardOutput, ForwardVariant, InferenceVariant,
    KernelVariant, LaunchReport, RawOutputs, RegionDecl,
};
pub use partition::{partition, CoreAssignment, Task, WorkPlan};
pub use problem::{AttentionDesc, AttentionInputs, ProblemShape, TensorDesc};
pub use reference::{reference_attention, ReferenceOutput};
pub use tiling::{FixedTiling, GreedyTiling, TilingPara, TilingStrategy, WorkingSet};
pub use window::Window;
