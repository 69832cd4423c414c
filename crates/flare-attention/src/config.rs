//! Kernel build configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use flare_core::{FlareError, Result};
use flare_kernels::{Precision, BLOCK_ALIGN};

use crate::tiling::{FixedTiling, GreedyTiling, TilingStrategy};
use crate::window::Window;

/// Default number of independent compute cores.
pub const DEFAULT_CORE_COUNT: usize = 32;

/// Default per-core fast-memory budget in bytes.
pub const DEFAULT_FAST_MEMORY_BYTES: usize = 256 * 1024;

/// Window bound meaning "no limit".
pub const UNBOUNDED_BLOCKS: usize = 65536;

/// Which tiling strategy the driver runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TilingSelector {
    /// Largest aligned blocks that fit the fast-memory budget.
    #[default]
    Greedy,
    /// Caller-chosen block sizes.
    Fixed { query_block: usize, key_block: usize },
}

impl TilingSelector {
    /// Instantiate the selected strategy. The greedy strategy is sized by
    /// the caller from the problem's working-set model.
    pub(crate) fn strategy(&self, greedy: GreedyTiling) -> Box<dyn TilingStrategy> {
        match *self {
            TilingSelector::Greedy => Box::new(greedy),
            TilingSelector::Fixed { query_block, key_block } => {
                Box::new(FixedTiling::new(query_block, key_block))
            }
        }
    }
}

/// Configuration of one flash-attention kernel instance.
///
/// Everything here is fixed at build time; nothing is resized while the
/// kernel runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Kernel name / identifier.
    pub kernel_name: String,

    /// Number of independent compute cores to partition work across.
    pub core_count: usize,

    /// Fast on-chip memory per core, in bytes.
    pub fast_memory_bytes: usize,

    /// Key blocks visited before the diagonal block of each query block.
    pub prev_block_num: usize,

    /// Key blocks visited after the diagonal block of each query block.
    pub next_block_num: usize,

    /// Accumulate scores, probabilities and statistics in f32.
    pub high_precision: bool,

    /// Block-size policy.
    pub tiling: TilingSelector,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            kernel_name: "flash_attention".into(),
            core_count: DEFAULT_CORE_COUNT,
            fast_memory_bytes: DEFAULT_FAST_MEMORY_BYTES,
            prev_block_num: UNBOUNDED_BLOCKS,
            next_block_num: UNBOUNDED_BLOCKS,
            high_precision: false,
            tiling: TilingSelector::Greedy,
        }
    }
}

impl KernelConfig {
    pub fn new(kernel_name: impl Into<String>) -> Self {
        Self {
            kernel_name: kernel_name.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON configuration; absent fields take their defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| FlareError::config(format!("invalid kernel config: {e}")))
    }

    /// Load a JSON configuration file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FlareError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn with_core_count(mut self, core_count: usize) -> Self {
        self.core_count = core_count;
        self
    }

    pub fn with_fast_memory_bytes(mut self, bytes: usize) -> Self {
        self.fast_memory_bytes = bytes;
        self
    }

    pub fn with_window(mut self, prev_block_num: usize, next_block_num: usize) -> Self {
        self.prev_block_num = prev_block_num;
        self.next_block_num = next_block_num;
        self
    }

    pub fn with_high_precision(mut self, high_precision: bool) -> Self {
        self.high_precision = high_precision;
        self
    }

    pub fn with_tiling(mut self, tiling: TilingSelector) -> Self {
        self.tiling = tiling;
        self
    }

    pub fn precision(&self) -> Precision {
        Precision::from_high_precision(self.high_precision)
    }

    pub fn window(&self) -> Window {
        Window::new(self.prev_block_num, self.next_block_num)
    }

    /// Reject configurations no problem could be built with.
    pub fn validate(&self) -> Result<()> {
        if self.kernel_name.trim().is_empty() {
            return Err(FlareError::config("kernel name must not be empty"));
        }
        if self.core_count == 0 {
            return Err(FlareError::config("core_count must be at least 1"));
        }
        // A 16x16 score tile alone must fit
        let min_bytes = BLOCK_ALIGN * BLOCK_ALIGN * self.precision().element_size();
        if self.fast_memory_bytes < min_bytes {
            return Err(FlareError::config(format!(
                "fast memory budget of {} bytes is below the {} byte minimum",
                self.fast_memory_bytes, min_bytes
            )));
        }
        if let TilingSelector::Fixed { query_block, key_block } = self.tiling {
            if query_block == 0 || key_block == 0 {
                return Err(FlareError::config("fixed tiling block sizes must be non-zero"));
            }
        }
        Ok(())
    }
}
