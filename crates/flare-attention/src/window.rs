//! Block-level attention windows.

use std::ops::Range;

/// Bounds on how many key blocks before / after the diagonal a query block
/// visits. Key block `j` is visited by query block `i` iff
/// `i - prev <= j <= i + next` (saturating).
///
/// `Window::new(usize::MAX, 0)` visits every block up to and including the
/// diagonal; paired with a causal attention mask this is causal attention
/// that never loads a future key block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    pub prev: usize,
    pub next: usize,
}

impl Window {
    pub fn new(prev: usize, next: usize) -> Self {
        Self { prev, next }
    }

    /// A window that visits every key block.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX, usize::MAX)
    }

    /// Key blocks visited by query block `query_block`, clamped to `0..num_key_blocks`.
    /// May be empty when there are more query blocks than key blocks.
    pub fn key_blocks(&self, query_block: usize, num_key_blocks: usize) -> Range<usize> {
        let start = query_block.saturating_sub(self.prev).min(num_key_blocks);
        let end = query_block
            .saturating_add(self.next)
            .saturating_add(1)
            .min(num_key_blocks);
        start..end.max(start)
    }

    /// Whether key block `key_block` is visited by query block `query_block`.
    pub fn contains(&self, query_block: usize, key_block: usize) -> bool {
        query_block.saturating_sub(self.prev) <= key_block
            && key_block <= query_block.saturating_add(self.next)
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::unbounded()
    }
}
