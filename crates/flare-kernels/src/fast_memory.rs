//! Fast on-chip memory emulation.
//!
//! Each compute core owns one [`FastMemory`] ledger with a fixed byte
//! budget. Working buffers are handed out as [`Tile`]s whose bytes are
//! returned to the ledger when the tile is dropped, so a buffer scoped to a
//! key-block iteration is released on every exit path, including windowed
//! skips and early `continue`s.

use std::cell::Cell;

/// Minimum addressable unit of the vector/matrix units, in elements.
pub const BLOCK_ALIGN: usize = 16;

/// Round `n` up to the next multiple of [`BLOCK_ALIGN`].
pub fn align_up(n: usize) -> usize {
    n.div_ceil(BLOCK_ALIGN) * BLOCK_ALIGN
}

/// Per-core fast-memory budget ledger.
///
/// Not `Sync`: a ledger belongs to exactly one core.
#[derive(Debug)]
pub struct FastMemory {
    capacity: usize,
    in_use: Cell<usize>,
    peak: Cell<usize>,
}

impl FastMemory {
    /// Create a ledger with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: Cell::new(0),
            peak: Cell::new(0),
        }
    }

    /// Reserve a zeroed `rows × cols` tile whose elements occupy
    /// `elem_bytes` bytes each in fast memory.
    ///
    /// The tiling strategy guarantees the working set fits; exceeding the
    /// budget is a tiling bug and trips a debug assertion.
    pub fn alloc(&self, name: &'static str, rows: usize, cols: usize, elem_bytes: usize) -> Tile<'_> {
        let bytes = rows * cols * elem_bytes;
        let in_use = self.in_use.get() + bytes;
        debug_assert!(
            in_use <= self.capacity,
            "fast memory exhausted allocating '{}': {} of {} bytes",
            name,
            in_use,
            self.capacity
        );
        self.in_use.set(in_use);
        if in_use > self.peak.get() {
            self.peak.set(in_use);
        }
        Tile {
            data: vec![0.0; rows * cols],
            rows,
            cols,
            bytes,
            mem: self,
        }
    }

    /// Bytes currently reserved.
    pub fn in_use(&self) -> usize {
        self.in_use.get()
    }

    /// Highest reservation observed since creation.
    pub fn peak(&self) -> usize {
        self.peak.get()
    }

    fn release(&self, bytes: usize) {
        self.in_use.set(self.in_use.get() - bytes);
    }
}

/// A row-major f32 working buffer reserved from a [`FastMemory`] ledger.
///
/// Values are held as f32 on the host; the ledger charges the element size
/// of the storage type the hardware would use.
pub struct Tile<'m> {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
    bytes: usize,
    mem: &'m FastMemory,
}

impl Tile<'_> {
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Row stride (padded column count).
    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        &mut self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }
}

impl Drop for Tile<'_> {
    fn drop(&mut self) {
        self.mem.release(self.bytes);
    }
}
