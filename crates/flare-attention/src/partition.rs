//! Work partitioning across compute cores.
//!
//! The task space is the flattened `(batch_head, query_block)` grid in
//! row-major order. Each core receives one contiguous run of tasks:
//! `T / cores` each, with the first `T % cores` cores taking one extra.
//! Contiguity makes every core's output region one contiguous slice of
//! the output tensor, which is what lets cores write without locks.

use std::ops::Range;

use smallvec::SmallVec;

use flare_core::{FlareError, Result};

use crate::tiling::TilingPara;

/// One unit of independent work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Task {
    pub core_idx: usize,
    pub batch_head: usize,
    pub query_block: usize,
}

/// The tasks of one core, as nested ranges: a contiguous batch-head range
/// and, per batch-head in it, a contiguous query-block range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreAssignment {
    pub core_idx: usize,
    /// Flat task indices owned by this core.
    pub tasks: Range<usize>,
    /// Batch-heads touched by this core.
    pub batch_heads: Range<usize>,
    /// Query-block range for each batch-head in `batch_heads`, in order.
    pub query_blocks: SmallVec<[Range<usize>; 4]>,
}

impl CoreAssignment {
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Iterate this core's tasks in row-major order.
    pub fn iter_tasks(&self) -> impl Iterator<Item = Task> + '_ {
        self.batch_heads
            .clone()
            .zip(self.query_blocks.iter())
            .flat_map(move |(batch_head, blocks)| {
                blocks.clone().map(move |query_block| Task {
                    core_idx: self.core_idx,
                    batch_head,
                    query_block,
                })
            })
    }
}

/// Per-core assignments, indexed by core id. Only active cores appear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPlan {
    pub batch_heads: usize,
    pub query_blocks: usize,
    pub cores: Vec<CoreAssignment>,
}

impl WorkPlan {
    pub fn total_tasks(&self) -> usize {
        self.batch_heads * self.query_blocks
    }

    pub fn active_cores(&self) -> usize {
        self.cores.len()
    }

    /// All tasks of all cores, in core order.
    pub fn iter_tasks(&self) -> impl Iterator<Item = Task> + '_ {
        self.cores.iter().flat_map(|c| c.iter_tasks())
    }
}

/// Split `batch_heads × query_blocks` tasks across at most `core_count` cores.
///
/// When there are fewer tasks than cores the active core count is clamped
/// to the task count.
pub fn partition(batch_heads: usize, query_blocks: usize, core_count: usize) -> Result<WorkPlan> {
    let total = batch_heads * query_blocks;
    if total == 0 {
        return Err(FlareError::config(format!(
            "no work to partition ({batch_heads} batch-heads x {query_blocks} query blocks)"
        )));
    }
    if core_count == 0 {
        return Err(FlareError::config("core count must be at least 1"));
    }

    let active = core_count.min(total);
    let (per_core, remainder) = (total / active, total % active);

    let mut cores = Vec::with_capacity(active);
    let mut start = 0;
    for core_idx in 0..active {
        let count = per_core + usize::from(core_idx < remainder);
        let end = start + count;

        let first_bh = start / query_blocks;
        let last_bh = (end - 1) / query_blocks;
        let query_blocks_per_bh = (first_bh..=last_bh)
            .map(|bh| {
                let lo = start.max(bh * query_blocks) - bh * query_blocks;
                let hi = end.min((bh + 1) * query_blocks) - bh * query_blocks;
                lo..hi
            })
            .collect();

        cores.push(CoreAssignment {
            core_idx,
            tasks: start..end,
            batch_heads: first_bh..last_bh + 1,
            query_blocks: query_blocks_per_bh,
        });
        start = end;
    }

    Ok(WorkPlan {
        batch_heads,
        query_blocks,
        cores,
    })
}

/// Element range written by a task in a `[batch_heads, query_len, row_width]`
/// row-major output (`row_width` is the head dim for the output tensor, 1
/// for the row statistics).
pub fn output_region(task: &Task, tiling: &TilingPara, query_len: usize, row_width: usize) -> Range<usize> {
    let start = (task.batch_head * query_len + task.query_block * tiling.br) * row_width;
    start..start + tiling.query_block_height(task.query_block) * row_width
}

/// Element range covering all of a core's task regions. Contiguous because
/// the core's tasks are contiguous in row-major order.
pub fn core_region(core: &CoreAssignment, tiling: &TilingPara, query_len: usize, row_width: usize) -> Range<usize> {
    let mut tasks = core.iter_tasks();
    let first = match tasks.next() {
        Some(t) => t,
        None => return 0..0,
    };
    let last = tasks.last().unwrap_or(first);
    output_region(&first, tiling, query_len, row_width).start..output_region(&last, tiling, query_len, row_width).end
}

/// Split `buf` into the consecutive, non-overlapping sub-slices named by
/// `ranges`, which must be sorted and pairwise disjoint.
pub fn split_disjoint<'a, T>(mut buf: &'a mut [T], ranges: impl IntoIterator<Item = Range<usize>>) -> Vec<&'a mut [T]> {
    let mut consumed = 0;
    let mut out = Vec::new();
    for r in ranges {
        debug_assert!(r.start >= consumed, "ranges overlap or are unsorted");
        let rest = std::mem::take(&mut buf);
        let (_, rest) = rest.split_at_mut(r.start - consumed);
        let (chunk, rest) = rest.split_at_mut(r.len());
        out.push(chunk);
        buf = rest;
        consumed = r.end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_even_split() {
        let plan = partition(4, 2, 4).unwrap();
        assert_eq!(plan.active_cores(), 4);
        for (i, core) in plan.cores.iter().enumerate() {
            assert_eq!(core.tasks, i * 2..i * 2 + 2);
            assert_eq!(core.batch_heads, i..i + 1);
            assert_eq!(core.query_blocks.as_slice(), &[0..2]);
        }
    }

    #[test]
    fn test_remainder_goes_to_first_cores() {
        // 10 tasks over 4 cores: 3, 3, 2, 2
        let plan = partition(2, 5, 4).unwrap();
        let counts: Vec<usize> = plan.cores.iter().map(|c| c.task_count()).collect();
        assert_eq!(counts, vec![3, 3, 2, 2]);

        // core 1 owns tasks 3..6 = (bh0, qb3), (bh0, qb4), (bh1, qb0)
        let core = &plan.cores[1];
        assert_eq!(core.batch_heads, 0..2);
        assert_eq!(core.query_blocks.as_slice(), &[3..5, 0..1]);
    }

    #[test]
    fn test_more_cores_than_tasks() {
        let plan = partition(1, 3, 32).unwrap();
        assert_eq!(plan.active_cores(), 3);
        assert!(plan.cores.iter().all(|c| c.task_count() == 1));
    }

    #[test]
    fn test_zero_tasks_is_config_error() {
        assert!(partition(0, 4, 8).unwrap_err().is_config());
        assert!(partition(4, 0, 8).unwrap_err().is_config());
        assert!(partition(4, 4, 0).unwrap_err().is_config());
    }

    #[test]
    fn test_trailing_block_region() {
        let tiling = TilingPara::from_blocks(130, 64, 64, 64).unwrap();
        let task = Task { core_idx: 0, batch_head: 1, query_block: 2 };
        // batch-head 1 starts at row 130; block 2 starts at row 128 within it
        assert_eq!(output_region(&task, &tiling, 130, 16), (130 + 128) * 16..(130 + 130) * 16);
    }

    #[test]
    fn test_split_disjoint() {
        let mut buf: Vec<u32> = (0..10).collect();
        let parts = split_disjoint(&mut buf, [0..3, 3..4, 6..10]);
        assert_eq!(parts.len(), 3);
        assert_eq!(&*parts[0], &[0, 1, 2]);
        assert_eq!(&*parts[1], &[3]);
        assert_eq!(&*parts[2], &[6, 7, 8, 9]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// Every task is owned by exactly one core; loads differ by at most one.
        #[test]
        fn prop_partition_covers_without_overlap(
            batch_heads in 1usize..24,
            query_blocks in 1usize..24,
            core_count in 1usize..80,
        ) {
            let plan = partition(batch_heads, query_blocks, core_count).unwrap();
            let total = batch_heads * query_blocks;
            prop_assert_eq!(plan.active_cores(), core_count.min(total));

            let mut seen = vec![0u32; total];
            for task in plan.iter_tasks() {
                prop_assert!(task.batch_head < batch_heads);
                prop_assert!(task.query_block < query_blocks);
                seen[task.batch_head * query_blocks + task.query_block] += 1;
            }
            prop_assert!(seen.iter().all(|&n| n == 1));

            let counts: Vec<usize> = plan.cores.iter().map(|c| c.task_count()).collect();
            prop_assert_eq!(counts.iter().sum::<usize>(), total);
            let max = *counts.iter().max().unwrap();
            let min = *counts.iter().min().unwrap();
            prop_assert!(max - min <= 1);

            // contiguous flat ranges, in core order
            let mut next = 0;
            for core in &plan.cores {
                prop_assert_eq!(core.tasks.start, next);
                prop_assert_eq!(core.iter_tasks().count(), core.task_count());
                next = core.tasks.end;
            }
        }

        /// Output regions of distinct tasks never overlap and tile the tensor exactly.
        #[test]
        fn prop_output_regions_disjoint(
            batch_heads in 1usize..6,
            query_len in 1usize..300,
            block_units in 1usize..6,
            core_count in 1usize..40,
        ) {
            let br = block_units * 16;
            let tiling = TilingPara::from_blocks(query_len, 16, br, 16).unwrap();
            let plan = partition(batch_heads, tiling.tr, core_count).unwrap();
            let head_dim = 16;

            let mut owner = vec![usize::MAX; batch_heads * query_len * head_dim];
            for (i, task) in plan.iter_tasks().enumerate() {
                for e in output_region(&task, &tiling, query_len, head_dim) {
                    prop_assert_eq!(owner[e], usize::MAX, "element {} written twice", e);
                    owner[e] = i;
                }
            }
            prop_assert!(owner.iter().all(|&o| o != usize::MAX));

            // core regions are consecutive and cover the whole buffer
            let mut next = 0;
            for core in &plan.cores {
                let r = core_region(core, &tiling, query_len, head_dim);
                prop_assert_eq!(r.start, next);
                next = r.end;
            }
            prop_assert_eq!(next, owner.len());
        }
    }
}
