//! Block-local compute engine.
//!
//! One task computes `softmax(mask(Q_i · K_jᵀ · scale)) · V_j` for a single
//! query block, streaming over the key blocks inside its window and keeping
//! the running row max `m`, row sum `l` and accumulator `O` in fast memory:
//!
//! ```text
//! m_new = max(m_old, rowmax(S_ij))
//! l     = l · exp(m_old - m_new) + rowsum(exp(S_ij - m_new))
//! O     = O · exp(m_old - m_new) + (exp(S_ij - m_new) ⊙ D_ij) · V_j
//! ```
//!
//! and finally writes `O / l`. Q/K/V/S tiles are scoped to the task or to one
//! key-block iteration, so fast memory is released on every exit path.

use flare_core::Tensor;
use flare_kernels::block_matmul::{accumulate_pv, scores_nt};
use flare_kernels::row_ops::{exp_shift_sum, row_max, scale_row};
use flare_kernels::{align_up, FastMemory, Precision, Tile};

use crate::applier::{gm_offset, BlockIndex, MaskApplier, MaskStages, PAD_FILL_VALUE};
use crate::partition::{output_region, split_disjoint, CoreAssignment, Task};
use crate::problem::{AttentionInputs, ProblemShape};
use crate::tiling::TilingPara;
use crate::window::Window;

/// Per-task host views of the output, row sum and row max regions.
pub struct TaskOutput<'o> {
    /// `[query_block_height, head_dim]`
    pub out: &'o mut [f32],
    /// `[query_block_height]`
    pub row_sum: &'o mut [f32],
    /// `[query_block_height]`
    pub row_max: &'o mut [f32],
}

/// Key blocks a task visited and skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub visited_blocks: usize,
    pub skipped_blocks: usize,
}

/// What one core did during a launch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreReport {
    pub core_idx: usize,
    pub tasks: usize,
    pub visited_blocks: usize,
    pub skipped_blocks: usize,
    /// Highest fast-memory reservation on this core, in bytes.
    pub peak_fast_memory: usize,
}

/// Everything a core needs to run its tasks. Shared read-only by all cores.
pub struct BlockEngine<'a> {
    problem: ProblemShape,
    tiling: TilingPara,
    window: Window,
    precision: Precision,
    query: &'a Tensor,
    key: &'a Tensor,
    value: &'a Tensor,
    /// `true` for real head-dim lanes.
    live_lanes: Vec<bool>,
    masks: MaskStages<'a>,
}

impl<'a> BlockEngine<'a> {
    pub fn new(
        inputs: &AttentionInputs<'a>,
        problem: ProblemShape,
        tiling: TilingPara,
        window: Window,
        precision: Precision,
    ) -> Self {
        let live_lanes = (0..problem.head_dim)
            .map(|j| j < problem.actual_head_dim && inputs.dim_mask.get_f32(j).is_some_and(|v| v != 0.0))
            .collect();
        Self {
            problem,
            tiling,
            window,
            precision,
            query: inputs.query,
            key: inputs.key,
            value: inputs.value,
            live_lanes,
            masks: MaskStages::from_inputs(inputs, &problem, precision),
        }
    }

    /// Run every task of `core` against a fresh fast-memory ledger of
    /// `fast_memory_bytes`. The three buffers are this core's contiguous
    /// regions of the output, row-sum and row-max tensors.
    pub fn run_core(
        &self,
        core: &CoreAssignment,
        fast_memory_bytes: usize,
        out: &mut [f32],
        row_sum: &mut [f32],
        row_max: &mut [f32],
    ) -> CoreReport {
        let mem = FastMemory::new(fast_memory_bytes);
        let d = self.problem.head_dim;
        let q_len = self.problem.query_len;

        let tasks: Vec<Task> = core.iter_tasks().collect();
        let base = match tasks.first() {
            Some(first) => output_region(first, &self.tiling, q_len, 1).start,
            None => return CoreReport { core_idx: core.core_idx, ..Default::default() },
        };
        let rows = |t: &Task, w: usize| {
            let r = output_region(t, &self.tiling, q_len, 1);
            (r.start - base) * w..(r.end - base) * w
        };
        let outs = split_disjoint(out, tasks.iter().map(|t| rows(t, d)));
        let sums = split_disjoint(row_sum, tasks.iter().map(|t| rows(t, 1)));
        let maxes = split_disjoint(row_max, tasks.iter().map(|t| rows(t, 1)));

        let mut report = CoreReport {
            core_idx: core.core_idx,
            tasks: tasks.len(),
            ..Default::default()
        };
        for (((task, out), row_sum), row_max) in tasks.iter().zip(outs).zip(sums).zip(maxes) {
            let stats = self.run_task(&mem, task, TaskOutput { out, row_sum, row_max });
            report.visited_blocks += stats.visited_blocks;
            report.skipped_blocks += stats.skipped_blocks;
        }
        report.peak_fast_memory = mem.peak();
        report
    }

    /// Compute one query block of one batch-head.
    pub fn run_task(&self, mem: &FastMemory, task: &Task, out: TaskOutput<'_>) -> TaskStats {
        let p = self.precision;
        let d = self.problem.head_dim;
        let bh = task.batch_head;
        let qb = task.query_block;
        let qh = self.tiling.query_block_height(qb);
        let qh_pad = align_up(qh);
        let in_bytes = self.query.dtype().element_size();
        let work_bytes = p.element_size();

        let mut q = mem.alloc("q", qh_pad, d, in_bytes);
        let q_off = gm_offset(bh, self.problem.query_len, d, self.tiling.br, qb);
        self.load_rows(self.query, q_off, qh, &mut q);

        let mut o = mem.alloc("o", qh_pad, d, work_bytes);
        let mut m = mem.alloc("m", 1, qh_pad, work_bytes);
        let mut l = mem.alloc("l", 1, qh_pad, work_bytes);
        // Lowest finite value of the working precision, so real scores below
        // the f16 range still set the row max in high precision
        m.fill(match p {
            Precision::Half => PAD_FILL_VALUE,
            Precision::Full => f32::MIN,
        });

        let visit = self.window.key_blocks(qb, self.tiling.tc);
        for kb in (0..self.tiling.tc).filter(|kb| !visit.contains(kb)) {
            tracing::trace!("batch-head {} query block {}: key block {} outside window, skipped", bh, qb, kb);
        }

        for kb in visit.clone() {
            let block = BlockIndex {
                batch_head: bh,
                query_block: qb,
                key_block: kb,
            };
            let kh = self.tiling.key_block_width(kb);
            let kh_pad = align_up(kh);
            let kv_off = gm_offset(bh, self.problem.key_len, d, self.tiling.bc, kb);

            let mut k = mem.alloc("k", kh_pad, d, in_bytes);
            let mut v = mem.alloc("v", kh_pad, d, in_bytes);
            self.load_rows(self.key, kv_off, kh, &mut k);
            self.load_rows(self.value, kv_off, kh, &mut v);

            let mut s = mem.alloc("s", qh_pad, kh_pad, work_bytes);
            scores_nt(q.as_slice(), k.as_slice(), s.as_mut_slice(), qh, kh, d, kh_pad);
            let scale = self.problem.scale();
            for r in 0..qh {
                scale_row(&mut s.row_mut(r)[..kh], scale, p);
            }

            if let Some(alibi) = &self.masks.alibi {
                alibi.apply(mem, &mut s, alibi.offset(block, &self.tiling), qh, kh);
            }
            if let Some(attn) = &self.masks.attn {
                attn.apply(mem, &mut s, attn.offset(block, &self.tiling), qh, kh);
            }
            let m_row = m.as_mut_slice();
            let l_row = l.as_mut_slice();
            for r in 0..qh {
                let m_old = m_row[r];
                // Padded key columns are outside the row extent
                let m_new = m_old.max(row_max(&s.row(r)[..kh]));
                let alpha = p.round((m_old - m_new).exp());
                scale_row(o.row_mut(r), alpha, p);
                let block_sum = exp_shift_sum(&mut s.row_mut(r)[..kh], m_new, p);
                l_row[r] = p.round(p.round(l_row[r] * alpha) + block_sum);
                m_row[r] = m_new;
            }

            if let Some(dropout) = &self.masks.dropout {
                dropout.apply(mem, &mut s, dropout.offset(block, &self.tiling), qh, kh);
            }

            accumulate_pv(s.as_slice(), v.as_slice(), o.as_mut_slice(), qh, kh, d, kh_pad);
            p.round_slice(&mut o.as_mut_slice()[..qh * d]);
        }

        for r in 0..qh {
            let sum = l.as_slice()[r];
            let dst = &mut out.out[r * d..(r + 1) * d];
            if sum == 0.0 {
                dst.fill(0.0);
            } else {
                for (x, &acc) in dst.iter_mut().zip(o.row(r)) {
                    *x = p.round(acc / sum);
                }
            }
            out.row_sum[r] = sum;
            out.row_max[r] = m.as_slice()[r];
        }

        TaskStats {
            visited_blocks: visit.len(),
            skipped_blocks: self.tiling.tc - visit.len(),
        }
    }

    /// Copy `rows` rows of `d` elements from `src` into `tile`, zeroing dead
    /// head-dim lanes by selection so non-finite padding cannot leak in.
    fn load_rows(&self, src: &Tensor, offset: usize, rows: usize, tile: &mut Tile<'_>) {
        let d = tile.cols();
        src.copy_to_f32(offset, &mut tile.as_mut_slice()[..rows * d]);
        for r in 0..rows {
            for (x, &live) in tile.row_mut(r).iter_mut().zip(&self.live_lanes) {
                if !live {
                    *x = 0.0;
                }
            }
        }
    }
}
