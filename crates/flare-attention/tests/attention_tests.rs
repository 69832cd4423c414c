//! End-to-end tests of the tiled attention kernel against the direct reference.
//! Run with: cargo test -p flare-attention -- --nocapture

use flare_attention::mask::{alibi_bias, block_window_mask, causal_mask, dropout_mask, key_padding_mask};
use flare_attention::{
    flash_attention, reference_attention, AttentionDesc, AttentionInputs, FixedTiling, FlashAttention,
    ForwardVariant, InferenceVariant, KernelConfig, KernelVariant, ProblemShape, RawOutputs, RegionDecl,
    TilingSelector, Window,
};
use flare_core::{DType, ErrorKind, FlareError, Tensor};
use proptest::prelude::*;

const HALF_TOL: f32 = 1e-2;
const FULL_TOL: f32 = 1e-4;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!(
            (x - y).abs() < tol,
            "element {} differs: {} vs {} (tol={})",
            i, x, y, tol
        );
    }
}

fn qkv(b: usize, h: usize, n_q: usize, n_kv: usize, d: usize, dtype: DType, seed: u64) -> (Tensor, Tensor, Tensor) {
    (
        Tensor::rand_uniform_seeded(&[b, h, n_q, d], -1.0, 1.0, seed, dtype),
        Tensor::rand_uniform_seeded(&[b, h, n_kv, d], -1.0, 1.0, seed + 1, dtype),
        Tensor::rand_uniform_seeded(&[b, h, n_kv, d], -1.0, 1.0, seed + 2, dtype),
    )
}

fn full_dim_mask(d: usize) -> Tensor {
    Tensor::from_i8(&vec![1; d], &[d])
}

/// `t[:, :, ..len, :]` of a rank-4 tensor.
fn truncate_seq(t: &Tensor, len: usize) -> Tensor {
    let [b, h, n, d] = [t.dims()[0], t.dims()[1], t.dims()[2], t.dims()[3]];
    let data = t.to_f32_vec();
    let mut out = Vec::with_capacity(b * h * len * d);
    for bh in 0..b * h {
        out.extend_from_slice(&data[bh * n * d..(bh * n + len) * d]);
    }
    Tensor::from_f32_as(&out, &[b, h, len, d], t.dtype())
}

fn precision_cases() -> [(DType, bool, f32); 2] {
    [(DType::F16, false, HALF_TOL), (DType::F32, true, FULL_TOL)]
}

// ============================================================================
// Equivalence to the direct reference
// ============================================================================

#[test]
fn test_matches_reference_without_masks() {
    init_tracing();
    for (dtype, high_precision, tol) in precision_cases() {
        let (q, k, v) = qkv(2, 3, 96, 80, 32, dtype, 10);
        let dim_mask = full_dim_mask(32);
        let inputs = AttentionInputs::new(&q, &k, &v, &dim_mask);

        let config = KernelConfig::new("fa_plain")
            .with_core_count(4)
            .with_high_precision(high_precision)
            .with_tiling(TilingSelector::Fixed { query_block: 32, key_block: 32 });
        let fwd = flash_attention(&inputs, config).unwrap();
        let reference = reference_attention(&inputs).unwrap();

        assert_eq!(fwd.out.dims(), &[2, 3, 96, 32]);
        assert_eq!(fwd.out.dtype(), dtype);
        assert_close(&fwd.out.to_f32_vec(), &reference.out, tol);
    }
}

#[test]
fn test_matches_reference_with_each_mask() {
    init_tracing();
    let (b, h, n_q, n_kv, d) = (2, 2, 80, 72, 32);
    for (dtype, high_precision, tol) in precision_cases() {
        let (q, k, v) = qkv(b, h, n_q, n_kv, d, dtype, 20);
        let dim_mask = full_dim_mask(d);
        let attn = key_padding_mask(&[50, 72], n_q, n_kv, dtype);
        let drop = dropout_mask(&[b, h, n_q, n_kv], 0.8, 3, dtype);
        let alibi = alibi_bias(h, n_kv, dtype);

        let plain = AttentionInputs::new(&q, &k, &v, &dim_mask);
        let cases = [
            ("attn", plain.with_attn_mask(&attn)),
            ("dropout", plain.with_dropout_mask(&drop)),
            ("alibi", plain.with_alibi_mask(&alibi)),
            (
                "all",
                plain.with_attn_mask(&attn).with_dropout_mask(&drop).with_alibi_mask(&alibi),
            ),
        ];
        for (label, inputs) in cases {
            let config = KernelConfig::new(format!("fa_{label}"))
                .with_core_count(5)
                .with_high_precision(high_precision)
                .with_tiling(TilingSelector::Fixed { query_block: 32, key_block: 16 });
            let fwd = flash_attention(&inputs, config).unwrap();
            let reference = reference_attention(&inputs).unwrap();
            assert_close(&fwd.out.to_f32_vec(), &reference.out, tol);
        }
    }
}

#[test]
fn test_greedy_tiling_matches_reference() {
    let (q, k, v) = qkv(1, 4, 200, 300, 64, DType::F16, 30);
    let dim_mask = full_dim_mask(64);
    let inputs = AttentionInputs::new(&q, &k, &v, &dim_mask);

    let config = KernelConfig::new("fa_greedy").with_fast_memory_bytes(64 * 1024);
    let kernel = FlashAttention::new(ForwardVariant, inputs.desc(), config).compile().unwrap();
    // The budget forces more than one block in at least one dimension
    assert!(kernel.tiling().tr > 1 || kernel.tiling().tc > 1);
    assert!(kernel.working_set_bytes() <= 64 * 1024);

    let fwd = kernel.launch(&inputs).unwrap();
    let reference = reference_attention(&inputs).unwrap();
    assert_close(&fwd.out.to_f32_vec(), &reference.out, HALF_TOL);
}

#[test]
fn test_saved_statistics_match_reference() {
    let (q, k, v) = qkv(1, 2, 48, 64, 16, DType::F32, 40);
    let dim_mask = full_dim_mask(16);
    let alibi = alibi_bias(2, 64, DType::F32);
    let inputs = AttentionInputs::new(&q, &k, &v, &dim_mask).with_alibi_mask(&alibi);

    let config = KernelConfig::new("fa_stats")
        .with_high_precision(true)
        .with_tiling(TilingSelector::Fixed { query_block: 16, key_block: 16 });
    let fwd = flash_attention(&inputs, config).unwrap();
    let reference = reference_attention(&inputs).unwrap();

    assert_eq!(fwd.row_sum.dims(), &[1, 2, 48]);
    assert_eq!(fwd.row_max.dtype(), DType::F32);
    assert_close(&fwd.row_max.to_f32_vec(), &reference.row_max, FULL_TOL);
    for (l, l_ref) in fwd.row_sum.to_f32_vec().iter().zip(&reference.row_sum) {
        assert!((l - l_ref).abs() / l_ref < 1e-4, "row sum {l} vs {l_ref}");
    }
}

#[test]
fn test_inference_variant_matches_forward() {
    let (q, k, v) = qkv(1, 2, 40, 40, 16, DType::F16, 50);
    let dim_mask = full_dim_mask(16);
    let inputs = AttentionInputs::new(&q, &k, &v, &dim_mask);
    let config = KernelConfig::new("fa_infer").with_core_count(3);

    let fwd = flash_attention(&inputs, config.clone()).unwrap();
    let out = FlashAttention::new(InferenceVariant, inputs.desc(), config)
        .compile()
        .unwrap()
        .launch(&inputs)
        .unwrap();
    assert_eq!(out, fwd.out);
}

// ============================================================================
// Masking
// ============================================================================

#[test]
fn test_masked_keys_behave_as_absent() {
    let (n_q, n_kv, len, d) = (64, 96, 37, 32);
    for (dtype, high_precision, tol) in precision_cases() {
        let (q, k, v) = qkv(1, 2, n_q, n_kv, d, dtype, 60);
        let dim_mask = full_dim_mask(d);
        let mask = key_padding_mask(&[len], n_q, n_kv, dtype);
        let inputs = AttentionInputs::new(&q, &k, &v, &dim_mask).with_attn_mask(&mask);

        let config = KernelConfig::new("fa_padding")
            .with_high_precision(high_precision)
            .with_tiling(TilingSelector::Fixed { query_block: 16, key_block: 32 });
        let fwd = flash_attention(&inputs, config).unwrap();

        let (k_short, v_short) = (truncate_seq(&k, len), truncate_seq(&v, len));
        let restricted = reference_attention(&AttentionInputs::new(&q, &k_short, &v_short, &dim_mask)).unwrap();
        assert_close(&fwd.out.to_f32_vec(), &restricted.out, tol);
    }
}

#[test]
fn test_scores_below_f16_range_in_high_precision() {
    // Every key carries a 7x fill-value mask: all real scores sit near -70000,
    // below the f16 minimum. 40 keys leave padded columns in the last block.
    let (n_q, n_kv, d) = (32, 40, 16);
    let (q, k, v) = qkv(1, 2, n_q, n_kv, d, DType::F32, 65);
    let dim_mask = full_dim_mask(d);
    let mask = Tensor::full(&[1, n_q, n_kv], 7.0, DType::F32);
    let inputs = AttentionInputs::new(&q, &k, &v, &dim_mask).with_attn_mask(&mask);

    let config = KernelConfig::new("fa_deep_mask")
        .with_high_precision(true)
        .with_tiling(TilingSelector::Fixed { query_block: 16, key_block: 32 });
    let fwd = flash_attention(&inputs, config).unwrap();

    // A uniform shift leaves the softmax unchanged
    let unmasked = reference_attention(&AttentionInputs::new(&q, &k, &v, &dim_mask)).unwrap();
    let out = fwd.out.to_f32_vec();
    assert!(out.iter().any(|&x| x != 0.0));
    assert_close(&out, &unmasked.out, HALF_TOL);

    let row_max = fwd.row_max.to_f32_vec();
    assert!(row_max.iter().all(|&m| m < -65504.0));
}

#[test]
fn test_per_batch_attention_mask() {
    let (q, k, v) = qkv(2, 3, 32, 48, 16, DType::F32, 70);
    let dim_mask = full_dim_mask(16);
    let mask = key_padding_mask(&[10, 48], 32, 48, DType::F32);
    let inputs = AttentionInputs::new(&q, &k, &v, &dim_mask).with_attn_mask(&mask);

    let config = KernelConfig::new("fa_batch_mask")
        .with_high_precision(true)
        .with_tiling(TilingSelector::Fixed { query_block: 16, key_block: 16 });
    let fwd = flash_attention(&inputs, config).unwrap();
    let reference = reference_attention(&inputs).unwrap();
    assert_close(&fwd.out.to_f32_vec(), &reference.out, FULL_TOL);

    // Batch 0 only sees ten keys
    let unmasked = reference_attention(&AttentionInputs::new(&q, &k, &v, &dim_mask)).unwrap();
    let half = 3 * 32 * 16;
    assert_close(&fwd.out.to_f32_vec()[half..], &unmasked.out[half..], FULL_TOL);
}

// ============================================================================
// Windowing
// ============================================================================

#[test]
fn test_diagonal_window_matches_block_diagonal_reference() {
    init_tracing();
    let (n, d) = (64, 16);
    for (dtype, high_precision, tol) in precision_cases() {
        let (q, k, v) = qkv(1, 2, n, n, d, dtype, 80);
        let dim_mask = full_dim_mask(d);
        let inputs = AttentionInputs::new(&q, &k, &v, &dim_mask);

        let config = KernelConfig::new("fa_diag")
            .with_window(0, 0)
            .with_high_precision(high_precision)
            .with_tiling(TilingSelector::Fixed { query_block: 16, key_block: 16 });
        let kernel = FlashAttention::new(ForwardVariant, inputs.desc(), config).compile().unwrap();
        let (fwd, report) = kernel.launch_profiled(&inputs).unwrap();

        // 2 heads x 4 query blocks, one key block each
        assert_eq!(report.visited_blocks(), 8);
        assert_eq!(report.skipped_blocks(), 8 * 3);

        let band = block_window_mask(kernel.tiling(), Window::new(0, 0), dtype);
        let reference = reference_attention(&inputs.with_attn_mask(&band)).unwrap();
        assert_close(&fwd.out.to_f32_vec(), &reference.out, tol);
    }
}

#[test]
fn test_causal_window_matches_causal_reference() {
    let (n, d) = (80, 32);
    for (dtype, high_precision, tol) in precision_cases() {
        let (q, k, v) = qkv(2, 2, n, n, d, dtype, 90);
        let dim_mask = full_dim_mask(d);
        let causal = causal_mask(n, n, dtype);
        let inputs = AttentionInputs::new(&q, &k, &v, &dim_mask).with_attn_mask(&causal);

        let config = KernelConfig::new("fa_causal")
            .with_window(usize::MAX, 0)
            .with_high_precision(high_precision)
            .with_tiling(TilingSelector::Fixed { query_block: 16, key_block: 16 });
        let fwd = flash_attention(&inputs, config).unwrap();
        let reference = reference_attention(&inputs).unwrap();
        assert_close(&fwd.out.to_f32_vec(), &reference.out, tol);
    }
}

#[test]
fn test_skipped_blocks_are_never_read() {
    // Keys 32.. lie in blocks after every query block's diagonal
    let (n_q, n_kv, d) = (32, 64, 16);
    let (q, k, v) = qkv(1, 1, n_q, n_kv, d, DType::F32, 100);
    let poison = |t: &Tensor| {
        let mut data = t.to_f32_vec();
        data[n_q * d..].fill(f32::NAN);
        Tensor::from_f32(&data, t.dims())
    };
    let (k_poisoned, v_poisoned) = (poison(&k), poison(&v));
    let dim_mask = full_dim_mask(d);
    let causal = causal_mask(n_q, n_kv, DType::F32);
    let inputs = AttentionInputs::new(&q, &k_poisoned, &v_poisoned, &dim_mask).with_attn_mask(&causal);

    let config = KernelConfig::new("fa_skip")
        .with_window(usize::MAX, 0)
        .with_high_precision(true)
        .with_tiling(TilingSelector::Fixed { query_block: 16, key_block: 16 });
    let fwd = flash_attention(&inputs, config).unwrap();
    assert!(fwd.out.to_f32_vec().iter().all(|x| x.is_finite()));

    let (k_short, v_short) = (truncate_seq(&k, n_q), truncate_seq(&v, n_q));
    let causal_short = causal_mask(n_q, n_q, DType::F32);
    let reference = reference_attention(
        &AttentionInputs::new(&q, &k_short, &v_short, &dim_mask).with_attn_mask(&causal_short),
    )
    .unwrap();
    assert_close(&fwd.out.to_f32_vec(), &reference.out, FULL_TOL);
}

// ============================================================================
// Trailing blocks
// ============================================================================

#[test]
fn test_trailing_query_block_130_rows() {
    for (dtype, high_precision, tol) in precision_cases() {
        let (q, k, v) = qkv(1, 2, 130, 100, 32, dtype, 110);
        let dim_mask = full_dim_mask(32);
        let inputs = AttentionInputs::new(&q, &k, &v, &dim_mask);

        let config = KernelConfig::new("fa_trailing")
            .with_core_count(4)
            .with_high_precision(high_precision)
            .with_tiling(TilingSelector::Fixed { query_block: 64, key_block: 64 });
        let kernel = FlashAttention::new(ForwardVariant, inputs.desc(), config).compile().unwrap();
        let t = kernel.tiling();
        assert_eq!((t.tr, t.br, t.last_br), (3, 64, 2));
        assert_eq!((t.tc, t.bc, t.last_bc), (2, 64, 36));

        let fwd = kernel.launch(&inputs).unwrap();
        let reference = reference_attention(&inputs).unwrap();
        let out = fwd.out.to_f32_vec();
        assert_close(&out, &reference.out, tol);

        // The two rows of the trailing block, both heads
        for head in 0..2 {
            let rows = (head * 130 + 128) * 32..(head * 130 + 130) * 32;
            assert_close(&out[rows.clone()], &reference.out[rows], tol);
        }
    }
}

#[test]
fn test_compile_with_external_strategy() {
    let (q, k, v) = qkv(1, 1, 50, 50, 16, DType::F32, 120);
    let dim_mask = full_dim_mask(16);
    let inputs = AttentionInputs::new(&q, &k, &v, &dim_mask);
    let strategy = FixedTiling::new(16, 48);
    let kernel = FlashAttention::new(ForwardVariant, inputs.desc(), KernelConfig::default().with_high_precision(true))
        .compile_with(&strategy)
        .unwrap();
    assert_eq!((kernel.tiling().tc, kernel.tiling().last_bc), (2, 2));

    let fwd = kernel.launch(&inputs).unwrap();
    let reference = reference_attention(&inputs).unwrap();
    assert_close(&fwd.out.to_f32_vec(), &reference.out, FULL_TOL);
}

// ============================================================================
// Determinism
// ============================================================================

#[test]
fn test_bit_identical_across_runs_and_core_counts() {
    let (q, k, v) = qkv(2, 4, 96, 96, 32, DType::F16, 130);
    let dim_mask = full_dim_mask(32);
    let drop = dropout_mask(&[2, 4, 96, 96], 0.9, 11, DType::F16);
    let inputs = AttentionInputs::new(&q, &k, &v, &dim_mask).with_dropout_mask(&drop);
    let tiling = TilingSelector::Fixed { query_block: 32, key_block: 32 };

    let run = |cores: usize| {
        let config = KernelConfig::new("fa_det").with_core_count(cores).with_tiling(tiling);
        flash_attention(&inputs, config).unwrap()
    };
    let first = run(8);
    let bits = |t: &Tensor| t.as_f16_slice().unwrap().iter().map(|x| x.to_bits()).collect::<Vec<_>>();
    for cores in [8, 8, 1, 3, 32] {
        let again = run(cores);
        assert_eq!(bits(&again.out), bits(&first.out), "core_count={cores}");
        assert_eq!(bits(&again.row_sum), bits(&first.row_sum));
    }
}

// ============================================================================
// Dim mask
// ============================================================================

#[test]
fn test_padding_lanes_do_not_leak() {
    let (n, d, actual) = (40, 32, 20);
    let (q, k, v) = qkv(1, 2, n, n, d, DType::F32, 140);
    let with_pad = |t: &Tensor, pad: f32| {
        let mut data = t.to_f32_vec();
        for row in data.chunks_mut(d) {
            row[actual..].fill(pad);
        }
        Tensor::from_f32(&data, t.dims())
    };
    let dim_mask = Tensor::from_i8(&vec![1; actual], &[actual]);
    let config = KernelConfig::new("fa_dim")
        .with_high_precision(true)
        .with_tiling(TilingSelector::Fixed { query_block: 16, key_block: 16 });

    let (q0, k0, v0) = (with_pad(&q, 0.0), with_pad(&k, 0.0), with_pad(&v, 0.0));
    let clean = flash_attention(&AttentionInputs::new(&q0, &k0, &v0, &dim_mask), config.clone()).unwrap();

    let (q1, k1, v1) = (with_pad(&q, 3.0), with_pad(&k, 1e6), with_pad(&v, 1e6));
    let noisy = flash_attention(&AttentionInputs::new(&q1, &k1, &v1, &dim_mask), config).unwrap();

    assert_eq!(noisy.out, clean.out);
    let out = noisy.out.to_f32_vec();
    assert!(out.chunks(d).all(|row| row[actual..].iter().all(|&x| x == 0.0)));

    // Scale uses the real head dim
    let reference = reference_attention(&AttentionInputs::new(&q1, &k1, &v1, &dim_mask)).unwrap();
    assert_close(&out, &reference.out, FULL_TOL);
}

// ============================================================================
// Fast-memory budget
// ============================================================================

#[test]
fn test_peak_fast_memory_within_budget() {
    let (q, k, v) = qkv(1, 4, 256, 256, 64, DType::F16, 150);
    let dim_mask = full_dim_mask(64);
    let attn = causal_mask(256, 256, DType::F16);
    let drop = dropout_mask(&[1, 4, 256, 256], 0.9, 5, DType::F32);
    let alibi = alibi_bias(4, 256, DType::F16);
    let inputs = AttentionInputs::new(&q, &k, &v, &dim_mask)
        .with_attn_mask(&attn)
        .with_dropout_mask(&drop)
        .with_alibi_mask(&alibi);

    for budget in [40 * 1024, 96 * 1024, 256 * 1024] {
        let config = KernelConfig::new("fa_budget").with_fast_memory_bytes(budget).with_core_count(6);
        let kernel = FlashAttention::new(ForwardVariant, inputs.desc(), config).compile().unwrap();
        let (_, report) = kernel.launch_profiled(&inputs).unwrap();
        assert!(report.peak_fast_memory() > 0);
        assert!(report.peak_fast_memory() <= kernel.working_set_bytes());
        assert!(kernel.working_set_bytes() <= budget);
    }
}

// ============================================================================
// Build-time errors
// ============================================================================

#[test]
fn test_config_errors() {
    let (q, k, v) = qkv(1, 1, 32, 32, 64, DType::F16, 160);
    let dim_mask = full_dim_mask(64);
    let desc = AttentionInputs::new(&q, &k, &v, &dim_mask).desc();
    let compile = |config: KernelConfig| FlashAttention::new(ForwardVariant, desc.clone(), config).compile();

    // zero cores
    assert!(compile(KernelConfig::default().with_core_count(0)).unwrap_err().is_config());
    // a 16x16 working set at d=64 does not fit 1 KiB
    assert!(compile(KernelConfig::default().with_fast_memory_bytes(1024)).unwrap_err().is_config());
    // unaligned fixed blocks
    let unaligned = KernelConfig::default().with_tiling(TilingSelector::Fixed { query_block: 24, key_block: 16 });
    assert!(compile(unaligned).unwrap_err().is_config());

    // head dim not padded to the alignment unit
    let (q, k, v) = qkv(1, 1, 32, 32, 20, DType::F16, 161);
    let dim_mask = full_dim_mask(20);
    let err = flash_attention(&AttentionInputs::new(&q, &k, &v, &dim_mask), KernelConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);

    // zero task count
    let (q, k, v) = qkv(0, 4, 32, 32, 16, DType::F16, 162);
    let dim_mask = full_dim_mask(16);
    assert!(flash_attention(&AttentionInputs::new(&q, &k, &v, &dim_mask), KernelConfig::default())
        .unwrap_err()
        .is_config());
}

#[test]
fn test_config_from_json_file() {
    let path = std::env::temp_dir().join(format!("flare_config_{}.json", std::process::id()));
    std::fs::write(
        &path,
        r#"{
            "kernel_name": "fa_json",
            "core_count": 2,
            "prev_block_num": 1,
            "next_block_num": 0,
            "tiling": { "kind": "fixed", "query_block": 16, "key_block": 16 }
        }"#,
    )
    .unwrap();
    let config = KernelConfig::from_json_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    let (q, k, v) = qkv(1, 1, 64, 64, 16, DType::F16, 170);
    let dim_mask = full_dim_mask(16);
    let inputs = AttentionInputs::new(&q, &k, &v, &dim_mask);
    let kernel = FlashAttention::new(ForwardVariant, inputs.desc(), config).compile().unwrap();
    assert_eq!(kernel.kernel_name(), "fa_json");
    assert_eq!(kernel.window(), Window::new(1, 0));
    assert_eq!(kernel.plan().total_tasks(), 4);
    assert_eq!(kernel.plan().active_cores(), 2);
}

#[derive(Debug)]
struct BareVariant;

impl KernelVariant for BareVariant {
    type Output = Tensor;

    fn name(&self) -> &'static str {
        "bare"
    }

    fn define_outputs(&self, problem: &ProblemShape, out_dtype: DType, _stats_dtype: DType) -> Vec<RegionDecl> {
        vec![RegionDecl::new("out", problem.output_dims(), out_dtype)]
    }

    fn collect_inputs<'a>(&self, inputs: &AttentionInputs<'a>) -> Vec<(&'static str, &'a Tensor)> {
        flare_attention::driver::common_inputs(inputs)
    }

    fn collect_outputs(&self, raw: RawOutputs) -> Tensor {
        raw.out
    }
}

#[test]
fn test_variant_without_custom_inputs_is_not_implemented() {
    let (q, k, v) = qkv(1, 1, 16, 16, 16, DType::F16, 180);
    let dim_mask = full_dim_mask(16);
    let desc: AttentionDesc = AttentionInputs::new(&q, &k, &v, &dim_mask).desc();
    let err = FlashAttention::new(BareVariant, desc, KernelConfig::default()).compile().unwrap_err();
    assert!(matches!(err, FlareError::NotImplemented("define_custom_inputs")));
    assert_eq!(err.kind(), ErrorKind::NotImplemented);
}

// ============================================================================
// Property: arbitrary shapes and core counts match the reference
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_tiled_matches_reference(
        heads in 1usize..3,
        n_q in 1usize..70,
        n_kv in 1usize..70,
        cores in 1usize..9,
        br in prop::sample::select(vec![16usize, 32]),
        bc in prop::sample::select(vec![16usize, 32, 48]),
        seed in 0u64..1000,
    ) {
        let (q, k, v) = qkv(1, heads, n_q, n_kv, 16, DType::F32, seed);
        let dim_mask = full_dim_mask(16);
        let inputs = AttentionInputs::new(&q, &k, &v, &dim_mask);
        let config = KernelConfig::new("fa_prop")
            .with_core_count(cores)
            .with_high_precision(true)
            .with_tiling(TilingSelector::Fixed { query_block: br, key_block: bc });

        let fwd = flash_attention(&inputs, config).unwrap();
        let reference = reference_attention(&inputs).unwrap();
        for (x, y) in fwd.out.to_f32_vec().iter().zip(&reference.out) {
            prop_assert!((x - y).abs() < FULL_TOL, "{} vs {}", x, y);
        }
    }
}
