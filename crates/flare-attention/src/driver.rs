//! Kernel driver: validate, tile, declare regions, partition, launch.
//!
//! [`FlashAttention::compile`] does all build-time work and yields a
//! [`CompiledKernel`]; every configuration error surfaces there, before any
//! compute. [`CompiledKernel::launch`] checks the supplied tensors against
//! the declared regions and runs one engine instance per active core in
//! parallel, each writing only its own contiguous output regions.

use rayon::prelude::*;

use flare_core::{DType, FlareError, Result, Shape, Tensor};
use flare_kernels::Precision;

use crate::config::KernelConfig;
use crate::engine::{BlockEngine, CoreReport};
use crate::partition::{core_region, partition, split_disjoint, WorkPlan};
use crate::problem::{AttentionDesc, AttentionInputs, ProblemShape, TensorDesc};
use crate::tiling::{GreedyTiling, TilingPara, TilingStrategy, WorkingSet};
use crate::window::Window;

/// A global-memory tensor declared by a compiled kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionDecl {
    pub name: &'static str,
    pub shape: Shape,
    pub dtype: DType,
}

impl RegionDecl {
    pub fn new(name: &'static str, shape: impl Into<Shape>, dtype: DType) -> Self {
        Self {
            name,
            shape: shape.into(),
            dtype,
        }
    }

    fn from_desc(name: &'static str, desc: &TensorDesc) -> Self {
        Self::new(name, desc.shape.clone(), desc.dtype)
    }

    fn check(&self, tensor: &Tensor) -> Result<()> {
        if tensor.shape() != &self.shape {
            return Err(FlareError::ShapeMismatch {
                name: self.name,
                expected: self.shape.dims().to_vec(),
                got: tensor.dims().to_vec(),
            });
        }
        if tensor.dtype() != self.dtype {
            return Err(FlareError::DTypeMismatch {
                name: self.name,
                expected: self.dtype,
                got: tensor.dtype(),
            });
        }
        Ok(())
    }
}

/// Host tensors produced by a launch, before the variant picks its outputs.
#[derive(Debug, Clone)]
pub struct RawOutputs {
    pub out: Tensor,
    pub row_sum: Tensor,
    pub row_max: Tensor,
}

/// Output of the forward variant.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// `[batch, heads, query_len, head_dim]`
    pub out: Tensor,
    /// Final softmax denominator `l`, `[batch, heads, query_len]`.
    pub row_sum: Tensor,
    /// Final running max `m`, `[batch, heads, query_len]`.
    pub row_max: Tensor,
}

/// Extension point distinguishing kernel variants.
///
/// Variants are chosen at build time and dispatched statically through
/// [`FlashAttention<V>`].
pub trait KernelVariant {
    type Output;

    fn name(&self) -> &'static str;

    /// Inputs declared in addition to Q, K, V, the dim mask and the present
    /// masks. A variant must override this, even to declare nothing.
    fn define_custom_inputs(&self, desc: &AttentionDesc) -> Result<Vec<RegionDecl>> {
        let _ = desc;
        Err(FlareError::NotImplemented("define_custom_inputs"))
    }

    /// Output regions for a validated problem.
    fn define_outputs(&self, problem: &ProblemShape, out_dtype: DType, stats_dtype: DType) -> Vec<RegionDecl>;

    /// The supplied tensors, named as declared, in declaration order.
    fn collect_inputs<'a>(&self, inputs: &AttentionInputs<'a>) -> Vec<(&'static str, &'a Tensor)>;

    /// Select this variant's outputs from the launch results.
    fn collect_outputs(&self, raw: RawOutputs) -> Self::Output;
}

fn common_input_decls(desc: &AttentionDesc) -> Vec<RegionDecl> {
    let mut decls = vec![
        RegionDecl::from_desc("query", &desc.query),
        RegionDecl::from_desc("key", &desc.key),
        RegionDecl::from_desc("value", &desc.value),
        RegionDecl::from_desc("dim_mask", &desc.dim_mask),
    ];
    let optional = [
        ("attn_mask", &desc.attn_mask),
        ("dropout_mask", &desc.dropout_mask),
        ("alibi_mask", &desc.alibi_mask),
    ];
    for (name, d) in optional {
        if let Some(d) = d {
            decls.push(RegionDecl::from_desc(name, d));
        }
    }
    decls
}

/// Q, K, V, the dim mask and whichever masks are present, in declaration order.
pub fn common_inputs<'a>(inputs: &AttentionInputs<'a>) -> Vec<(&'static str, &'a Tensor)> {
    let mut tensors = vec![
        ("query", inputs.query),
        ("key", inputs.key),
        ("value", inputs.value),
        ("dim_mask", inputs.dim_mask),
    ];
    let optional = [
        ("attn_mask", inputs.attn_mask),
        ("dropout_mask", inputs.dropout_mask),
        ("alibi_mask", inputs.alibi_mask),
    ];
    tensors.extend(optional.into_iter().filter_map(|(name, t)| t.map(|t| (name, t))));
    tensors
}

/// Forward pass emitting `O` plus the `l` / `m` statistics a backward pass needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardVariant;

impl KernelVariant for ForwardVariant {
    type Output = ForwardOutput;

    fn name(&self) -> &'static str {
        "forward"
    }

    fn define_custom_inputs(&self, _desc: &AttentionDesc) -> Result<Vec<RegionDecl>> {
        Ok(Vec::new())
    }

    fn define_outputs(&self, problem: &ProblemShape, out_dtype: DType, stats_dtype: DType) -> Vec<RegionDecl> {
        vec![
            RegionDecl::new("out", problem.output_dims(), out_dtype),
            RegionDecl::new("row_sum", problem.stats_dims(), stats_dtype),
            RegionDecl::new("row_max", problem.stats_dims(), stats_dtype),
        ]
    }

    fn collect_inputs<'a>(&self, inputs: &AttentionInputs<'a>) -> Vec<(&'static str, &'a Tensor)> {
        common_inputs(inputs)
    }

    fn collect_outputs(&self, raw: RawOutputs) -> ForwardOutput {
        ForwardOutput {
            out: raw.out,
            row_sum: raw.row_sum,
            row_max: raw.row_max,
        }
    }
}

/// Inference pass emitting `O` only.
#[derive(Debug, Clone, Copy, Default)]
pub struct InferenceVariant;

impl KernelVariant for InferenceVariant {
    type Output = Tensor;

    fn name(&self) -> &'static str {
        "inference"
    }

    fn define_custom_inputs(&self, _desc: &AttentionDesc) -> Result<Vec<RegionDecl>> {
        Ok(Vec::new())
    }

    fn define_outputs(&self, problem: &ProblemShape, out_dtype: DType, _stats_dtype: DType) -> Vec<RegionDecl> {
        vec![RegionDecl::new("out", problem.output_dims(), out_dtype)]
    }

    fn collect_inputs<'a>(&self, inputs: &AttentionInputs<'a>) -> Vec<(&'static str, &'a Tensor)> {
        common_inputs(inputs)
    }

    fn collect_outputs(&self, raw: RawOutputs) -> Tensor {
        raw.out
    }
}

/// Fast-memory working-set model for a problem's dtypes and precision.
pub fn working_set(desc: &AttentionDesc, precision: Precision) -> WorkingSet {
    let work_bytes = precision.element_size();
    let mask_bytes = |d: &Option<TensorDesc>| d.as_ref().map(|d| d.dtype.element_size().max(work_bytes));
    WorkingSet {
        input_bytes: desc.query.dtype.element_size(),
        work_bytes,
        attn_mask_bytes: mask_bytes(&desc.attn_mask),
        dropout_mask_bytes: mask_bytes(&desc.dropout_mask),
        alibi_bytes: mask_bytes(&desc.alibi_mask),
    }
}

/// Kernel builder for variant `V`.
pub struct FlashAttention<V: KernelVariant> {
    variant: V,
    desc: AttentionDesc,
    config: KernelConfig,
}

impl<V: KernelVariant> FlashAttention<V> {
    pub fn new(variant: V, desc: AttentionDesc, config: KernelConfig) -> Self {
        Self {
            variant,
            desc,
            config,
        }
    }

    /// Build with the tiling strategy named by the configuration.
    pub fn compile(self) -> Result<CompiledKernel<V>> {
        let greedy = GreedyTiling::new(
            working_set(&self.desc, self.config.precision()),
            self.config.fast_memory_bytes,
        );
        let strategy = self.config.tiling.strategy(greedy);
        self.compile_with(strategy.as_ref())
    }

    /// Build with a caller-supplied tiling strategy.
    pub fn compile_with(self, strategy: &dyn TilingStrategy) -> Result<CompiledKernel<V>> {
        self.config.validate()?;
        let problem = self.desc.validate()?;
        let precision = self.config.precision();

        let tiling = strategy.tile(problem.query_len, problem.key_len, problem.head_dim)?;
        tiling.validate(problem.query_len, problem.key_len)?;
        let working_set_bytes = working_set(&self.desc, precision).bytes(
            tiling.max_query_block(),
            tiling.max_key_block(),
            problem.head_dim,
        );
        if working_set_bytes > self.config.fast_memory_bytes {
            return Err(FlareError::config(format!(
                "{} tiling {}x{} needs {} bytes of fast memory, budget is {}",
                strategy.name(),
                tiling.br,
                tiling.bc,
                working_set_bytes,
                self.config.fast_memory_bytes
            )));
        }

        let mut inputs = common_input_decls(&self.desc);
        inputs.extend(self.variant.define_custom_inputs(&self.desc)?);

        let out_dtype = self.desc.query.dtype;
        let stats_dtype = match precision {
            Precision::Full => DType::F32,
            Precision::Half => out_dtype,
        };
        let outputs = self.variant.define_outputs(&problem, out_dtype, stats_dtype);

        let plan = partition(problem.batch_heads(), tiling.tr, self.config.core_count)?;

        tracing::info!(
            "compiled '{}' ({} variant): {} tiling Br={} Bc={} Tr={} Tc={}, {} tasks on {} cores, {} of {} bytes fast memory",
            self.config.kernel_name,
            self.variant.name(),
            strategy.name(),
            tiling.br,
            tiling.bc,
            tiling.tr,
            tiling.tc,
            plan.total_tasks(),
            plan.active_cores(),
            working_set_bytes,
            self.config.fast_memory_bytes
        );

        let window = self.config.window();
        Ok(CompiledKernel {
            variant: self.variant,
            kernel_name: self.config.kernel_name,
            problem,
            tiling,
            window,
            precision,
            fast_memory_bytes: self.config.fast_memory_bytes,
            working_set_bytes,
            plan,
            inputs,
            outputs,
            stats_dtype,
        })
    }
}

/// Per-core results of one launch.
#[derive(Debug, Clone, Default)]
pub struct LaunchReport {
    pub cores: Vec<CoreReport>,
}

impl LaunchReport {
    /// Highest fast-memory reservation on any core.
    pub fn peak_fast_memory(&self) -> usize {
        self.cores.iter().map(|c| c.peak_fast_memory).max().unwrap_or(0)
    }

    pub fn visited_blocks(&self) -> usize {
        self.cores.iter().map(|c| c.visited_blocks).sum()
    }

    pub fn skipped_blocks(&self) -> usize {
        self.cores.iter().map(|c| c.skipped_blocks).sum()
    }
}

/// A fully built kernel: tiling, work plan and declared regions are fixed.
#[derive(Debug)]
pub struct CompiledKernel<V: KernelVariant> {
    variant: V,
    kernel_name: String,
    problem: ProblemShape,
    tiling: TilingPara,
    window: Window,
    precision: Precision,
    fast_memory_bytes: usize,
    working_set_bytes: usize,
    plan: WorkPlan,
    inputs: Vec<RegionDecl>,
    outputs: Vec<RegionDecl>,
    stats_dtype: DType,
}

impl<V: KernelVariant> CompiledKernel<V> {
    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    pub fn variant(&self) -> &V {
        &self.variant
    }

    pub fn problem(&self) -> &ProblemShape {
        &self.problem
    }

    pub fn tiling(&self) -> &TilingPara {
        &self.tiling
    }

    pub fn window(&self) -> Window {
        self.window
    }

    pub fn plan(&self) -> &WorkPlan {
        &self.plan
    }

    /// Declared input regions, in order.
    pub fn inputs(&self) -> &[RegionDecl] {
        &self.inputs
    }

    /// Declared output regions, in order.
    pub fn outputs(&self) -> &[RegionDecl] {
        &self.outputs
    }

    /// Modelled peak fast-memory use of one task, in bytes.
    pub fn working_set_bytes(&self) -> usize {
        self.working_set_bytes
    }

    /// Run the kernel on `inputs`.
    pub fn launch(&self, inputs: &AttentionInputs<'_>) -> Result<V::Output> {
        self.launch_profiled(inputs).map(|(out, _)| out)
    }

    /// Run the kernel and report per-core block and fast-memory counts.
    pub fn launch_profiled(&self, inputs: &AttentionInputs<'_>) -> Result<(V::Output, LaunchReport)> {
        self.check_inputs(inputs)?;

        let problem = &self.problem;
        let tiling = &self.tiling;
        let (q_len, d) = (problem.query_len, problem.head_dim);
        let rows = problem.batch_heads() * q_len;
        let mut out = vec![0.0f32; rows * d];
        let mut row_sum = vec![0.0f32; rows];
        let mut row_max = vec![0.0f32; rows];

        let cores = &self.plan.cores;
        let out_chunks = split_disjoint(&mut out, cores.iter().map(|c| core_region(c, tiling, q_len, d)));
        let sum_chunks = split_disjoint(&mut row_sum, cores.iter().map(|c| core_region(c, tiling, q_len, 1)));
        let max_chunks = split_disjoint(&mut row_max, cores.iter().map(|c| core_region(c, tiling, q_len, 1)));

        let engine = BlockEngine::new(inputs, *problem, *tiling, self.window, self.precision);
        let budget = self.fast_memory_bytes;
        let reports: Vec<CoreReport> = cores
            .par_iter()
            .zip(out_chunks)
            .zip(sum_chunks)
            .zip(max_chunks)
            .map(|(((core, out), row_sum), row_max)| {
                tracing::debug!(
                    "core {}: tasks {:?}, batch-heads {:?}",
                    core.core_idx,
                    core.tasks,
                    core.batch_heads
                );
                engine.run_core(core, budget, out, row_sum, row_max)
            })
            .collect();

        let out_dtype = inputs.query.dtype();
        let raw = RawOutputs {
            out: Tensor::from_f32_as(&out, &problem.output_dims(), out_dtype),
            row_sum: Tensor::from_f32_as(&row_sum, &problem.stats_dims(), self.stats_dtype),
            row_max: Tensor::from_f32_as(&row_max, &problem.stats_dims(), self.stats_dtype),
        };
        Ok((self.variant.collect_outputs(raw), LaunchReport { cores: reports }))
    }

    fn check_inputs(&self, inputs: &AttentionInputs<'_>) -> Result<()> {
        let supplied = self.variant.collect_inputs(inputs);
        for decl in &self.inputs {
            match supplied.iter().find(|(name, _)| *name == decl.name) {
                Some((_, tensor)) => decl.check(tensor)?,
                None => return Err(FlareError::MissingInput(decl.name)),
            }
        }
        if let Some((name, _)) = supplied
            .iter()
            .find(|(name, _)| !self.inputs.iter().any(|d| d.name == *name))
        {
            return Err(FlareError::config(format!(
                "'{name}' was not declared when kernel '{}' was compiled",
                self.kernel_name
            )));
        }
        Ok(())
    }
}

/// Compile and launch the forward variant in one call.
pub fn flash_attention(inputs: &AttentionInputs<'_>, config: KernelConfig) -> Result<ForwardOutput> {
    FlashAttention::new(ForwardVariant, inputs.desc(), config)
        .compile()?
        .launch(inputs)
}
