//! Kernel operands: tensor descriptors, shape validation and the derived
//! problem dimensions.

use flare_core::{DType, FlareError, Result, Shape, Tensor};

/// Shape and dtype of one global-memory operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
    pub shape: Shape,
    pub dtype: DType,
}

impl TensorDesc {
    pub fn new(shape: impl Into<Shape>, dtype: DType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
        }
    }

    pub fn of(tensor: &Tensor) -> Self {
        Self::new(tensor.shape().clone(), tensor.dtype())
    }
}

/// Tensors supplied by the caller for one launch.
#[derive(Debug, Clone, Copy)]
pub struct AttentionInputs<'a> {
    /// `[batch, heads, query_len, head_dim]`
    pub query: &'a Tensor,
    /// `[batch, heads, key_len, head_dim]`
    pub key: &'a Tensor,
    /// `[batch, heads, key_len, head_dim]`
    pub value: &'a Tensor,
    /// `[actual_head_dim]`, i8; non-zero marks a live lane
    pub dim_mask: &'a Tensor,
    /// `[1|batch, query_len, key_len]` or `[1|batch, 1|heads, query_len, key_len]`; 1 = masked
    pub attn_mask: Option<&'a Tensor>,
    /// `[batch, heads, query_len, key_len]`, pre-scaled 0 / 1/keep_prob
    pub dropout_mask: Option<&'a Tensor>,
    /// `[1|batch, 1|heads, 1, key_len]`
    pub alibi_mask: Option<&'a Tensor>,
}

impl<'a> AttentionInputs<'a> {
    pub fn new(query: &'a Tensor, key: &'a Tensor, value: &'a Tensor, dim_mask: &'a Tensor) -> Self {
        Self {
            query,
            key,
            value,
            dim_mask,
            attn_mask: None,
            dropout_mask: None,
            alibi_mask: None,
        }
    }

    pub fn with_attn_mask(mut self, mask: &'a Tensor) -> Self {
        self.attn_mask = Some(mask);
        self
    }

    pub fn with_dropout_mask(mut self, mask: &'a Tensor) -> Self {
        self.dropout_mask = Some(mask);
        self
    }

    pub fn with_alibi_mask(mut self, mask: &'a Tensor) -> Self {
        self.alibi_mask = Some(mask);
        self
    }

    /// Build-time descriptors of these tensors.
    pub fn desc(&self) -> AttentionDesc {
        AttentionDesc {
            query: TensorDesc::of(self.query),
            key: TensorDesc::of(self.key),
            value: TensorDesc::of(self.value),
            dim_mask: TensorDesc::of(self.dim_mask),
            attn_mask: self.attn_mask.map(TensorDesc::of),
            dropout_mask: self.dropout_mask.map(TensorDesc::of),
            alibi_mask: self.alibi_mask.map(TensorDesc::of),
        }
    }
}

/// Build-time description of every operand; presence of an optional
/// descriptor is the presence flag of that mask stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionDesc {
    pub query: TensorDesc,
    pub key: TensorDesc,
    pub value: TensorDesc,
    pub dim_mask: TensorDesc,
    pub attn_mask: Option<TensorDesc>,
    pub dropout_mask: Option<TensorDesc>,
    pub alibi_mask: Option<TensorDesc>,
}

/// Validated problem dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProblemShape {
    pub batch: usize,
    pub heads: usize,
    pub query_len: usize,
    pub key_len: usize,
    /// Padded head dim of Q/K/V.
    pub head_dim: usize,
    /// Unpadded head dim (length of the dim mask).
    pub actual_head_dim: usize,
}

impl ProblemShape {
    pub fn batch_heads(&self) -> usize {
        self.batch * self.heads
    }

    pub fn output_dims(&self) -> [usize; 4] {
        [self.batch, self.heads, self.query_len, self.head_dim]
    }

    pub fn stats_dims(&self) -> [usize; 3] {
        [self.batch, self.heads, self.query_len]
    }

    /// Softmax scale `1/sqrt(actual_head_dim)`.
    pub fn scale(&self) -> f32 {
        1.0 / (self.actual_head_dim as f32).sqrt()
    }
}

fn expect_float(name: &'static str, desc: &TensorDesc) -> Result<()> {
    if desc.dtype.is_float() {
        Ok(())
    } else {
        Err(FlareError::UnsupportedDType { name, dtype: desc.dtype })
    }
}

fn expect_shape(name: &'static str, desc: &TensorDesc, expected: &[usize]) -> Result<()> {
    if desc.shape.dims() == expected {
        Ok(())
    } else {
        Err(FlareError::ShapeMismatch {
            name,
            expected: expected.to_vec(),
            got: desc.shape.dims().to_vec(),
        })
    }
}

fn expect_broadcast(name: &'static str, dim: usize, full: usize, shape: &Shape, expected: Vec<usize>) -> Result<()> {
    if dim == 1 || dim == full {
        Ok(())
    } else {
        Err(FlareError::ShapeMismatch {
            name,
            expected,
            got: shape.dims().to_vec(),
        })
    }
}

impl AttentionDesc {
    /// Check the cross-operand invariants and derive the problem shape.
    pub fn validate(&self) -> Result<ProblemShape> {
        let [batch, heads, query_len, head_dim] = self.query.shape.rank4("query")?;
        let [_, _, key_len, _] = self.key.shape.rank4("key")?;

        expect_float("query", &self.query)?;
        for (name, desc) in [("key", &self.key), ("value", &self.value)] {
            if desc.dtype != self.query.dtype {
                return Err(FlareError::DTypeMismatch {
                    name,
                    expected: self.query.dtype,
                    got: desc.dtype,
                });
            }
        }
        expect_shape("key", &self.key, &[batch, heads, key_len, head_dim])?;
        expect_shape("value", &self.value, &[batch, heads, key_len, head_dim])?;

        if batch * heads == 0 || query_len == 0 {
            return Err(FlareError::config(format!(
                "zero task count for query shape {}",
                self.query.shape
            )));
        }
        if key_len == 0 {
            return Err(FlareError::config("key/value sequence length is zero"));
        }

        if self.dim_mask.dtype != DType::I8 {
            return Err(FlareError::DTypeMismatch {
                name: "dim_mask",
                expected: DType::I8,
                got: self.dim_mask.dtype,
            });
        }
        let actual_head_dim = match self.dim_mask.shape.dims() {
            &[n] if n >= 1 && n <= head_dim => n,
            other => {
                return Err(FlareError::ShapeMismatch {
                    name: "dim_mask",
                    expected: vec![head_dim],
                    got: other.to_vec(),
                })
            }
        };

        if let Some(mask) = &self.attn_mask {
            expect_float("attn_mask", mask)?;
            let expected = vec![batch, query_len, key_len];
            match mask.shape.dims() {
                &[b, q, k] if q == query_len && k == key_len => {
                    expect_broadcast("attn_mask", b, batch, &mask.shape, expected)?
                }
                &[b, h, q, k] if q == query_len && k == key_len => {
                    expect_broadcast("attn_mask", b, batch, &mask.shape, expected.clone())?;
                    expect_broadcast("attn_mask", h, heads, &mask.shape, expected)?;
                }
                other => {
                    return Err(FlareError::ShapeMismatch {
                        name: "attn_mask",
                        expected,
                        got: other.to_vec(),
                    })
                }
            }
        }

        if let Some(mask) = &self.dropout_mask {
            expect_float("dropout_mask", mask)?;
            expect_shape("dropout_mask", mask, &[batch, heads, query_len, key_len])?;
        }

        if let Some(mask) = &self.alibi_mask {
            expect_float("alibi_mask", mask)?;
            let expected = vec![batch, heads, 1, key_len];
            match mask.shape.dims() {
                &[b, h, 1, k] if k == key_len => {
                    expect_broadcast("alibi_mask", b, batch, &mask.shape, expected.clone())?;
                    expect_broadcast("alibi_mask", h, heads, &mask.shape, expected)?;
                }
                other => {
                    return Err(FlareError::ShapeMismatch {
                        name: "alibi_mask",
                        expected,
                        got: other.to_vec(),
                    })
                }
            }
        }

        Ok(ProblemShape {
            batch,
            heads,
            query_len,
            key_len,
            head_dim,
            actual_head_dim,
        })
    }
}
