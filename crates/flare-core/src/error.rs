use crate::dtype::DType;

/// Errors raised while building or launching a kernel.
///
/// Every failure is a build-time contract violation; the per-core compute
/// loop itself has no error path.
#[derive(Debug, thiserror::Error)]
pub enum FlareError {
    #[error("config error: {0}")]
    Config(String),

    #[error("shape mismatch for '{name}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("unsupported dtype {dtype} for '{name}'")]
    UnsupportedDType { name: &'static str, dtype: DType },

    #[error("dtype mismatch for '{name}': expected {expected}, got {got}")]
    DTypeMismatch {
        name: &'static str,
        expected: DType,
        got: DType,
    },

    #[error("missing required input '{0}'")]
    MissingInput(&'static str),

    #[error("'{0}' is not implemented by this kernel variant")]
    NotImplemented(&'static str),
}

/// Coarse classification of [`FlareError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or inconsistent shapes, dtypes, tiling or inputs.
    Config,
    /// An extension hook the concrete variant did not supply.
    NotImplemented,
}

impl FlareError {
    pub fn config(msg: impl Into<String>) -> Self {
        FlareError::Config(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FlareError::NotImplemented(_) => ErrorKind::NotImplemented,
            _ => ErrorKind::Config,
        }
    }

    pub fn is_config(&self) -> bool {
        self.kind() == ErrorKind::Config
    }
}
