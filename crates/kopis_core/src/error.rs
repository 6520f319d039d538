use thiserror::Error;

use crate::types::OffsetKind;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration line {line}: {reason}")]
    Config { line: usize, reason: String },

    #[error("configuration defines more than {max} file types")]
    TooManyFileTypes { max: usize },

    #[error("type {suffix:?}: regular expressions are not supported by the GPU backend")]
    RegexOnGpu { suffix: String },

    #[error("GPU backend supports at most {max} patterns, configuration needs {needed}")]
    GpuPatternLimit { needed: usize, max: usize },

    #[error("failed to grow {kind} offsets of type {type_index} to {requested} entries")]
    Allocation {
        type_index: usize,
        kind: OffsetKind,
        requested: usize,
    },

    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

impl CoreError {
    pub(crate) fn config(line: usize, reason: impl Into<String>) -> Self {
        Self::Config {
            line,
            reason: reason.into(),
        }
    }

    /// True for every error that must stop the run before any image is read.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::TooManyFileTypes { .. }
                | Self::RegexOnGpu { .. }
                | Self::GpuPatternLimit { .. }
                | Self::InvalidOptions(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
