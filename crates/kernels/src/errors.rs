use thiserror::Error;

/// A result type for kernel computations
pub type Result<T> = std::result::Result<T, KernelError>;

/// An error when building or evaluating an [`RbfKernel`](crate::RbfKernel)
#[derive(Error, Debug)]
pub enum KernelError {
    /// When input or gradient arrays do not have the expected shape
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    /// When a model index is outside of the precomputed distance table
    #[error("Index {index} out of range for distance table of size {size}")]
    IndexOutOfRange {
        /// Offending index (as found in the input)
        index: String,
        /// Size of the distance table
        size: usize,
    },
    /// When error dur to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
    /// When psi statistics are requested but no computer is attached
    #[error("No psi statistics computer attached to kernel '{0}'")]
    MissingPsiComputer(String),
    /// When the distance builder collaborator fails
    #[error("Distance builder error: {0}")]
    DistanceBuilderError(String),
    /// When error during saving
    #[cfg(feature = "persistent")]
    #[error("Save error: {0}")]
    SaveError(#[from] serde_json::Error),
    /// When error during loading
    #[error("Load IO error")]
    LoadIoError(#[from] std::io::Error),
    /// When error during loading
    #[error("Load error: {0}")]
    LoadError(String),
}
