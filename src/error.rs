use crate::linalg::solver::MatrixClass;
use thiserror::Error;

/// Errors raised by the mapping engine
///
/// Precondition violations are reported before any state is mutated. Geometric
/// degeneracies are never errors; they are logged and handled by a simpler strategy.
#[derive(Debug, Error)]
pub enum MapError {
    /// Two arrays that must agree in length do not
    #[error("size mismatch in {context}: expected {expected}, found {found}")]
    SizeMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    /// A mesh (or a required subset of it) has nothing in it
    #[error("mesh has no {0}")]
    EmptyMesh(&'static str),

    /// Metadata required by the requested operation is missing
    #[error("missing metadata: {0}")]
    MissingMetadata(String),

    /// An index refers past the end of its container
    #[error("{kind} index {index} out of range (count: {count})")]
    InvalidIndex {
        kind: &'static str,
        index: usize,
        count: usize,
    },

    /// A boundary group or section name could not be resolved
    #[error("no boundary group or section named '{0}'")]
    UnknownGroup(String),

    /// A jump node has no usable neighbor elements; the diffusion system would be singular
    #[error("smoothing is ill-posed: node {node} has no usable neighbor elements")]
    IllPosedSmoothing { node: u32 },

    /// No direct solver is registered for the required matrix class
    #[error("no sparse solver registered for {0:?} matrices")]
    SolverUnavailable(MatrixClass),

    /// The registered solver could not factor or solve the system
    #[error("sparse solve failed: {0}")]
    SolverFailed(String),

    /// Mapping operator has not been built yet
    #[error("mapping operator has not been built; call build() first")]
    NotBuilt,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed mesh, configuration or matrix file
    #[error("parse error: {0}")]
    Parse(String),
}

/// Result type for mapping operations
pub type MapResult<T> = Result<T, MapError>;

/// Fail with [`MapError::SizeMismatch`] unless `found == expected`
pub(crate) fn check_size(context: &'static str, expected: usize, found: usize) -> MapResult<()> {
    if expected == found {
        Ok(())
    } else {
        Err(MapError::SizeMismatch {
            context,
            expected,
            found,
        })
    }
}
