use thiserror::Error;

use crate::types::NodeId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("engine not initialized. Call init() before using the API.")]
    NotInitialized,
    #[error("allocation of {size} elements failed")]
    AllocFailed { size: usize },
    #[error("index {index} out of bounds for dim {dim} on axis {axis}")]
    IndexOutOfBounds { index: usize, dim: usize, axis: usize },
    #[error("cannot broadcast dim {lhs} against dim {rhs} on axis {axis}")]
    BroadcastMismatch { lhs: usize, rhs: usize, axis: usize },
    #[error("permutation {perm:?} repeats or exceeds axis indices")]
    DuplicatePermutation { perm: Vec<usize> },
    #[error("invalid shape {dims:?}: {reason}")]
    InvalidShape { dims: Vec<i64>, reason: &'static str },
    #[error("layout is not regular (strides are not a scaled row-major pattern)")]
    NotRegular,
    #[error("layout is not contiguous")]
    NotContiguous,
    #[error("incompatible shapes: expected {expected:?}, found {found:?}")]
    ShapeMismatch { expected: Vec<usize>, found: Vec<usize> },
    #[error("backend mismatch: expected {expected}, found {found}")]
    BackendMismatch { expected: &'static str, found: &'static str },
    #[error("storage handle is not registered")]
    HandleUninitialized,
    #[error("unknown backend {0:?}")]
    InvalidBackend(String),
    #[error("parent storage must be registered before its views")]
    ParentNotRegistered,
    #[error("bucket still has {members} member(s)")]
    BucketNotEmpty { members: usize },
    #[error("registry still tracks {live} storage(s) at teardown")]
    RegistryNotEmpty { live: usize },
    #[error("recording not found or not the innermost active one")]
    RecordNotFound,
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("topological sort failed: graph contains a cycle")]
    TopologicalSortFailed,
    #[error("execution of {op} at node {node:?} failed: {source}")]
    ExecutionFailed {
        node: NodeId,
        op: &'static str,
        #[source]
        source: Box<Error>,
    },
    #[error("node {0:?} not found in graph")]
    NodeNotFound(NodeId),
    #[error("operation takes at most {max} inputs, got {count}")]
    TooManyInputs { count: usize, max: usize },
    #[error("no gradient available; run backward() first")]
    GradientNotAvailable,
    #[error("forward result missing; run execute() first")]
    ForwardNotExecuted,
    #[error("tensor does not require gradients")]
    RequiresGradFalse,
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
