//! Error types for each stage of the execution pipeline.
//!
//! Every stage reports failure to its caller as a typed result; nothing is
//! retried or substituted internally. [`PipelineError`] is the umbrella the
//! CLI driver uses to surface the first failing stage.

use std::path::PathBuf;

use thiserror::Error;

use crate::tensor::ElemType;

/// Errors from [`Model::load`](crate::container::Model::load).
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("model file not readable: {path}: {source}")]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed model: {0}")]
    Malformed(String),
}

/// Errors from [`GraphInstance::build`](crate::engine::GraphInstance::build).
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("no kernel registered for operator code {0}")]
    UnresolvedOperator(u32),

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("invalid parameters for op {op_index}: {reason}")]
    InvalidParams { op_index: usize, reason: String },
}

/// Errors from input resizing and shape inference.
#[derive(Error, Debug)]
pub enum ShapeError {
    #[error("incompatible shape: {0}")]
    Incompatible(String),
}

/// Errors from arena planning and allocation.
#[derive(Error, Debug)]
pub enum AllocError {
    #[error("arena has not been planned; call allocate before reading bindings")]
    NotPlanned,

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error("out of memory: arena of {0} bytes could not be backed")]
    OutOfMemory(usize),
}

/// Errors a kernel may raise during execution.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Errors from invocation and typed tensor access.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("graph is not ready: allocate must succeed for the current shapes before invoke")]
    NotReady,

    #[error("kernel '{name}' failed at op {op_index}: {source}")]
    KernelFailed {
        op_index: usize,
        name: &'static str,
        #[source]
        source: KernelError,
    },

    #[error("typed view mismatch for tensor {tensor}: requested {requested:?}, declared {declared:?}")]
    TypeMismatch {
        tensor: usize,
        requested: ElemType,
        declared: ElemType,
    },
}

/// Umbrella over every pipeline stage, for callers that drive the whole
/// load → build → allocate → invoke sequence.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
