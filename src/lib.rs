//! axon-runtime: a minimal driver for executing pre-compiled neural-network
//! graphs.
//!
//! The pipeline is strictly staged: [`container::Model::load`] deserializes
//! an AXGM container, [`engine::GraphInstance::build`] resolves every op
//! against an [`ops::OpResolver`], [`engine::GraphInstance::allocate`] plans
//! and commits the tensor arena, and [`engine::GraphInstance::invoke`] runs
//! the op sequence. Callers read and write tensors through the typed views
//! on the graph instance.

pub mod cli;
pub mod container;
pub mod engine;
pub mod error;
pub mod ops;
pub mod tensor;

pub use container::Model;
pub use engine::{Binding, GraphInstance};
pub use error::PipelineError;
pub use ops::{OpResolver, OpType};
pub use tensor::ElemType;
