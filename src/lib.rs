pub mod backend;
pub mod context;
pub mod errors;
pub mod graph;
pub mod layout;
pub mod optim;
pub mod storage;
pub mod tensor;
pub mod types;

pub use context::{cleanup, disable_grad, enable_grad, graph_dot, init, is_grad_enabled};
pub use errors::{Error, Result};
pub use layout::Layout;
pub use optim::{Optimizer, Sgd};
pub use tensor::Tensor;
pub use types::{NodeId, MAX_INPUTS, MAX_RANK};

/// Name of the built-in dense single-precision CPU backend.
pub const CPU_F32: &str = "cpu_f32";
