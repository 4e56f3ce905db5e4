pub mod backend;
pub mod errors;
pub mod graph;
pub mod logging;
pub mod ops;
pub mod serialize;
pub mod tensor;
pub mod types;

pub use backend::Backends;
pub use errors::{FlintError, FlintResult};
pub use graph::{Graph, NodeId};
pub use tensor::{Data, ResultData};
pub use types::{FType, Scalar};
