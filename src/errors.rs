use thiserror::Error;

/// Failure categories surfaced by graph construction, execution and I/O.
#[derive(Error, Debug)]
pub enum FlintError {
    #[error("out of memory: could not allocate {0} bytes")]
    OutOfMemory(usize),
    #[error("illegal dimensionality: {0}")]
    IllegalDimensionality(String),
    #[error("incompatible shapes: {a:?} and {b:?} in {op}")]
    IncompatibleShapes {
        a: Vec<usize>,
        b: Vec<usize>,
        op: &'static str,
    },
    #[error("wrong type: {0}")]
    WrongType(String),
    #[error("invalid select: {0}")]
    InvalidSelect(String),
    #[error("no gradient variables in the operational graph, mark them with mark_gradient_variable before deriving")]
    IllegalDerive,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("driver error: {0}")]
    Ocl(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type FlintResult<T> = Result<T, FlintError>;
