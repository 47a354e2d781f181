//! Runtime error types.
//!
//! The dispatch loop raises [`RuntimeError`]s; [`VmError`] wraps them with
//! the function name and program counter the failure occurred at.

/// Errors raised while executing bytecode.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("undefined variable `{name}`")]
    UndefinedVariable { name: String },

    #[error("type mismatch: {message}")]
    TypeMismatch { message: String },

    #[error("stack underflow")]
    StackUnderflow,

    #[error("call to missing function `{name}`")]
    MissingFunction { name: String },

    #[error("invalid type id {id}")]
    InvalidType { id: u16 },

    #[error("read of {size} bytes at {address:#x} is outside the data source")]
    OutOfBounds { address: u64, size: u64 },

    #[error("no data source configured")]
    NoDataSource,

    #[error("{limit} limit of {value} exceeded")]
    LimitExceeded { limit: &'static str, value: u64 },
}

impl RuntimeError {
    pub(crate) fn mismatch(message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            message: message.into(),
        }
    }
}

/// A runtime error with its execution context attached.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error} (in {function} at pc {pc})")]
pub struct VmError {
    #[source]
    pub error: RuntimeError,
    pub function: String,
    pub pc: usize,
}
