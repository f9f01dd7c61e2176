use thiserror::Error;

pub type Result<T, E = TransportError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Non-zero status reported by a host callback.
    #[error("transport returned status {0}")]
    Status(i32),
    #[error("operation not supported on this backend: {0}")]
    Unsupported(&'static str),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("timeout")]
    Timeout,
}

impl TransportError {
    /// Status code suitable for diagnostics. Errors that did not originate
    /// from a host status code map to `-1`.
    pub fn code(&self) -> i32 {
        match self {
            TransportError::Status(code) => *code,
            _ => -1,
        }
    }
}
