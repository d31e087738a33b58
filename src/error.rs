use thiserror::Error;

// The abstract error kinds a datapath control op can return. Exposed as a
// single enum rather than per-op error types so callers can match on kind
// regardless of which operation produced it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpError {
    #[error("no such entry")]
    NoEntry,
    #[error("entry already exists")]
    Exists,
    #[error("invalid argument")]
    Invalid,
    #[error("resource busy")]
    Busy,
    #[error("too big / out of capacity")]
    TooBig,
    #[error("no buffer space available")]
    NoBuffer,
    #[error("try again")]
    Retry,
    #[error("transient I/O error")]
    TransientIo,
    #[error("fatal error")]
    Fatal,
}

pub type DpResult<T> = Result<T, DpError>;
