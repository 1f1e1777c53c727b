use std::{fmt, io, result::Result as StdResult, sync::Arc};

use thiserror::Error;

use crate::ffi;

/// Category of an interpreter error, derived from the native status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// `LUA_ERRRUN`, and every error raised by host code.
    Runtime,
    /// `LUA_ERRMEM`.
    Memory,
    /// `LUA_ERRERR`: the message handler itself failed.
    Protocol,
    /// `LUA_ERRSYNTAX`.
    Syntax,
    /// `LUA_YIELD` reported where a result was expected.
    Yield,
    /// `LUA_ERRFILE`, and I/O failures while streaming a chunk.
    File,
    /// Any status the interpreter is not documented to return.
    Unknown,
}

impl ErrorKind {
    /// Map a native status code; `None` for `LUA_OK`.
    pub(crate) fn from_status(status: i32) -> Option<Self> {
        match status {
            ffi::LUA_OK => None,
            ffi::LUA_ERRRUN => Some(Self::Runtime),
            ffi::LUA_ERRMEM => Some(Self::Memory),
            ffi::LUA_ERRERR => Some(Self::Protocol),
            ffi::LUA_ERRSYNTAX => Some(Self::Syntax),
            ffi::LUA_YIELD => Some(Self::Yield),
            ffi::LUA_ERRFILE => Some(Self::File),
            _ => Some(Self::Unknown),
        }
    }

    /// Short lowercase label, matching the interpreter's own wording.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Runtime => "runtime error",
            Self::Memory => "memory allocation error",
            Self::Protocol => "error",
            Self::Syntax => "syntax error",
            Self::Yield => "yield",
            Self::File => "file error",
            Self::Unknown => "unknown error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a cancellable run was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum CancelReason {
    /// The run's cancellation token was triggered.
    #[error("context canceled")]
    Canceled,
    /// The run's deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// An error annotated with the script location and traceback of the call
/// boundary that first observed it.
#[derive(Debug)]
pub struct Traced {
    /// The wrapped error. Never itself a `Traced`.
    pub error: Error,
    /// Short source name of the chunk, e.g. `<string>` or `script.lua`.
    pub chunk_name: String,
    /// Line in `chunk_name`, or 0 when unknown.
    pub line: u32,
    /// `stack traceback:` block as produced by the interpreter.
    pub traceback: String,
}

impl Traced {
    /// `chunk:line: message`, the form scripts see from `pcall`.
    pub fn one_line(&self) -> String {
        if self.chunk_name.is_empty() {
            self.error.to_string()
        } else {
            format!("{}:{}: {}", self.chunk_name, self.line, self.error)
        }
    }
}

impl fmt::Display for Traced {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.traceback.is_empty() {
            f.write_str(&self.one_line())
        } else {
            write!(f, "{}\n{}", self.one_line(), self.traceback)
        }
    }
}

impl std::error::Error for Traced {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[derive(Error, Debug, Clone)]
/// Error type for interpreter operations.
pub enum Error {
    /// An error reported by the interpreter, or raised by host code.
    #[error("{message}")]
    Lua {
        /// Error category.
        kind: ErrorKind,
        /// Message without location prefix.
        message: String,
    },

    /// Execution was aborted by the cancellation hook.
    #[error("{0}")]
    Cancelled(CancelReason),

    /// An error carrying chunk name, line and traceback.
    #[error("{0}")]
    Traced(#[source] Arc<Traced>),

    /// The interpreter state has already been closed.
    #[error("interpreter state is closed")]
    Closed,
}

impl Error {
    /// Create a runtime error with the given message.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Lua {
            kind: ErrorKind::Runtime,
            message: message.into(),
        }
    }

    /// Create an error of an explicit kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Lua {
            kind,
            message: message.into(),
        }
    }

    /// The innermost error, looking through any trace wrapper.
    pub fn root(&self) -> &Error {
        match self {
            Self::Traced(traced) => traced.error.root(),
            other => other,
        }
    }

    /// Category of the innermost error. Cancellation reports `Runtime`; use
    /// [`Error::cancel_reason`] to tell it apart.
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            Self::Lua { kind, .. } => *kind,
            Self::Cancelled(_) => ErrorKind::Runtime,
            Self::Closed => ErrorKind::Unknown,
            Self::Traced(_) => ErrorKind::Unknown,
        }
    }

    /// The innermost message, without location or traceback.
    pub fn message(&self) -> String {
        self.root().to_string()
    }

    /// Set when the error was caused by cancellation rather than the script.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self.root() {
            Self::Cancelled(reason) => Some(*reason),
            _ => None,
        }
    }

    /// True when the run was cancelled or ran past its deadline.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_reason().is_some()
    }

    /// The trace wrapper, if a call boundary has annotated this error.
    pub fn trace(&self) -> Option<&Traced> {
        match self {
            Self::Traced(traced) => Some(traced),
            _ => None,
        }
    }

    /// `chunk:line: message` when traced, the plain message otherwise.
    pub fn one_line(&self) -> String {
        match self {
            Self::Traced(traced) => traced.one_line(),
            other => other.to_string(),
        }
    }

    pub(crate) fn traced(
        error: Error,
        chunk_name: String,
        line: u32,
        traceback: String,
    ) -> Self {
        Self::Traced(Arc::new(Traced {
            error,
            chunk_name,
            line,
            traceback,
        }))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::new(ErrorKind::File, err.to_string())
    }
}

impl From<CancelReason> for Error {
    fn from(reason: CancelReason) -> Self {
        Self::Cancelled(reason)
    }
}

/// Result alias using the crate error type.
pub type Result<T> = StdResult<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_preserves_kind_and_message() {
        let inner = Error::runtime("boom x");
        let err = Error::traced(
            inner,
            "<string>".into(),
            3,
            "stack traceback:\n\t<string>:3: in main chunk".into(),
        );

        assert_eq!(err.kind(), ErrorKind::Runtime);
        assert_eq!(err.message(), "boom x");
        assert_eq!(err.one_line(), "<string>:3: boom x");
        assert_eq!(
            err.to_string(),
            "<string>:3: boom x\nstack traceback:\n\t<string>:3: in main chunk"
        );
    }

    #[test]
    fn cancellation_is_tagged() {
        let err = Error::traced(
            CancelReason::DeadlineExceeded.into(),
            "job.lua".into(),
            7,
            String::new(),
        );
        assert!(err.is_cancelled());
        assert_eq!(err.cancel_reason(), Some(CancelReason::DeadlineExceeded));
        assert_eq!(err.kind(), ErrorKind::Runtime);
        assert!(!Error::runtime("plain").is_cancelled());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ErrorKind::from_status(ffi::LUA_OK), None);
        assert_eq!(
            ErrorKind::from_status(ffi::LUA_ERRSYNTAX),
            Some(ErrorKind::Syntax)
        );
        assert_eq!(
            ErrorKind::from_status(ffi::LUA_ERRERR),
            Some(ErrorKind::Protocol)
        );
        assert_eq!(ErrorKind::from_status(42), Some(ErrorKind::Unknown));
    }
}
