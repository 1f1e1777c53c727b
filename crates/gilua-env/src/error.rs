use gilua::{CancelReason, ErrorKind};
use serde::{Deserialize, Serialize};

/// Result type for environment operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving an environment.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The interpreter reported an error, or a script was cancelled.
    #[error(transparent)]
    Lua(#[from] gilua::Error),
    /// The environment is closing or closed.
    #[error("environment is closed")]
    Closed,
    /// The calling thread already holds the interpreter lock.
    #[error("interpreter lock is already held by this thread")]
    Reentrant,
    /// An I/O failure outside the interpreter.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A background task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(String),
    /// The environment was created outside a tokio runtime.
    #[error("no tokio runtime is running")]
    NoRuntime,
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

impl Error {
    /// Why the script was cancelled, if that is what happened.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            Self::Lua(err) => err.cancel_reason(),
            _ => None,
        }
    }

    /// Whether a script was aborted by cancellation or timeout.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_reason().is_some()
    }

    /// Structured summary of the error.
    pub fn report(&self) -> ErrorReport {
        ErrorReport::from(self)
    }
}

/// Serializable summary of a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Short error category.
    pub kind: String,
    /// Message without location prefix.
    pub message: String,
    /// Chunk the error was raised in, when known.
    pub chunk: Option<String>,
    /// Line in `chunk`, when known.
    pub line: Option<u32>,
    /// Traceback frames, one per entry.
    pub traceback: Option<Vec<String>>,
    /// `timeout` or `interrupted` when the run was cancelled.
    pub cancelled: Option<String>,
}

/// Serializable outcome of [`Environment::eval`](crate::Environment::eval).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalOutcome {
    /// Values returned by the chunk, as JSON.
    pub values: Vec<serde_json::Value>,
    /// Lines collected from `print`.
    pub logs: Vec<String>,
    /// Error details when the run failed.
    pub error: Option<ErrorReport>,
}

fn kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Runtime => "runtime",
        ErrorKind::Memory => "memory",
        ErrorKind::Protocol => "error_handler",
        ErrorKind::Syntax => "syntax",
        ErrorKind::Yield => "yield",
        ErrorKind::File => "file",
        ErrorKind::Unknown => "unknown",
    }
}

fn cancel_label(reason: CancelReason) -> &'static str {
    match reason {
        CancelReason::DeadlineExceeded => "timeout",
        CancelReason::Canceled => "interrupted",
    }
}

fn traceback_frames(traceback: &str) -> Option<Vec<String>> {
    let frames: Vec<String> = traceback
        .lines()
        .skip_while(|line| line.starts_with("stack traceback:"))
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect();
    (!frames.is_empty()).then_some(frames)
}

impl From<&Error> for ErrorReport {
    fn from(err: &Error) -> Self {
        let plain = |kind: &str| ErrorReport {
            kind: kind.to_string(),
            message: err.to_string(),
            chunk: None,
            line: None,
            traceback: None,
            cancelled: None,
        };

        match err {
            Error::Lua(lua) => {
                let trace = lua.trace();
                ErrorReport {
                    kind: kind_label(lua.kind()).to_string(),
                    message: lua.message(),
                    chunk: trace
                        .map(|t| t.chunk_name.clone())
                        .filter(|chunk| !chunk.is_empty()),
                    line: trace.map(|t| t.line).filter(|line| *line > 0),
                    traceback: trace.and_then(|t| traceback_frames(&t.traceback)),
                    cancelled: lua.cancel_reason().map(|r| cancel_label(r).to_string()),
                }
            }
            Error::Closed => plain("closed"),
            Error::Reentrant => plain("reentrant"),
            Error::Io(_) => plain("io"),
            Error::Task(_) => plain("task"),
            Error::NoRuntime => plain("no_runtime"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn frames_skip_the_header() {
        assert_eq!(
            traceback_frames("stack traceback:\n\t[C]: in ?\n\t<string>:1: in main chunk"),
            Some(vec!["[C]: in ?".to_string(), "<string>:1: in main chunk".to_string()])
        );
        assert_eq!(traceback_frames(""), None);
        assert_eq!(traceback_frames("stack traceback:"), None);
    }

    #[test]
    fn cancellation_is_labelled() {
        let err = Error::from(gilua::Error::from(CancelReason::DeadlineExceeded));
        let report = err.report();
        assert_eq!(report.kind, "runtime");
        assert_eq!(report.cancelled.as_deref(), Some("timeout"));
        assert_eq!(report.message, "context deadline exceeded");

        let report = Error::Closed.report();
        assert_eq!(report.kind, "closed");
        assert_eq!(report.message, "environment is closed");
        assert_eq!(report.cancelled, None);
    }

    #[test]
    fn report_serializes() {
        let report = ErrorReport {
            kind: "syntax".into(),
            message: "unexpected symbol".into(),
            chunk: None,
            line: None,
            traceback: None,
            cancelled: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "syntax");
        assert_eq!(json["chunk"], serde_json::Value::Null);
    }
}
