//! Error types for the Opal core.
//!
//! Guest-program failures are values: inside the VM an error is an ordinary
//! `Value` (usually a string) travelling through the unwind machinery. At the
//! embedding boundary those values are wrapped into [`OpalError`] together
//! with the stage that produced them, matching the `{error, value, status}`
//! result shape the host sees.

use crate::value::Value;

/// Stage of the pipeline that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Compile,
    Runtime,
    Parse,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Compile => write!(f, "compile"),
            Status::Runtime => write!(f, "runtime"),
            Status::Parse => write!(f, "parse"),
        }
    }
}

/// Top-level error as seen by an embedder.
///
/// The `Runtime` variant keeps the raw error value; it stays reachable
/// through the VM return slot until the next run, so it is safe to inspect
/// immediately after the failed call.
#[derive(Debug)]
pub enum OpalError {
    /// A form was malformed, a symbol was unbound, or a macro failed.
    Compile {
        message: String,
        /// Rendering of the offending form, when one is known.
        form: Option<String>,
    },
    /// The interpreter unwound to the root without a handler.
    Runtime { message: String, value: Value },
    /// The reader rejected the source text.
    Parse {
        message: String,
        line: usize,
        column: usize,
    },
}

impl OpalError {
    pub fn status(&self) -> Status {
        match self {
            OpalError::Compile { .. } => Status::Compile,
            OpalError::Runtime { .. } => Status::Runtime,
            OpalError::Parse { .. } => Status::Parse,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            OpalError::Compile { message, .. }
            | OpalError::Runtime { message, .. }
            | OpalError::Parse { message, .. } => message,
        }
    }
}

impl std::fmt::Display for OpalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpalError::Compile {
                message,
                form: Some(form),
            } => {
                write!(f, "compile error: {} in {}", message, form)
            }
            OpalError::Compile { message, form: None } => {
                write!(f, "compile error: {}", message)
            }
            OpalError::Runtime { message, .. } => write!(f, "runtime error: {}", message),
            OpalError::Parse {
                message,
                line,
                column,
            } => {
                write!(f, "parse error: {} at line {}, column {}", message, line, column)
            }
        }
    }
}

impl std::error::Error for OpalError {}
