//! Error taxonomy for compiler invocations.

use std::io;

use thiserror::Error;

/// Failure while decoding the compiler's textual output.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unexpected end of compiler output")]
    UnexpectedEof,
    #[error("{0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ParseError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        ParseError::Malformed(msg.into())
    }
}

/// Errors surfaced by a compiler invocation.
#[derive(Debug, Error)]
pub enum CompilerError {
    /// The compiler produced output the protocol does not allow. The
    /// invocation is lost but the server keeps running.
    #[error("compiler error: {0}")]
    Protocol(String),

    /// The compiler exited on a signal. `-1` when the signal is unknown.
    #[error("{}", crash_message(.0))]
    Crash(i32),

    /// The invocation was cancelled from the outside.
    #[error("compiler invocation cancelled")]
    Cancelled,

    /// The invocation exceeded the configured deadline.
    #[error("compiler invocation timed out")]
    Timeout,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn crash_message(signal: &i32) -> String {
    if *signal == -1 {
        "compiler crashed".to_string()
    } else {
        format!("compiler crashed with signal {signal}")
    }
}

impl CompilerError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        CompilerError::Protocol(msg.into())
    }

    pub fn is_crash(&self) -> bool {
        matches!(self, CompilerError::Crash(_))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, CompilerError::Protocol(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CompilerError::Cancelled | CompilerError::Timeout)
    }
}
