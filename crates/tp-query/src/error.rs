//! Error types for compilation and execution.

use std::path::PathBuf;
use thiserror::Error;

/// Raised while turning SQL text into a [`crate::QueryPlan`].
///
/// Every variant carries the offending fragment of the query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("unsupported construct: {0}")]
    Unsupported(String),

    #[error("invalid literal: {0}")]
    InvalidLiteral(String),

    #[error("invalid date literal: '{0}'")]
    InvalidDate(String),

    #[error("missing FROM clause")]
    MissingFrom,

    #[error("only SELECT statements are supported, got: {0}")]
    NotASelect(String),
}

/// Raised while executing a compiled query.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("giving up on {} after {attempts} attempts: {source}", path.display())]
    RetriesExhausted {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("query cancelled")]
    Cancelled,

    #[error("file task failed: {0}")]
    Task(String),
}

impl QueryError {
    pub(crate) fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = QueryError> = std::result::Result<T, E>;
