//! Error types for the metadata store

use crate::value::Kind;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while assigning or evaluating metadata variables.
///
/// Every variant aborts the enclosing `get`/`set` call. None of them is used
/// to signal a cache miss.
#[derive(Debug, Error)]
pub enum MetaError {
    /// A value's kind does not match the variable's established kind.
    #[error("type mismatch in {context}: expected {expected}, found {found}")]
    TypeMismatch {
        context: String,
        expected: Kind,
        found: Kind,
    },

    /// A variable depends on its own evaluation.
    #[error("recursive evaluation: {}", chain.join(" -> "))]
    RecursiveEvaluation { chain: Vec<String> },

    /// An acyclic chain of references nested deeper than the configured limit.
    #[error("evaluation depth limit {limit} exceeded: {}", chain.join(" -> "))]
    DepthExceeded { limit: usize, chain: Vec<String> },

    /// A referenced variable does not exist in the scope.
    #[error("undefined variable: {0}")]
    UndefinedVariable(String),

    /// An amendment whose kind cannot be combined with the target.
    #[error("unsupported {op} on {context}: {amend} to {target}")]
    UnsupportedAmendment {
        context: String,
        op: &'static str,
        amend: Kind,
        target: Kind,
    },

    /// Deferred expression source that does not parse.
    #[error("syntax error in expression {text:?} at offset {offset}: {message}")]
    Syntax {
        text: String,
        offset: usize,
        message: String,
    },

    /// Wrong argument count or unknown function in a deferred expression.
    #[error("invalid call to {function}: {message}")]
    InvalidCall { function: String, message: String },

    #[error("invalid value for {var}[{flag}]: {message}")]
    InvalidFlag {
        var: String,
        flag: String,
        message: String,
    },

    #[error("invalid flag pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// A scope that cannot be represented as a snapshot.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("snapshot format: {0}")]
    SnapshotFormat(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for metadata operations.
pub type MetaResult<T> = Result<T, MetaError>;

impl MetaError {
    pub(crate) fn mismatch(context: impl Into<String>, expected: Kind, found: Kind) -> Self {
        MetaError::TypeMismatch {
            context: context.into(),
            expected,
            found,
        }
    }

    pub(crate) fn unsupported(
        context: impl Into<String>,
        op: &'static str,
        amend: Kind,
        target: Kind,
    ) -> Self {
        MetaError::UnsupportedAmendment {
            context: context.into(),
            op,
            amend,
            target,
        }
    }
}
