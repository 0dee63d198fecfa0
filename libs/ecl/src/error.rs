//! Error types for the ECL engine

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Term validation failed: {0}")]
    TermError(String),

    #[error("Semantic validation failed: {0}")]
    SemanticError(String),

    #[error("Evaluation error: {0}")]
    EvaluationError(String),

    #[error("too many results (limit {0})")]
    TooManyResults(usize),

    #[error("Store error: {0}")]
    Store(String),
}
