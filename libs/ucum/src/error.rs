use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("UCUM expression must be ASCII")]
    NonAscii,

    #[error("UCUM expression must not contain whitespace")]
    ContainsWhitespace,

    #[error("empty UCUM expression")]
    Empty,

    #[error("invalid UCUM syntax at byte {pos}: {message}")]
    Syntax { pos: usize, message: &'static str },

    #[error("unknown unit symbol '{0}'")]
    UnknownUnit(String),

    #[error("unit '{0}' does not allow metric prefixes")]
    NotPrefixable(String),

    #[error("non-linear unit '{0}' cannot be combined or exponentiated")]
    NonLinear(String),
}
