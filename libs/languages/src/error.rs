use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("empty language tag")]
    Empty,

    #[error("invalid language subtag '{0}'")]
    InvalidLanguage(String),

    #[error("invalid subtag '{subtag}' in language tag '{tag}'")]
    InvalidSubtag { tag: String, subtag: String },
}
