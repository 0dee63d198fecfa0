#![forbid(unsafe_code)]

//! BCP-47 language tags for terminology operations.
//!
//! Parses individual tags (`de-CH`, `zh-Hans-CN`, `en-US-x-private`), parses
//! `Accept-Language` header lists with quality weights, and answers the two
//! questions the terminology core keeps asking:
//!
//! - does a stored designation language satisfy a requested language?
//! - which of several candidate designations is the best display for a
//!   requested language list?

mod error;
mod names;
mod tag;

pub use error::{Error, Result};
pub use names::{region_name, script_name, language_name};
pub use tag::{LanguageTag, Languages};
