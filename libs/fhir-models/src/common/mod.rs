//! Version-agnostic FHIR models
//!
//! Types that work across FHIR R4, R4B, and R5

pub mod code_system;
pub mod complex;
pub mod concept_map;
pub mod error;
pub mod operation_outcome;
pub mod value_set;

// Re-export commonly used types
pub use code_system::*;
pub use complex::*;
pub use concept_map::*;
pub use error::{Error, Result};
pub use operation_outcome::*;
pub use value_set::*;
