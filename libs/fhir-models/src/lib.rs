//! FHIR terminology data models
//!
//! This crate provides strongly-typed Rust structures for the FHIR resources
//! a terminology server works with: CodeSystem, ValueSet, ConceptMap and
//! OperationOutcome.
//!
//! # Design Philosophy
//!
//! - **Version-agnostic core**: Common fields present across all FHIR versions
//! - **Extensible**: `extensions` field captures version-specific or custom properties
//! - **Strongly-typed**: Type safety for common operations
//! - **Flexible**: Can serialize/deserialize to/from JSON
//! - **Compatible**: Works with existing `serde_json::Value`-based code
//!
//! # Example
//!
//! ```rust
//! use argentum_models::common::{CodeSystem, CodeSystemContentMode};
//! use serde_json::json;
//!
//! let cs_json = json!({
//!     "resourceType": "CodeSystem",
//!     "url": "http://example.org/CodeSystem/colors",
//!     "status": "active",
//!     "content": "complete",
//!     "concept": [ { "code": "red", "display": "Red" } ]
//! });
//!
//! let cs: CodeSystem = serde_json::from_value(cs_json).unwrap();
//! assert_eq!(cs.content, CodeSystemContentMode::Complete);
//! assert_eq!(cs.concept.as_ref().unwrap().len(), 1);
//! ```

pub mod common;

// Re-export commonly used types
pub use common::*;
