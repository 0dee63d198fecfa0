//! The terminology surface the ECL engine runs against.

use crate::error::Result;
use async_trait::async_trait;

/// Root of the SNOMED CT concept-model attribute hierarchy. Attribute names
/// in refinements must live under it.
pub const CONCEPT_MODEL_ATTRIBUTE: &str = "410662002";

/// SNOMED CT graph access needed by term validation, semantic validation and
/// evaluation.
///
/// Implementations are read-only and must answer deterministically for a
/// given store state. All id parameters and results are SCTID strings.
#[async_trait]
pub trait SnomedStore: Send + Sync {
    async fn concept_exists(&self, sctid: &str) -> Result<bool>;

    /// Immediate is-a children
    async fn children_of(&self, sctid: &str) -> Result<Vec<String>>;

    /// Immediate is-a parents
    async fn parents_of(&self, sctid: &str) -> Result<Vec<String>>;

    /// Transitive closure of children, excluding the concept itself
    async fn descendants_of(&self, sctid: &str) -> Result<Vec<String>>;

    /// Transitive closure of parents, excluding the concept itself
    async fn ancestors_of(&self, sctid: &str) -> Result<Vec<String>>;

    async fn is_descendant_of(&self, descendant: &str, ancestor: &str) -> Result<bool>;

    /// Active members of a reference set
    async fn refset_members(&self, refset: &str) -> Result<Vec<String>>;

    /// Terms of all active descriptions of a concept
    async fn active_descriptions(&self, sctid: &str) -> Result<Vec<String>>;

    /// Defining relationships of a concept as `(attribute, target)` pairs
    async fn relationships_of(&self, sctid: &str) -> Result<Vec<(String, String)>>;

    /// Concrete (numeric or string) values of an attribute on a concept
    async fn concrete_values(&self, sctid: &str, attribute: &str) -> Result<Vec<String>>;

    /// Declared domain concepts of an attribute; empty when undeclared
    async fn attribute_domains(&self, attribute: &str) -> Result<Vec<String>>;

    /// Declared range concepts of an attribute; empty when undeclared
    async fn attribute_ranges(&self, attribute: &str) -> Result<Vec<String>>;

    /// Every concept id, or `None` when the store holds more than `cap`
    async fn all_concepts(&self, cap: usize) -> Result<Option<Vec<String>>>;
}
