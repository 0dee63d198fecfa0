//! FHIR ConceptMap model
//!
//! Version-agnostic model for concept translations

use super::complex::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// FHIR ConceptMap resource
///
/// A statement of relationships from one set of concepts to one or more other
/// concepts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConceptMap {
    /// Resource type - always "ConceptMap"
    #[serde(default = "default_resource_type")]
    pub resource_type: String,

    /// Logical id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Canonical identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Business version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Name (computer friendly)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Publication status
    pub status: PublicationStatus,

    /// Date last changed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,

    /// Description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Source scope: ValueSet the source concepts are drawn from
    /// (`sourceUri` / `sourceCanonical` in R4, `sourceScope[x]` in R5)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_canonical: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_scope_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_scope_canonical: Option<String>,

    /// Target scope: ValueSet the target concepts are drawn from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_canonical: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_scope_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_scope_canonical: Option<String>,

    /// Same source and target systems
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<Vec<ConceptMapGroup>>,

    /// Additional content
    #[serde(flatten)]
    pub extensions: HashMap<String, Value>,
}

fn default_resource_type() -> String {
    "ConceptMap".to_string()
}

/// Mappings for a pair of source and target systems
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConceptMapGroup {
    /// Source system of this group of mappings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_version: Option<String>,

    /// Target system of this group of mappings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_version: Option<String>,

    /// Mappings for a concept from the source
    pub element: Vec<ConceptMapElement>,
}

/// Mappings for one source concept
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConceptMapElement {
    /// Identifies element being mapped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,

    /// Concept in target system for element
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Vec<ConceptMapTarget>>,
}

/// One mapped target concept
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConceptMapTarget {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,

    /// R5 relationship code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,

    /// R4 equivalence code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equivalence: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Other concepts this mapping depends on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<ConceptMapDependsOn>>,

    /// Other concepts this mapping produces
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<Vec<ConceptMapDependsOn>>,
}

impl ConceptMapTarget {
    /// Relationship of this target in R5 vocabulary, translating R4
    /// equivalence codes when that is all the map carries.
    pub fn relationship_code(&self) -> &str {
        if let Some(rel) = &self.relationship {
            return rel;
        }
        match self.equivalence.as_deref() {
            Some("equivalent") | Some("equal") => "equivalent",
            Some("wider") | Some("subsumes") => "source-is-narrower-than-target",
            Some("narrower") | Some("specializes") => "source-is-broader-than-target",
            Some("unmatched") | Some("disjoint") => "not-related-to",
            _ => "related-to",
        }
    }
}

/// Element a mapping depends on or produces
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConceptMapDependsOn {
    pub property: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    pub value: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl ConceptMap {
    /// Source scope canonical, whichever representation the resource used.
    pub fn source_scope(&self) -> Option<&str> {
        self.source_scope_canonical
            .as_deref()
            .or(self.source_scope_uri.as_deref())
            .or(self.source_canonical.as_deref())
            .or(self.source_uri.as_deref())
    }

    /// Target scope canonical, whichever representation the resource used.
    pub fn target_scope(&self) -> Option<&str> {
        self.target_scope_canonical
            .as_deref()
            .or(self.target_scope_uri.as_deref())
            .or(self.target_canonical.as_deref())
            .or(self.target_uri.as_deref())
    }
}
