//! FHIR CodeSystem model
//!
//! Version-agnostic model for CodeSystems (terminology)

use super::complex::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// FHIR CodeSystem resource
///
/// Declares the existence of and describes a code system or code system supplement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CodeSystem {
    /// Resource type - always "CodeSystem"
    #[serde(default = "default_resource_type")]
    pub resource_type: String,

    /// Logical id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Canonical identifier
    pub url: String,

    /// Business version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Name (computer friendly)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Name (human friendly)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Publication status
    pub status: PublicationStatus,

    /// For testing purposes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<bool>,

    /// Date last changed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,

    /// Name of the publisher
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,

    /// Contact details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<ContactDetail>>,

    /// Description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Base language of the displays in this code system
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Use and/or publishing restrictions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copyright: Option<String>,

    /// If code comparison is case sensitive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_sensitive: Option<bool>,

    /// Canonical reference to the value set with all codes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_set: Option<String>,

    /// Hierarchy meaning (grouped-by | is-a | part-of | classified-with)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hierarchy_meaning: Option<String>,

    /// If code system defines a compositional grammar
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compositional: Option<bool>,

    /// If definitions are not stable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_needed: Option<bool>,

    /// Content type (not-present | example | fragment | complete | supplement)
    pub content: CodeSystemContentMode,

    /// Canonical URL of the code system this supplements
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supplements: Option<String>,

    /// Total concepts in the code system
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,

    /// Filter definitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Vec<CodeSystemFilter>>,

    /// Property definitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property: Option<Vec<CodeSystemProperty>>,

    /// Concepts in the code system
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept: Option<Vec<CodeSystemConcept>>,

    /// Additional content
    #[serde(flatten)]
    pub extensions: HashMap<String, Value>,
}

fn default_resource_type() -> String {
    "CodeSystem".to_string()
}

/// Content mode for a code system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodeSystemContentMode {
    NotPresent,
    Example,
    Fragment,
    Complete,
    Supplement,
}

impl CodeSystemContentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeSystemContentMode::NotPresent => "not-present",
            CodeSystemContentMode::Example => "example",
            CodeSystemContentMode::Fragment => "fragment",
            CodeSystemContentMode::Complete => "complete",
            CodeSystemContentMode::Supplement => "supplement",
        }
    }
}

/// Filter for a code system
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeSystemFilter {
    /// Code that identifies the filter
    pub code: String,

    /// Description of filter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Operators that can be used with filter
    pub operator: Vec<String>,

    /// What to use for the value
    pub value: String,
}

/// Property definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeSystemProperty {
    /// Identifies the property
    pub code: String,

    /// Formal identifier for the property
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    /// Description of the property
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Type of property (code | Coding | string | integer | boolean | dateTime | decimal)
    #[serde(rename = "type")]
    pub property_type: String,
}

/// Concept in the code system
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeSystemConcept {
    /// Code that identifies the concept
    pub code: String,

    /// Text to display to the user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,

    /// Formal definition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,

    /// Additional representations for the concept
    #[serde(skip_serializing_if = "Option::is_none")]
    pub designation: Option<Vec<Designation>>,

    /// Property values for the concept
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property: Option<Vec<CodeSystemConceptProperty>>,

    /// Child concepts (nested hierarchy)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept: Option<Vec<CodeSystemConcept>>,
}

impl CodeSystemConcept {
    /// Value of a concept property, if present
    pub fn property_value(&self, code: &str) -> Option<&Value> {
        self.property
            .as_ref()?
            .iter()
            .find(|p| p.code == code)
            .map(|p| &p.value)
    }

    /// True when a boolean property with the given code is set to true
    pub fn bool_property(&self, code: &str) -> bool {
        self.property_value(code)
            .and_then(|v| v.get("valueBoolean"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Property value for a concept
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeSystemConceptProperty {
    /// Reference to property definition
    pub code: String,

    /// Value of the property ("value[x]" keyed object)
    #[serde(flatten)]
    pub value: Value,
}

impl CodeSystem {
    /// Create a new CodeSystem with minimal required fields
    pub fn new(
        url: impl Into<String>,
        status: PublicationStatus,
        content: CodeSystemContentMode,
    ) -> Self {
        Self {
            resource_type: "CodeSystem".to_string(),
            id: None,
            url: url.into(),
            version: None,
            name: None,
            title: None,
            status,
            experimental: None,
            date: None,
            publisher: None,
            contact: None,
            description: None,
            language: None,
            copyright: None,
            case_sensitive: None,
            value_set: None,
            hierarchy_meaning: None,
            compositional: None,
            version_needed: None,
            content,
            supplements: None,
            count: None,
            filter: None,
            property: None,
            concept: None,
            extensions: HashMap::new(),
        }
    }

    /// Canonical `url|version` form when a version is present
    pub fn versioned_url(&self) -> String {
        match &self.version {
            Some(v) => format!("{}|{}", self.url, v),
            None => self.url.clone(),
        }
    }

    /// True when this resource is a supplement of `url` (with or without a
    /// `|version` qualifier on the `supplements` pointer).
    pub fn supplements_system(&self, url: &str) -> bool {
        match &self.supplements {
            Some(s) => s == url || s.split('|').next() == Some(url),
            None => false,
        }
    }

    /// Depth-first walk over the concept tree, parents before children.
    pub fn walk_concepts<'a>(&'a self, mut f: impl FnMut(&'a CodeSystemConcept)) {
        fn walk<'a>(
            concepts: &'a [CodeSystemConcept],
            f: &mut impl FnMut(&'a CodeSystemConcept),
        ) {
            for c in concepts {
                f(c);
                if let Some(children) = &c.concept {
                    walk(children, f);
                }
            }
        }
        if let Some(concepts) = &self.concept {
            walk(concepts, &mut f);
        }
    }
}
