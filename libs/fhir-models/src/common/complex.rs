//! FHIR complex types and shared data structures
//!
//! This module contains enums and structs that are reused across FHIR resources.
//! No validation - just data representation.

use serde::{Deserialize, Serialize};

/// Publication status of a conformance resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PublicationStatus {
    #[default]
    Draft,
    Active,
    Retired,
    Unknown,
}

/// FHIR Extension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extension {
    pub url: String,

    #[serde(flatten)]
    pub value: serde_json::Value,
}

/// Contact detail for a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub telecom: Option<Vec<ContactPoint>>,
}

/// Contact point (phone, email, etc.)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactPoint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>, // phone | fax | email | pager | url | sms | other

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>, // home | work | temp | old | mobile

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
}

/// Coding - a reference to a code defined by a terminology system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Coding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,

    #[serde(rename = "userSelected", skip_serializing_if = "Option::is_none")]
    pub user_selected: Option<bool>,
}

impl Coding {
    pub fn new(system: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            code: Some(code.into()),
            ..Default::default()
        }
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }
}

/// CodeableConcept - a concept described by one or more codings plus free text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CodeableConcept {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coding: Option<Vec<Coding>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Usage context for a conformance resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageContext {
    pub code: Coding,

    #[serde(flatten)]
    pub value: serde_json::Value,
}

/// An additional representation for a concept: (language, use, value)
///
/// Shared between CodeSystem concepts, ValueSet compose concepts and
/// expansion contains entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Designation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_: Option<Coding>,

    pub value: String,
}

impl Designation {
    pub fn new(language: Option<&str>, use_: Option<Coding>, value: impl Into<String>) -> Self {
        Self {
            language: language.map(|s| s.to_string()),
            use_,
            value: value.into(),
        }
    }
}
