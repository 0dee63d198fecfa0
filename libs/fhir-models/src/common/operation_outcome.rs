//! FHIR OperationOutcome model

use super::complex::CodeableConcept;
use serde::{Deserialize, Serialize};

/// FHIR OperationOutcome resource
///
/// A collection of error, warning or information messages resulting from an
/// operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    #[serde(default = "default_resource_type")]
    pub resource_type: String,

    pub issue: Vec<OperationOutcomeIssue>,
}

fn default_resource_type() -> String {
    "OperationOutcome".to_string()
}

/// Severity of an issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Fatal,
    Error,
    Warning,
    Information,
}

/// A single issue in an OperationOutcome
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcomeIssue {
    pub severity: IssueSeverity,

    /// Issue type code (invalid | not-found | not-supported | too-costly | ...)
    pub code: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<CodeableConcept>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<Vec<String>>,
}

impl OperationOutcome {
    /// Single-issue error outcome with `details.text`
    pub fn error(code: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            resource_type: "OperationOutcome".to_string(),
            issue: vec![OperationOutcomeIssue {
                severity: IssueSeverity::Error,
                code: code.into(),
                details: Some(CodeableConcept {
                    coding: None,
                    text: Some(text.into()),
                }),
                diagnostics: None,
                expression: None,
            }],
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        if let Some(issue) = self.issue.first_mut() {
            issue.diagnostics = Some(diagnostics.into());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_outcome_has_details_text() {
        let outcome = OperationOutcome::error("not-found", "Unknown code 'x'");
        let v = serde_json::to_value(&outcome).unwrap();
        assert_eq!(v["issue"][0]["code"], "not-found");
        assert_eq!(v["issue"][0]["severity"], "error");
        assert_eq!(v["issue"][0]["details"]["text"], "Unknown code 'x'");
    }
}
