//! CapabilityStatement generation.

use crate::state::AppState;
use chrono::Utc;
use serde_json::{json, Value as JsonValue};

const RESOURCE_TYPES: &[&str] = &["CodeSystem", "ValueSet", "ConceptMap"];

/// The server's CapabilityStatement, reflecting the registered providers.
pub fn capability_statement(state: &AppState) -> JsonValue {
    let resources: Vec<JsonValue> = RESOURCE_TYPES
        .iter()
        .map(|resource_type| {
            let operations: Vec<JsonValue> = match *resource_type {
                "CodeSystem" => vec![
                    operation("lookup", "http://hl7.org/fhir/OperationDefinition/CodeSystem-lookup"),
                    operation(
                        "validate-code",
                        "http://hl7.org/fhir/OperationDefinition/CodeSystem-validate-code",
                    ),
                    operation(
                        "subsumes",
                        "http://hl7.org/fhir/OperationDefinition/CodeSystem-subsumes",
                    ),
                ],
                "ValueSet" => vec![
                    operation("expand", "http://hl7.org/fhir/OperationDefinition/ValueSet-expand"),
                    operation(
                        "validate-code",
                        "http://hl7.org/fhir/OperationDefinition/ValueSet-validate-code",
                    ),
                ],
                "ConceptMap" => vec![operation(
                    "translate",
                    "http://hl7.org/fhir/OperationDefinition/ConceptMap-translate",
                )],
                _ => Vec::new(),
            };
            json!({
                "type": resource_type,
                "interaction": [ { "code": "read" } ],
                "operation": operations
            })
        })
        .collect();

    json!({
        "resourceType": "CapabilityStatement",
        "status": "active",
        "date": Utc::now().to_rfc3339(),
        "kind": "instance",
        "software": {
            "name": "argentum",
            "version": env!("CARGO_PKG_VERSION")
        },
        "fhirVersion": "4.0.1",
        "format": ["application/fhir+json"],
        "rest": [{
            "mode": "server",
            "resource": resources,
            "documentation": format!(
                "Terminology server. Registered code systems: {}",
                state.registry.systems().join(", ")
            )
        }]
    })
}

fn operation(name: &str, definition: &str) -> JsonValue {
    json!({ "name": name, "definition": definition })
}
