//! End-to-end terminology operation tests over the HTTP router.

use argentum::api::build_router;
use argentum::config::Config;
use argentum::providers::{bcp47::Bcp47Provider, ucum::UcumProvider, ProviderRegistry};
use argentum::state::{AppState, ResourceStore};
use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const CS_SIMPLE: &str = "http://example.org/fhir/CodeSystem/cs-simple";
const CS_DE: &str = "http://example.org/fhir/CodeSystem/cs-de";
const VS_SIMPLE: &str = "http://example.org/fhir/ValueSet/vs-simple";
const VS_LISTED: &str = "http://example.org/fhir/ValueSet/vs-listed";
const VS_LOOP_A: &str = "http://example.org/fhir/ValueSet/vs-loop-a";
const VS_LOOP_B: &str = "http://example.org/fhir/ValueSet/vs-loop-b";
const MAP_URL: &str = "http://example.org/fhir/ConceptMap/simple-map";

fn seed_resources(store: &mut ResourceStore) {
    store.insert(json!({
        "resourceType": "CodeSystem",
        "id": "cs-simple",
        "url": CS_SIMPLE,
        "version": "1.0.0",
        "name": "SimpleCodes",
        "status": "active",
        "content": "complete",
        "concept": [
            { "code": "code1", "display": "Code One" },
            {
                "code": "code2",
                "display": "Code Two",
                "concept": [
                    {
                        "code": "code2a",
                        "display": "Code Two A",
                        "concept": [
                            { "code": "code2aI", "display": "Code Two A I" },
                            { "code": "code2aII", "display": "Code Two A II" }
                        ]
                    },
                    { "code": "code2b", "display": "Code Two B" }
                ]
            },
            { "code": "code3", "display": "Code Three" }
        ]
    }));

    store.insert(json!({
        "resourceType": "CodeSystem",
        "id": "cs-de",
        "url": CS_DE,
        "status": "active",
        "content": "complete",
        "language": "de-CH",
        "concept": [{
            "code": "spital",
            "display": "Spital",
            "designation": [ { "language": "es", "value": "hospital" } ]
        }]
    }));

    store.insert(json!({
        "resourceType": "ValueSet",
        "id": "vs-simple",
        "url": VS_SIMPLE,
        "status": "active",
        "compose": {
            "include": [{
                "system": CS_SIMPLE,
                "filter": [ { "property": "concept", "op": "is-a", "value": "code2" } ]
            }]
        }
    }));

    store.insert(json!({
        "resourceType": "ValueSet",
        "id": "vs-listed",
        "url": VS_LISTED,
        "status": "active",
        "compose": {
            "include": [{
                "system": CS_SIMPLE,
                "concept": [
                    { "code": "code3" },
                    { "code": "code1" }
                ]
            }]
        }
    }));

    store.insert(json!({
        "resourceType": "ValueSet",
        "id": "vs-loop-a",
        "url": VS_LOOP_A,
        "status": "active",
        "compose": { "include": [ { "valueSet": [VS_LOOP_B] } ] }
    }));
    store.insert(json!({
        "resourceType": "ValueSet",
        "id": "vs-loop-b",
        "url": VS_LOOP_B,
        "status": "active",
        "compose": { "include": [ { "valueSet": [VS_LOOP_A] } ] }
    }));

    store.insert(json!({
        "resourceType": "ConceptMap",
        "id": "simple-map",
        "url": MAP_URL,
        "status": "active",
        "sourceUri": VS_SIMPLE,
        "targetUri": "http://example.org/fhir/ValueSet/other",
        "group": [{
            "source": CS_SIMPLE,
            "target": "http://example.org/fhir/CodeSystem/other",
            "element": [{
                "code": "code2a",
                "target": [ { "code": "other-a", "equivalence": "equivalent" } ]
            }]
        }]
    }));
}

fn app() -> Router {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(UcumProvider::new()));
    registry.register(Arc::new(Bcp47Provider::new()));

    let mut store = ResourceStore::new();
    seed_resources(&mut store);

    build_router(AppState::new(Config::default(), registry, store))
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/fhir+json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, body)
}

fn param<'a>(parameters: &'a Value, name: &str) -> Option<&'a Value> {
    parameters["parameter"]
        .as_array()?
        .iter()
        .find(|p| p["name"] == name)
}

#[tokio::test]
async fn lookup_returns_display_and_echoes_request_id() {
    let app = app();
    let (status, headers, body) = send(
        &app,
        Method::GET,
        &format!("/CodeSystem/$lookup?system={}&code=code2a", CS_SIMPLE),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("x-request-id"));
    assert_eq!(body["resourceType"], "Parameters");
    assert_eq!(param(&body, "name").unwrap()["valueString"], "SimpleCodes");
    assert_eq!(param(&body, "display").unwrap()["valueString"], "Code Two A");

    let properties: Vec<&Value> = body["parameter"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|p| p["name"] == "property")
        .collect();
    let has_parent = properties.iter().any(|p| {
        p["part"].as_array().is_some_and(|parts| {
            parts.iter().any(|part| part["valueCode"] == "parent")
                && parts.iter().any(|part| part["valueCode"] == "code2")
        })
    });
    assert!(has_parent, "expected a parent pseudo-property");
}

#[tokio::test]
async fn lookup_unknown_code_is_not_found() {
    let app = app();
    let (status, _, body) = send(
        &app,
        Method::GET,
        &format!("/CodeSystem/$lookup?system={}&code=nope", CS_SIMPLE),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["resourceType"], "OperationOutcome");
    assert_eq!(body["issue"][0]["code"], "not-found");
}

#[tokio::test]
async fn validate_code_in_codesystem_and_display_checking() {
    let app = app();

    let (status, _, body) = send(
        &app,
        Method::GET,
        &format!("/CodeSystem/$validate-code?system={}&code=code1", CS_SIMPLE),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(param(&body, "result").unwrap()["valueBoolean"], true);
    assert_eq!(param(&body, "display").unwrap()["valueString"], "Code One");

    let (_, _, body) = send(
        &app,
        Method::GET,
        &format!(
            "/CodeSystem/$validate-code?system={}&code=code1&display=Wrong",
            CS_SIMPLE
        ),
        None,
    )
    .await;
    assert_eq!(param(&body, "result").unwrap()["valueBoolean"], false);
    assert!(param(&body, "message").unwrap()["valueString"]
        .as_str()
        .unwrap()
        .contains("display"));

    let (_, _, body) = send(
        &app,
        Method::GET,
        &format!("/CodeSystem/$validate-code?system={}&code=ghost", CS_SIMPLE),
        None,
    )
    .await;
    assert_eq!(param(&body, "result").unwrap()["valueBoolean"], false);
}

#[tokio::test]
async fn validate_code_against_valueset_membership() {
    let app = app();

    let (status, _, body) = send(
        &app,
        Method::GET,
        &format!(
            "/ValueSet/$validate-code?url={}&system={}&code=code2a",
            VS_SIMPLE, CS_SIMPLE
        ),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(param(&body, "result").unwrap()["valueBoolean"], true);

    let (_, _, body) = send(
        &app,
        Method::GET,
        &format!(
            "/ValueSet/$validate-code?url={}&system={}&code=code1",
            VS_SIMPLE, CS_SIMPLE
        ),
        None,
    )
    .await;
    assert_eq!(param(&body, "result").unwrap()["valueBoolean"], false);
}

#[tokio::test]
async fn expand_filter_clause_is_sorted_with_total() {
    let app = app();
    let (status, _, body) = send(
        &app,
        Method::GET,
        &format!("/ValueSet/$expand?url={}", VS_SIMPLE),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resourceType"], "ValueSet");
    assert_eq!(body["expansion"]["total"], 5);
    let codes: Vec<&str> = body["expansion"]["contains"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["code"].as_str().unwrap())
        .collect();
    assert_eq!(codes, vec!["code2", "code2a", "code2aI", "code2aII", "code2b"]);
}

#[tokio::test]
async fn expand_explicit_list_preserves_declared_order() {
    let app = app();
    let (_, _, body) = send(
        &app,
        Method::GET,
        &format!("/ValueSet/$expand?url={}", VS_LISTED),
        None,
    )
    .await;

    assert_eq!(body["expansion"]["total"], 2);
    let codes: Vec<&str> = body["expansion"]["contains"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["code"].as_str().unwrap())
        .collect();
    assert_eq!(codes, vec!["code3", "code1"]);
}

#[tokio::test]
async fn expand_pages_deterministically() {
    let app = app();
    let (_, _, body) = send(
        &app,
        Method::GET,
        &format!("/ValueSet/$expand?url={}&offset=1&count=2", VS_SIMPLE),
        None,
    )
    .await;

    assert_eq!(body["expansion"]["total"], 5);
    assert_eq!(body["expansion"]["offset"], 1);
    let codes: Vec<&str> = body["expansion"]["contains"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["code"].as_str().unwrap())
        .collect();
    assert_eq!(codes, vec!["code2a", "code2aI"]);
}

#[tokio::test]
async fn circular_imports_are_reported_with_the_cycle() {
    let app = app();
    let (status, _, body) = send(
        &app,
        Method::GET,
        &format!("/ValueSet/$expand?url={}", VS_LOOP_A),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["issue"][0]["code"], "processing");
    let text = body["issue"][0]["details"]["text"].as_str().unwrap();
    assert!(text.contains("Circular reference detected"));
    assert!(text.contains(VS_LOOP_A));
    assert!(text.contains(VS_LOOP_B));
}

#[tokio::test]
async fn subsumes_walks_the_hierarchy() {
    let app = app();
    let (status, _, body) = send(
        &app,
        Method::GET,
        &format!(
            "/CodeSystem/$subsumes?system={}&codeA=code2&codeB=code2aI",
            CS_SIMPLE
        ),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(param(&body, "outcome").unwrap()["valueCode"], "subsumes");

    let (_, _, body) = send(
        &app,
        Method::GET,
        &format!(
            "/CodeSystem/$subsumes?system={}&codeA=code2aI&codeB=code2",
            CS_SIMPLE
        ),
        None,
    )
    .await;
    assert_eq!(param(&body, "outcome").unwrap()["valueCode"], "subsumed-by");
}

#[tokio::test]
async fn translate_maps_concepts_and_rejects_missing_source() {
    let app = app();
    let (status, _, body) = send(
        &app,
        Method::GET,
        &format!(
            "/ConceptMap/$translate?url={}&sourceSystem={}&sourceCode=code2a",
            MAP_URL, CS_SIMPLE
        ),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(param(&body, "result").unwrap()["valueBoolean"], true);
    let matched = param(&body, "match").unwrap();
    let parts = matched["part"].as_array().unwrap();
    assert!(parts.iter().any(|p| p["valueCode"] == "equivalent"));
    assert!(parts
        .iter()
        .any(|p| p["valueCoding"]["code"] == "other-a"));

    // a missing source code is invalid input, not a missing resource
    let (status, _, body) = send(
        &app,
        Method::GET,
        &format!("/ConceptMap/$translate?url={}", MAP_URL),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["issue"][0]["code"], "invalid");
}

#[tokio::test]
async fn post_parameters_body_equals_get_query() {
    let app = app();
    let body = json!({
        "resourceType": "Parameters",
        "parameter": [
            { "name": "system", "valueUri": CS_SIMPLE },
            { "name": "code", "valueCode": "code2a" }
        ]
    });
    let (status, _, response) = send(
        &app,
        Method::POST,
        "/CodeSystem/$lookup",
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(param(&response, "display").unwrap()["valueString"], "Code Two A");
}

#[tokio::test]
async fn tx_resource_parameter_supplies_a_codesystem() {
    let app = app();
    let body = json!({
        "resourceType": "Parameters",
        "parameter": [
            { "name": "valueSet", "resource": {
                "resourceType": "ValueSet",
                "url": "http://example.org/fhir/ValueSet/inline",
                "status": "active",
                "compose": { "include": [ { "system": "http://example.org/fhir/CodeSystem/inline" } ] }
            }},
            { "name": "tx-resource", "resource": {
                "resourceType": "CodeSystem",
                "url": "http://example.org/fhir/CodeSystem/inline",
                "status": "active",
                "content": "complete",
                "concept": [ { "code": "x", "display": "Ex" }, { "code": "y", "display": "Why" } ]
            }}
        ]
    });
    let (status, _, response) = send(&app, Method::POST, "/ValueSet/$expand", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["expansion"]["total"], 2);
}

#[tokio::test]
async fn display_language_selects_designations() {
    let app = app();
    let (_, _, body) = send(
        &app,
        Method::GET,
        &format!(
            "/CodeSystem/$lookup?system={}&code=spital&displayLanguage=es",
            CS_DE
        ),
        None,
    )
    .await;
    assert_eq!(param(&body, "display").unwrap()["valueString"], "hospital");
}

#[tokio::test]
async fn ucum_codes_validate_structurally() {
    let app = app();
    let (_, _, body) = send(
        &app,
        Method::GET,
        "/CodeSystem/$validate-code?system=http://unitsofmeasure.org&code=mg/dL",
        None,
    )
    .await;
    assert_eq!(param(&body, "result").unwrap()["valueBoolean"], true);

    let (_, _, body) = send(
        &app,
        Method::GET,
        "/CodeSystem/$validate-code?system=http://unitsofmeasure.org&code=florps",
        None,
    )
    .await;
    assert_eq!(param(&body, "result").unwrap()["valueBoolean"], false);
}

#[tokio::test]
async fn read_endpoints_and_method_handling() {
    let app = app();

    let (status, _, body) = send(&app, Method::GET, "/CodeSystem/cs-simple", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["url"], CS_SIMPLE);

    let (status, _, body) = send(&app, Method::GET, "/CodeSystem/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["issue"][0]["code"], "not-found");

    let (status, _, body) = send(&app, Method::PUT, "/CodeSystem/cs-simple", None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body["issue"][0]["code"], "not-supported");

    let (status, _, _) = send(&app, Method::DELETE, "/CodeSystem/cs-simple", None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn metadata_lists_the_operations() {
    let app = app();
    let (status, _, body) = send(&app, Method::GET, "/metadata", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resourceType"], "CapabilityStatement");
    let rest = body["rest"][0]["resource"].as_array().unwrap();
    assert!(rest.iter().any(|r| r["type"] == "ValueSet"));
}

#[tokio::test]
async fn unknown_operation_is_not_supported() {
    let app = app();
    let (status, _, body) = send(&app, Method::GET, "/CodeSystem/$frobnicate", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["issue"][0]["code"], "not-supported");
}

#[tokio::test]
async fn expand_text_filter_matches_designations_case_insensitively() {
    let app = app();
    let (_, _, body) = send(
        &app,
        Method::GET,
        &format!("/ValueSet/$expand?url={}&filter=two%20a", VS_SIMPLE),
        None,
    )
    .await;

    let codes: Vec<&str> = body["expansion"]["contains"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["code"].as_str().unwrap())
        .collect();
    assert_eq!(codes, vec!["code2a", "code2aI", "code2aII"]);
}
