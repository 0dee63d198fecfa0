//! Operation and read handlers.
//!
//! GET and POST invocations are normalized into one Parameters model before
//! dispatch, so query-string and body clients behave identically. The
//! OperationContext is created here and carries the request id, the
//! negotiated languages, the time budget and the cache handles.

use super::routes::RequestId;
use crate::context::OperationContext;
use crate::error::{Error, Result};
use crate::metrics::{OPERATION_DURATION, OPERATION_REQUESTS};
use crate::models::{OperationScope, Parameters};
use crate::state::AppState;
use crate::tx::Worker;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use argentum_languages::Languages;
use argentum_models::ValueSet;
use serde_json::Value as JsonValue;

const FHIR_JSON: &str = "application/fhir+json; charset=utf-8";

fn fhir_response(status: StatusCode, body: JsonValue) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(FHIR_JSON));
    response
}

fn build_context(
    state: &AppState,
    request_id: &RequestId,
    headers: &HeaderMap,
    parameters: &Parameters,
) -> OperationContext {
    let languages = headers
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok())
        .map(Languages::parse_accept_language)
        .unwrap_or_default();

    let mut context = OperationContext::new(
        request_id.0.clone(),
        languages,
        state.config.time_budget(),
        state.resource_cache.clone(),
        state.expansion_cache.clone(),
    );
    if let Some(display_language) = parameters.get_string("displayLanguage") {
        context.display_languages = Languages::single(&display_language).ok();
    }
    context
}

/// Merge a GET query and an optional POST body into one Parameters resource.
fn gather_parameters(
    method: &Method,
    query: Vec<(String, String)>,
    body: Bytes,
) -> Result<Parameters> {
    if method == Method::POST && !body.is_empty() {
        let resource: JsonValue = serde_json::from_slice(&body)
            .map_err(|e| Error::Validation(format!("Request body is not valid JSON: {}", e)))?;
        if resource.get("resourceType").and_then(|v| v.as_str()) != Some("Parameters") {
            return Err(Error::Validation(
                "POST operation body must be a Parameters resource".to_string(),
            ));
        }
        let mut parameters: Parameters = serde_json::from_value(resource)
            .map_err(|e| Error::Validation(format!("Malformed Parameters resource: {}", e)))?;
        // query parameters still apply on POST
        for (name, value) in query {
            parameters.add_value_string(name, value);
        }
        Ok(parameters)
    } else {
        Ok(Parameters::from_query(&query))
    }
}

pub async fn metadata(State(state): State<AppState>) -> Response {
    fhir_response(
        StatusCode::OK,
        crate::conformance::capability_statement(&state),
    )
}

pub async fn metrics() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::gather(),
    )
        .into_response()
}

pub async fn method_not_allowed(Path((resource_type, id)): Path<(String, String)>) -> Response {
    Error::MethodNotAllowed(format!(
        "Write operations are not supported (on {}/{})",
        resource_type, id
    ))
    .into_response()
}

/// `/{type}/{tail}` where tail is either `$operation` or an instance id.
pub async fn type_level(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
    Path((resource_type, tail)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    if let Some(operation) = tail.strip_prefix('$') {
        return run_operation(
            state,
            request_id,
            method,
            headers,
            query,
            body,
            OperationScope::Type(resource_type),
            operation.to_string(),
        )
        .await;
    }

    // instance read
    match method {
        Method::GET => match state.store.get(&resource_type, &tail) {
            Some(resource) => fhir_response(StatusCode::OK, resource.clone()),
            None => Error::ResourceNotFound {
                resource_type,
                id: tail,
            }
            .into_response(),
        },
        _ => Error::MethodNotAllowed(format!(
            "{} is not supported on {}/{}",
            method, resource_type, tail
        ))
        .into_response(),
    }
}

/// `/{type}/{id}/${operation}`
pub async fn instance_level(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
    Path((resource_type, id, operation)): Path<(String, String, String)>,
    body: Bytes,
) -> Response {
    let Some(operation) = operation.strip_prefix('$').map(|o| o.to_string()) else {
        return Error::NotFound(format!(
            "{}/{}/{} is not a valid path",
            resource_type, id, operation
        ))
        .into_response();
    };
    run_operation(
        state,
        request_id,
        method,
        headers,
        query,
        body,
        OperationScope::Instance(resource_type, id),
        operation,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn run_operation(
    state: AppState,
    request_id: RequestId,
    method: Method,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    body: Bytes,
    scope: OperationScope,
    operation: String,
) -> Response {
    let timer = OPERATION_DURATION
        .with_label_values(&[operation.as_str()])
        .start_timer();
    let result = dispatch(
        &state, &request_id, &method, &headers, query, body, scope, &operation,
    )
    .await;
    timer.observe_duration();
    OPERATION_REQUESTS
        .with_label_values(&[
            operation.as_str(),
            if result.is_ok() { "ok" } else { "error" },
        ])
        .inc();

    match result {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: &AppState,
    request_id: &RequestId,
    method: &Method,
    headers: &HeaderMap,
    query: Vec<(String, String)>,
    body: Bytes,
    scope: OperationScope,
    operation: &str,
) -> Result<Response> {
    let mut parameters = gather_parameters(method, query, body)?;

    // cache-id bookkeeping: submitted resources join the client's space
    if let Some(cache_id) = parameters.get_string("cache-id") {
        let submitted: Vec<JsonValue> = parameters
            .get_resources("tx-resource")
            .into_iter()
            .cloned()
            .collect();
        if !submitted.is_empty() {
            state.resource_cache.add(&cache_id, submitted);
        }
    }

    // instance subjects fold into the parameter set
    let mut instance_valueset: Option<ValueSet> = None;
    if let OperationScope::Instance(resource_type, id) = &scope {
        let resource = state
            .store
            .get(resource_type, id)
            .ok_or_else(|| Error::ResourceNotFound {
                resource_type: resource_type.clone(),
                id: id.clone(),
            })?
            .clone();
        match resource_type.as_str() {
            "ValueSet" => instance_valueset = Some(serde_json::from_value(resource)?),
            "CodeSystem" => {
                if let Some(url) = resource.get("url").and_then(|v| v.as_str()) {
                    if parameters.get_string("system").is_none() {
                        parameters.add_value_uri("system".to_string(), url.to_string());
                    }
                }
            }
            "ConceptMap" => {
                if let Some(url) = resource.get("url").and_then(|v| v.as_str()) {
                    if parameters.get_string("url").is_none() {
                        parameters.add_value_uri("url".to_string(), url.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    let context = build_context(state, request_id, headers, &parameters);
    let worker = Worker::new(state, &context, &parameters)?;

    let resource_type = match &scope {
        OperationScope::Type(t) | OperationScope::Instance(t, _) => t.as_str(),
        OperationScope::System => "",
    };

    match (resource_type, operation) {
        ("CodeSystem", "lookup") => {
            let out = worker.lookup(&parameters).await?;
            Ok(fhir_response(StatusCode::OK, serde_json::to_value(out)?))
        }
        ("CodeSystem", "validate-code") => {
            let out = worker.validate_code(&parameters, None).await?;
            Ok(fhir_response(StatusCode::OK, serde_json::to_value(out)?))
        }
        ("ValueSet", "validate-code") => {
            let valueset = worker
                .subject_valueset(&parameters, instance_valueset.as_ref())
                .await?;
            let out = worker.validate_code(&parameters, Some(valueset)).await?;
            Ok(fhir_response(StatusCode::OK, serde_json::to_value(out)?))
        }
        ("ValueSet", "expand") => {
            let valueset = worker
                .subject_valueset(&parameters, instance_valueset.as_ref())
                .await?;
            let out = worker.expand(&parameters, valueset).await?;
            Ok(fhir_response(StatusCode::OK, out))
        }
        ("CodeSystem", "subsumes") => {
            let out = worker.subsumes(&parameters).await?;
            Ok(fhir_response(StatusCode::OK, serde_json::to_value(out)?))
        }
        ("ConceptMap", "translate") => {
            let out = worker.translate(&parameters).await?;
            Ok(fhir_response(StatusCode::OK, serde_json::to_value(out)?))
        }
        _ => Err(Error::NotSupported(format!(
            "Operation ${} is not supported on {}",
            operation,
            if resource_type.is_empty() {
                "the system"
            } else {
                resource_type
            }
        ))),
    }
}
