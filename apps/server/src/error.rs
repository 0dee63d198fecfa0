//! Error types for the terminology server

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Resource not found: {resource_type}/{id}")]
    ResourceNotFound { resource_type: String, id: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Circular reference detected: {0}")]
    CircularReference(String),

    #[error("Operation too costly: {message}")]
    TooCostly {
        message: String,
        /// TimeTracker trail, echoed in OperationOutcome.diagnostics
        diagnostics: Option<String>,
    },

    #[error("Version conflict: {0}")]
    Conflict(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Shorthand for budget/size failures without a diagnostics trail.
    pub fn too_costly(message: impl Into<String>) -> Self {
        Error::TooCostly {
            message: message.into(),
            diagnostics: None,
        }
    }
}

impl From<argentum_ecl::Error> for Error {
    fn from(e: argentum_ecl::Error) -> Self {
        match e {
            argentum_ecl::Error::TooManyResults(limit) => Error::TooCostly {
                message: format!("too many results (limit {})", limit),
                diagnostics: None,
            },
            argentum_ecl::Error::Store(message) => Error::Internal(message),
            other => Error::Expression(other.to_string()),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message, diagnostics) = match &self {
            Error::ResourceNotFound { .. } | Error::NotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string(), None)
            }
            Error::Validation(_) | Error::Expression(_) => {
                (StatusCode::BAD_REQUEST, self.to_string(), None)
            }
            Error::NotSupported(_) => (StatusCode::BAD_REQUEST, self.to_string(), None),
            Error::MethodNotAllowed(_) => (StatusCode::METHOD_NOT_ALLOWED, self.to_string(), None),
            Error::CircularReference(_) => (StatusCode::BAD_REQUEST, self.to_string(), None),
            Error::TooCostly { message, diagnostics } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                message.clone(),
                diagnostics.clone(),
            ),
            Error::Conflict(_) => (StatusCode::CONFLICT, self.to_string(), None),
            Error::Transport(_) => (StatusCode::BAD_GATEWAY, self.to_string(), None),
            Error::Database(_) | Error::Serialization(_) | Error::Internal(_) | Error::Other(_) => {
                tracing::error!("Internal error: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    None,
                )
            }
        };

        let mut issue = json!({
            "severity": "error",
            "code": status_to_issue_code(status, &self),
            "details": { "text": message }
        });
        if let Some(diagnostics) = diagnostics {
            issue["diagnostics"] = json!(diagnostics);
        }

        let body = Json(json!({
            "resourceType": "OperationOutcome",
            "issue": [issue]
        }));

        let mut response = (status, body).into_response();

        // Always emit a FHIR content type for OperationOutcome errors.
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/fhir+json; charset=utf-8"),
        );

        response
    }
}

fn status_to_issue_code(status: StatusCode, error: &Error) -> &'static str {
    match error {
        Error::CircularReference(_) => return "processing",
        Error::NotSupported(_) => return "not-supported",
        _ => {}
    }
    match status {
        StatusCode::BAD_REQUEST => "invalid",
        StatusCode::NOT_FOUND => "not-found",
        StatusCode::METHOD_NOT_ALLOWED => "not-supported",
        StatusCode::CONFLICT => "conflict",
        StatusCode::UNPROCESSABLE_ENTITY => "too-costly",
        StatusCode::BAD_GATEWAY => "transient",
        _ => "exception",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_codes_follow_the_taxonomy() {
        let cases = vec![
            (Error::Validation("x".into()), StatusCode::BAD_REQUEST, "invalid"),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND, "not-found"),
            (
                Error::NotSupported("x".into()),
                StatusCode::BAD_REQUEST,
                "not-supported",
            ),
            (
                Error::MethodNotAllowed("PUT".into()),
                StatusCode::METHOD_NOT_ALLOWED,
                "not-supported",
            ),
            (
                Error::CircularReference("[a, b]".into()),
                StatusCode::BAD_REQUEST,
                "processing",
            ),
            (
                Error::too_costly("budget exceeded"),
                StatusCode::UNPROCESSABLE_ENTITY,
                "too-costly",
            ),
            (Error::Conflict("x".into()), StatusCode::CONFLICT, "conflict"),
        ];

        for (error, expected_status, expected_code) in cases {
            let expected = status_to_issue_code(expected_status, &error);
            assert_eq!(expected, expected_code);
            let response = error.into_response();
            assert_eq!(response.status(), expected_status);
        }
    }
}
