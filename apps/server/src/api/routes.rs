//! Route table and request-id middleware.

use super::handlers;
use crate::state::AppState;
use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

/// Request id, taken from the inbound `X-Request-Id` header or minted here.
/// Every response echoes it.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/metadata", get(handlers::metadata))
        .route("/metrics", get(handlers::metrics))
        .route(
            "/:resource_type/:tail",
            get(handlers::type_level)
                .post(handlers::type_level)
                .put(handlers::method_not_allowed)
                .delete(handlers::method_not_allowed),
        )
        .route(
            "/:resource_type/:id/:operation",
            get(handlers::instance_level).post(handlers::instance_level),
        )
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .with_state(state)
}
