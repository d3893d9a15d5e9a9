//! HTTP routes.
//!
//! ```text
//! POST /sync/push   PushRequest  → PushResponse
//! POST /sync/pull   PullRequest  → PullResponse
//! GET  /health      {"status": "ok"} | 503
//! ```

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use billbook_core::{PullRequest, PullResponse, PushRequest, PushResponse};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::error::ServerResult;
use crate::identity::Identity;
use crate::service::ReconciliationService;

/// Builds the application router.
pub fn router(service: Arc<ReconciliationService>) -> Router {
    Router::new()
        .route("/sync/push", post(push_handler))
        .route("/sync/pull", post(pull_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn push_handler(
    State(service): State<Arc<ReconciliationService>>,
    identity: Identity,
    Json(request): Json<PushRequest>,
) -> ServerResult<Json<PushResponse>> {
    Ok(Json(service.push(&identity, request).await?))
}

async fn pull_handler(
    State(service): State<Arc<ReconciliationService>>,
    identity: Identity,
    Json(request): Json<PullRequest>,
) -> ServerResult<Json<PullResponse>> {
    Ok(Json(service.pull(&identity, request).await?))
}

async fn health_handler(State(service): State<Arc<ReconciliationService>>) -> impl IntoResponse {
    if service.store().health_check().await {
        (StatusCode::OK, Json(json!({"status": "ok"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable"})),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::identity::{TENANT_HEADER, USER_HEADER};
    use crate::store::ServerStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use serde_json::Value;
    use tower::ServiceExt;

    async fn app() -> Router {
        let config = ServerConfig::in_memory();
        let store = ServerStore::connect(&config).await.unwrap();
        router(Arc::new(ReconciliationService::new(store, &config)))
    }

    fn post_json(uri: &str, tenant: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(tenant) = tenant {
            builder = builder.header(TENANT_HEADER, tenant).header(USER_HEADER, "user-1");
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .await
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_push_requires_identity() {
        let response = app()
            .await
            .oneshot(post_json(
                "/sync/push",
                None,
                json!({"changes": [], "deviceId": "dev-1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["code"], "unauthenticated");
    }

    #[tokio::test]
    async fn test_push_then_pull_over_http() {
        let app = app().await;

        let push = json!({
            "changes": [{
                "table": "products",
                "action": "insert",
                "id": "p-1",
                "data": {"name": "Tea", "price_cents": 150},
                "localTimestamp": 10,
                "operationId": "op-1"
            }],
            "deviceId": "dev-1"
        });
        let response = app
            .clone()
            .oneshot(post_json("/sync/push", Some("biz-1"), push))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["accepted"], 1);
        assert_eq!(body["rejected"], 0);

        let response = app
            .oneshot(post_json("/sync/pull", Some("biz-1"), json!({"tables": ["products"]})))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["changes"][0]["id"], "p-1");
        assert_eq!(body["changes"][0]["action"], "update");
        assert_eq!(body["hasMore"], false);
    }

    #[tokio::test]
    async fn test_unknown_pull_table_is_bad_request() {
        let response = app()
            .await
            .oneshot(post_json("/sync/pull", Some("biz-1"), json!({"tables": ["invoices"]})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "invalid_request");
    }
}
