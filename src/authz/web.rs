use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sea_orm::DatabaseConnection;
use serde_json::json;

use crate::authz::engine::AuthorizationChecker;
use crate::authz::types::{CheckRequest, CheckResponse, HttpMethod, PublicApi};
use crate::errors::PortcullisError;
use crate::settings::Settings;
use crate::storage;

#[derive(Clone)]
pub struct CheckState {
    pub checker: Arc<AuthorizationChecker>,
    pub db: DatabaseConnection,
    internal_header: String,
    internal_header_value: Option<String>,
}

impl CheckState {
    pub fn new(checker: Arc<AuthorizationChecker>, db: DatabaseConnection, settings: &Settings) -> Self {
        Self {
            checker,
            db,
            internal_header: settings.authz.internal_header.clone(),
            internal_header_value: settings.authz.internal_header_value.clone(),
        }
    }

    fn is_internal(&self, headers: &HeaderMap) -> bool {
        match (&self.internal_header_value, headers.get(self.internal_header.as_str())) {
            (Some(expected), Some(got)) => got.as_bytes() == expected.as_bytes(),
            _ => false,
        }
    }
}

pub fn router(state: CheckState) -> Router {
    Router::new()
        .route("/v1/check", post(handle_check))
        .route("/v1/internal/check", post(handle_internal_check))
        .route("/v1/principals/{id}/permissions", get(handle_permissions))
        .route("/v1/public-apis", get(handle_public_apis))
        .route("/healthz", get(health))
        .with_state(state)
}

/// Map a failure to the check response shape. Internal details stay in the
/// log.
pub fn error_response(err: PortcullisError) -> Response {
    let err = match err {
        PortcullisError::Authz(e) => return e.into_response(),
        other => other,
    };
    let status = match &err {
        PortcullisError::Validation(_) => StatusCode::BAD_REQUEST,
        PortcullisError::NotFound(_) => StatusCode::NOT_FOUND,
        PortcullisError::Conflict(_) => StatusCode::CONFLICT,
        PortcullisError::Protected(_) => StatusCode::FORBIDDEN,
        PortcullisError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        other => {
            tracing::error!(error = %other, "authorization request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let body = json!({ "allowed": false, "message": err.public_message() });
    (status, Json(body)).into_response()
}

async fn handle_check(
    State(state): State<CheckState>,
    Json(req): Json<CheckRequest>,
) -> impl IntoResponse {
    match state.checker.check(req.principal_id, &req.path, &req.method).await {
        Ok(decision) => Json(CheckResponse::from(decision)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_internal_check(
    State(state): State<CheckState>,
    headers: HeaderMap,
    Json(req): Json<CheckRequest>,
) -> impl IntoResponse {
    if !state.is_internal(&headers) {
        tracing::warn!(principal_id = req.principal_id, "internal check without trust header");
        let body = CheckResponse {
            allowed: false,
            message: "forbidden".to_string(),
        };
        return (StatusCode::FORBIDDEN, Json(body)).into_response();
    }
    handle_check(State(state), Json(req)).await.into_response()
}

async fn handle_permissions(
    State(state): State<CheckState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.checker.effective_permissions(id).await {
        Ok(perms) => Json(perms).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_public_apis(State(state): State<CheckState>) -> impl IntoResponse {
    match storage::list_public_apis(&state.db).await {
        Ok(apis) => {
            let apis: Vec<PublicApi> = apis
                .into_iter()
                .filter_map(|api| {
                    HttpMethod::from_code(api.method).map(|m| PublicApi {
                        path: api.path,
                        method: m.as_str().to_string(),
                    })
                })
                .collect();
            Json(apis).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSink;
    use crate::authz::store::PolicyStore;
    use crate::authz::sync::Synchronizer;
    use crate::storage::test_support::TestDb;
    use crate::storage::{NewApi, NewRole};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn read_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    fn check_request(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn app(test_db: &TestDb) -> (Router, i64) {
        let mut settings = Settings::default();
        settings.authz.internal_header_value = Some("gateway".to_string());

        let db = test_db.connection().clone();
        let store = Arc::new(PolicyStore::load(db.clone()).await.unwrap());
        let sync = Synchronizer::new(db.clone(), store.clone(), AuditSink::disabled(), &settings);
        sync.bootstrap().await.unwrap();

        let viewer = sync
            .create_role(
                "test",
                NewRole {
                    name: "viewer".into(),
                    code: "viewer".into(),
                    description: None,
                    enabled: true,
                    is_system: false,
                },
            )
            .await
            .unwrap();
        let reports = sync
            .create_api(
                "test",
                NewApi {
                    path: "/api/reports/*".into(),
                    method: 1,
                    name: "reports".into(),
                    description: None,
                    is_public: false,
                },
            )
            .await
            .unwrap();
        sync.create_api(
            "test",
            NewApi {
                path: "/login".into(),
                method: 2,
                name: "login".into(),
                description: None,
                is_public: true,
            },
        )
        .await
        .unwrap();
        sync.assign_apis_to_role("test", viewer.id, &[reports.id])
            .await
            .unwrap();
        let user = sync.create_user("test", "kim").await.unwrap();
        sync.assign_roles_to_user("test", user.id, &[viewer.id])
            .await
            .unwrap();

        let checker = Arc::new(AuthorizationChecker::new(store, AuditSink::disabled(), &settings));
        (router(CheckState::new(checker, db, &settings)), user.id)
    }

    #[tokio::test]
    async fn test_check_endpoint() {
        let test_db = TestDb::new().await;
        let (app, user_id) = app(&test_db).await;

        let req = check_request(
            "/v1/check",
            json!({ "principal_id": user_id, "path": "/api/reports/7", "method": "GET" }),
        );
        let response = app.clone().oneshot(req).await.expect("check");
        assert_eq!(response.status(), StatusCode::OK);
        let payload = read_json(response).await;
        assert_eq!(payload["allowed"], true);

        let req = check_request(
            "/v1/check",
            json!({ "principal_id": user_id, "path": "/api/reports/7", "method": "DELETE" }),
        );
        let payload = read_json(app.oneshot(req).await.expect("check")).await;
        assert_eq!(payload["allowed"], false);
    }

    #[tokio::test]
    async fn test_internal_check_requires_trust_header() {
        let test_db = TestDb::new().await;
        let (app, user_id) = app(&test_db).await;
        let body = json!({ "principal_id": user_id, "path": "/api/reports/7", "method": "GET" });

        let response = app
            .clone()
            .oneshot(check_request("/v1/internal/check", body.clone()))
            .await
            .expect("internal");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(read_json(response).await["allowed"], false);

        let mut req = check_request("/v1/internal/check", body);
        req.headers_mut()
            .insert("x-internal-request", "gateway".parse().unwrap());
        let response = app.oneshot(req).await.expect("internal");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await["allowed"], true);
    }

    #[tokio::test]
    async fn test_permissions_and_public_apis() {
        let test_db = TestDb::new().await;
        let (app, user_id) = app(&test_db).await;

        let req = Request::builder()
            .uri(format!("/v1/principals/{user_id}/permissions"))
            .body(Body::empty())
            .expect("request");
        let payload = read_json(app.clone().oneshot(req).await.expect("perms")).await;
        assert_eq!(payload["roles"], json!(["viewer"]));
        assert_eq!(payload["permissions"][0]["object"], "/api/reports/*");

        let req = Request::builder()
            .uri("/v1/public-apis")
            .body(Body::empty())
            .expect("request");
        let payload = read_json(app.oneshot(req).await.expect("public")).await;
        assert_eq!(payload, json!([{ "path": "/login", "method": "POST" }]));
    }
}
