//! HTTP surface. The check API listens on the public port; the admin GraphQL
//! API gets its own listener so it can stay off the routing layer's network.
use crate::admin_graphql;
use crate::audit::AuditSink;
use crate::authz::engine::AuthorizationChecker;
use crate::authz::store::PolicyStore;
use crate::authz::sync::Synchronizer;
use crate::authz::web::CheckState;
use crate::errors::PortcullisError;
use crate::settings::Settings;
use axum::Router;
use miette::IntoDiagnostic;
use sea_orm::DatabaseConnection;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub store: Arc<PolicyStore>,
    pub sync: Arc<Synchronizer>,
    pub checker: Arc<AuthorizationChecker>,
}

impl AppState {
    /// Load the policy table, wire the synchronizer and checker to the same
    /// store, and make sure the super-admin exists.
    pub async fn build(
        settings: Settings,
        db: DatabaseConnection,
        audit: AuditSink,
    ) -> Result<Self, PortcullisError> {
        let store = Arc::new(PolicyStore::load(db.clone()).await?);
        let sync = Arc::new(Synchronizer::new(
            db.clone(),
            store.clone(),
            audit.clone(),
            &settings,
        ));
        sync.bootstrap().await?;
        let checker = Arc::new(AuthorizationChecker::new(store.clone(), audit, &settings));

        let stats = store.stats();
        tracing::info!(
            policies = stats.policies,
            groupings = stats.groupings,
            "Policy store ready"
        );

        Ok(Self {
            settings: Arc::new(settings),
            db,
            store,
            sync,
            checker,
        })
    }

    pub fn public_router(&self) -> Router {
        let state = CheckState::new(self.checker.clone(), self.db.clone(), &self.settings);
        crate::authz::web::router(state).layer(TraceLayer::new_for_http())
    }

    pub fn admin_router(&self) -> Router {
        let schema = admin_graphql::build_schema(self.sync.clone(), self.checker.clone());
        admin_graphql::router(schema).layer(TraceLayer::new_for_http())
    }
}

fn listen_addr(host: &str, port: u16) -> miette::Result<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .map_err(|e| miette::miette!("bad listen addr {host}:{port}: {e}"))
}

pub async fn serve(state: AppState) -> miette::Result<()> {
    let public_addr = listen_addr(&state.settings.server.host, state.settings.server.port)?;
    let admin_addr = listen_addr(&state.settings.server.host, state.settings.admin_port())?;

    let admin_listener = tokio::net::TcpListener::bind(admin_addr)
        .await
        .into_diagnostic()?;
    tracing::info!(%admin_addr, "Admin GraphQL API listening");
    tracing::info!(
        "GraphQL Playground available at http://{}/admin/playground",
        admin_addr
    );

    let admin_router = state.admin_router();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(admin_listener, admin_router).await {
            tracing::error!(error = %e, "Admin server failed");
        }
    });

    let listener = tokio::net::TcpListener::bind(public_addr)
        .await
        .into_diagnostic()?;
    tracing::info!(%public_addr, "Authorization API listening");
    axum::serve(listener, state.public_router())
        .await
        .into_diagnostic()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::TestDb;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_build_bootstraps_super_admin() {
        let test_db = TestDb::new().await;
        let state = AppState::build(
            Settings::default(),
            test_db.connection().clone(),
            AuditSink::disabled(),
        )
        .await
        .unwrap();

        let stats = state.store.stats();
        assert_eq!(stats.policies, 7);
        assert_eq!(stats.groupings, 1);

        let response = state
            .public_router()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_router_serves_graphql() {
        let test_db = TestDb::new().await;
        let state = AppState::build(
            Settings::default(),
            test_db.connection().clone(),
            AuditSink::disabled(),
        )
        .await
        .unwrap();

        let req = Request::builder()
            .method("POST")
            .uri("/admin/graphql")
            .header("content-type", "application/json")
            .header(admin_graphql::ACTOR_HEADER, "ops@example.com")
            .body(Body::from(r#"{"query":"{ roles { name isSystem } }"}"#))
            .unwrap();
        let response = state.admin_router().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            payload["data"]["roles"],
            serde_json::json!([{ "name": "admin", "isSystem": true }])
        );
    }
}
