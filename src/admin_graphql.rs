use async_graphql::EmptySubscription;
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::{
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::admin_mutations::{AdminActor, AdminMutation, AdminQuery};
use crate::authz::engine::AuthorizationChecker;
use crate::authz::sync::Synchronizer;

pub type AdminSchema = async_graphql::Schema<AdminQuery, AdminMutation, EmptySubscription>;

/// Header naming the operator behind an admin request, for the audit trail
pub const ACTOR_HEADER: &str = "x-admin-actor";

/// Build the admin GraphQL schema
pub fn build_schema(sync: Arc<Synchronizer>, checker: Arc<AuthorizationChecker>) -> AdminSchema {
    async_graphql::Schema::build(AdminQuery, AdminMutation, EmptySubscription)
        .data(sync)
        .data(checker)
        .finish()
}

#[derive(Clone)]
pub struct AdminState {
    pub schema: AdminSchema,
}

/// GraphQL POST handler
async fn graphql_handler(
    State(state): State<Arc<AdminState>>,
    headers: HeaderMap,
    req: GraphQLRequest,
) -> GraphQLResponse {
    let mut req = req.into_inner();
    if let Some(actor) = headers.get(ACTOR_HEADER).and_then(|v| v.to_str().ok()) {
        req = req.data(AdminActor(actor.to_string()));
    }
    state.schema.execute(req).await.into()
}

/// GraphQL playground (GraphiQL) handler
async fn graphql_playground() -> impl IntoResponse {
    axum::response::Html(
        async_graphql::http::GraphiQLSource::build()
            .endpoint("/admin/graphql")
            .finish(),
    )
}

/// Create the admin API router
pub fn router(schema: AdminSchema) -> Router {
    let state = Arc::new(AdminState { schema });

    Router::new()
        .route("/admin/graphql", post(graphql_handler))
        .route("/admin/playground", get(graphql_playground))
        .with_state(state)
}
