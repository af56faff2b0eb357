use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AuthzError {
    #[error("unsupported method `{0}`")]
    #[diagnostic(
        code(portcullis::authz::unsupported_method),
        help("Supported methods: GET, POST, PUT, DELETE, PATCH, OPTIONS, HEAD (codes 1-7)")
    )]
    UnsupportedMethod(String),

    #[error("malformed path pattern `{0}`")]
    #[diagnostic(
        code(portcullis::authz::malformed_pattern),
        help("A pattern starts with `/` or `*` and holds at most one `*` wildcard")
    )]
    MalformedPattern(String),

    #[error("invalid policy filter: {0}")]
    #[diagnostic(
        code(portcullis::authz::invalid_filter),
        help("Filters address value columns v0..v5; field_index + values.len() must not exceed 6")
    )]
    InvalidFilter(String),

    #[error("policy store error: {0}")]
    #[diagnostic(code(portcullis::authz::store))]
    Store(#[from] sea_orm::DbErr),
}

impl AuthzError {
    pub fn public_message(&self) -> String {
        match self {
            AuthzError::UnsupportedMethod(_)
            | AuthzError::MalformedPattern(_)
            | AuthzError::InvalidFilter(_) => self.to_string(),
            AuthzError::Store(_) => "internal error".to_string(),
        }
    }
}

impl IntoResponse for AuthzError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthzError::UnsupportedMethod(_)
            | AuthzError::MalformedPattern(_)
            | AuthzError::InvalidFilter(_) => StatusCode::BAD_REQUEST,
            AuthzError::Store(e) => {
                tracing::error!(error = %e, "policy store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({ "allowed": false, "message": self.public_message() });
        (status, Json(body)).into_response()
    }
}
