use miette::Diagnostic;
use thiserror::Error;

use crate::authz::errors::AuthzError;

#[derive(Debug, Error, Diagnostic)]
pub enum PortcullisError {
    #[error("Config error: {0}")]
    #[diagnostic(code(portcullis::config))]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    #[diagnostic(code(portcullis::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("Validation error: {0}")]
    #[diagnostic(code(portcullis::validation))]
    Validation(String),

    #[error("{0} not found or already deleted")]
    #[diagnostic(
        code(portcullis::not_found),
        help("Every referenced id must resolve to a live (non-deleted) row")
    )]
    NotFound(String),

    #[error("{0}")]
    #[diagnostic(code(portcullis::conflict))]
    Conflict(String),

    #[error("{0}")]
    #[diagnostic(
        code(portcullis::protected),
        help("System roles, the super-admin user and roles with members are protected")
    )]
    Protected(String),

    #[error("Operation timed out: {0}")]
    #[diagnostic(code(portcullis::timeout))]
    Timeout(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Authz(#[from] AuthzError),

    #[error("{0}")]
    #[diagnostic(code(portcullis::other))]
    Other(String),
}

impl PortcullisError {
    /// Message safe to hand to API callers. Backing-store failures collapse
    /// to a generic message so SQL never leaks out.
    pub fn public_message(&self) -> String {
        match self {
            PortcullisError::Validation(_)
            | PortcullisError::NotFound(_)
            | PortcullisError::Conflict(_)
            | PortcullisError::Protected(_)
            | PortcullisError::Timeout(_) => self.to_string(),
            PortcullisError::Authz(e) => e.public_message(),
            _ => "internal error".to_string(),
        }
    }
}
