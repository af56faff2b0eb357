//! Portcullis - RBAC policy and assignment engine
//!
//! Keeps role/api/user assignments in relational tables, mirrors them as
//! (subject, path pattern, method) triples in a policy store, and answers
//! path/method authorization checks from an in-memory snapshot.

pub mod admin_graphql;
pub mod admin_mutations;
pub mod audit;
pub mod authz;
pub mod entities;
pub mod errors;
pub mod jobs;
pub mod settings;
pub mod storage;
pub mod web;
