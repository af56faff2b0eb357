//! RBAC policy engine: path matching, the policy store, the synchronizer
//! that keeps it derived from the assignment tables, and the checker.

pub mod engine;
pub mod errors;
pub mod matcher;
pub mod store;
pub mod sync;
pub mod types;
pub mod web;
