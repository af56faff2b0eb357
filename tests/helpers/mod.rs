pub mod builders;
pub mod db;

pub use builders::{ApiBuilder, RoleBuilder};
pub use db::{engine, Engine, TestDb};
