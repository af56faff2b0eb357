pub mod api;
pub mod job_execution;
pub mod policy_rule;
pub mod role;
pub mod role_api;
pub mod user;
pub mod user_api;
pub mod user_role;

pub use api::Entity as Api;
pub use job_execution::Entity as JobExecution;
pub use policy_rule::Entity as PolicyRule;
pub use role::Entity as Role;
pub use role_api::Entity as RoleApi;
pub use user::Entity as User;
pub use user_api::Entity as UserApi;
pub use user_role::Entity as UserRole;
