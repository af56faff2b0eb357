use portcullis::authz::sync::Synchronizer;
use portcullis::entities;
use portcullis::storage::{NewApi, NewRole};

const ACTOR: &str = "test";

/// Builder for creating test roles
pub struct RoleBuilder {
    name: String,
    code: String,
    description: Option<String>,
    enabled: bool,
}

impl RoleBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            code: name.to_string(),
            description: None,
            enabled: true,
        }
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = code.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub async fn create(self, sync: &Synchronizer) -> entities::role::Model {
        sync.create_role(
            ACTOR,
            NewRole {
                name: self.name,
                code: self.code,
                description: self.description,
                enabled: self.enabled,
                is_system: false,
            },
        )
        .await
        .expect("Failed to create test role")
    }
}

/// Builder for creating test apis
pub struct ApiBuilder {
    path: String,
    method: i32,
    name: Option<String>,
    is_public: bool,
}

impl ApiBuilder {
    /// `method` uses the stored codes: 1 GET, 2 POST, 3 PUT, 4 DELETE ...
    pub fn new(path: &str, method: i32) -> Self {
        Self {
            path: path.to_string(),
            method,
            name: None,
            is_public: false,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn public(mut self) -> Self {
        self.is_public = true;
        self
    }

    pub async fn create(self, sync: &Synchronizer) -> entities::api::Model {
        let name = self
            .name
            .unwrap_or_else(|| format!("{} {}", self.method, self.path));
        sync.create_api(
            ACTOR,
            NewApi {
                path: self.path,
                method: self.method,
                name,
                description: None,
                is_public: self.is_public,
            },
        )
        .await
        .expect("Failed to create test api")
    }
}
