use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::authz::errors::AuthzError;

/// HTTP methods an Api row can carry. The integer code is what gets
/// persisted; the string form is the action of a policy triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Head,
}

impl HttpMethod {
    pub const ALL: [HttpMethod; 7] = [
        HttpMethod::Get,
        HttpMethod::Post,
        HttpMethod::Put,
        HttpMethod::Delete,
        HttpMethod::Patch,
        HttpMethod::Options,
        HttpMethod::Head,
    ];

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(HttpMethod::Get),
            2 => Some(HttpMethod::Post),
            3 => Some(HttpMethod::Put),
            4 => Some(HttpMethod::Delete),
            5 => Some(HttpMethod::Patch),
            6 => Some(HttpMethod::Options),
            7 => Some(HttpMethod::Head),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            HttpMethod::Get => 1,
            HttpMethod::Post => 2,
            HttpMethod::Put => 3,
            HttpMethod::Delete => 4,
            HttpMethod::Patch => 5,
            HttpMethod::Options => 6,
            HttpMethod::Head => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Head => "HEAD",
        }
    }

    /// Resolve a persisted code, failing on anything outside 1..=7.
    pub fn try_from_code(code: i32) -> Result<Self, AuthzError> {
        Self::from_code(code).ok_or_else(|| AuthzError::UnsupportedMethod(code.to_string()))
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HttpMethod::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| AuthzError::UnsupportedMethod(s.to_string()))
    }
}

pub const PTYPE_POLICY: &str = "p";
pub const PTYPE_GROUPING: &str = "g";

/// Reserved object granting every path.
pub const GLOBAL_WILDCARD: &str = "/*";

/// Policy triple: `subject` is a role name or a stringified user id,
/// `object` an Api path pattern, `action` a method string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyRule {
    pub subject: String,
    pub object: String,
    pub action: String,
}

impl PolicyRule {
    pub fn new(
        subject: impl Into<String>,
        object: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            object: object.into(),
            action: action.into(),
        }
    }

    pub fn values(&self) -> [&str; 3] {
        [&self.subject, &self.object, &self.action]
    }
}

/// Grouping tuple: user (stringified id) is a member of role (name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupingRule {
    pub user: String,
    pub role: String,
}

impl GroupingRule {
    pub fn new(user: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            role: role.into(),
        }
    }

    pub fn values(&self) -> [&str; 2] {
        [&self.user, &self.role]
    }
}

/// Subject string used for a user inside triples and tuples.
pub fn user_subject(user_id: i64) -> String {
    user_id.to_string()
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
}

impl Decision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

// ---------- API request/response types ----------

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub principal_id: i64,
    /// e.g. "/api/reports/123"
    pub path: String,
    /// e.g. "GET"
    pub method: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResponse {
    pub allowed: bool,
    pub message: String,
}

impl From<Decision> for CheckResponse {
    fn from(d: Decision) -> Self {
        Self {
            allowed: d.allowed,
            message: d.reason,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PermissionsResponse {
    pub principal_id: i64,
    pub roles: Vec<String>,
    pub permissions: Vec<PolicyRule>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublicApi {
    pub path: String,
    pub method: String,
}
