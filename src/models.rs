//! Wire and domain types. Field names follow the aggregator's camelCase JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// Authentication
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// The aggregator sends a single `role` string; [`User::normalized`]
    /// folds it into `roles` so authorization checks have one shape.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<String>,
}

impl User {
    /// Collapse the wire-level `role` into the `roles` list, defaulting to
    /// `user` when the aggregator sent neither.
    pub fn normalized(mut self) -> Self {
        if self.roles.is_empty() {
            let role = self.role.take().unwrap_or_else(|| "user".to_string());
            self.roles = vec![role];
        }
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub token_type: String,
}

/// In-memory session state. Invariants: `is_authenticated` holds exactly when
/// `tokens` is present and not expired, and `user` is present exactly when
/// `is_authenticated`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    pub user: Option<User>,
    pub tokens: Option<AuthTokens>,
    pub is_authenticated: bool,
    pub is_loading: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginCredentials {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totp_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_code: Option<String>,
}

impl LoginCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            remember_me: false,
            totp_code: None,
            recovery_code: None,
        }
    }
}

/// Outcome of a login attempt. A second-factor challenge is a distinct
/// outcome, not a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    Success,
    SecondFactorRequired { temp_token: Option<String> },
    Failed { message: String },
}

impl LoginOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, LoginOutcome::Success)
    }
}

/// Wire shape of `POST /auth/login` responses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub user: Option<User>,
    pub tokens: Option<AuthTokens>,
    #[serde(default, rename = "requiresTOTP")]
    pub requires_totp: bool,
    #[serde(default)]
    pub temp_token: Option<String>,
}

/// Partial profile mutation; unset fields are left untouched server-side.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

// ============================================================================
// Fleet state
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub state: String,
    #[serde(default)]
    pub created: i64,
    pub host_id: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub health: String,
    #[serde(default)]
    pub networks: HashMap<String, String>,
    #[serde(default)]
    pub volumes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortMapping {
    pub private: u16,
    #[serde(default)]
    pub public: u16,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub id: String,
    pub name: String,
    pub host_id: String,
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub container_count: u32,
    #[serde(default)]
    pub running_count: u32,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_percent: f64,
    #[serde(default)]
    pub memory_used: u64,
    #[serde(default)]
    pub memory_total: u64,
    pub online: bool,
    #[serde(default)]
    pub disks: Vec<DiskInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskInfo {
    pub mount_point: String,
    pub device: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

// ============================================================================
// Image updates and bulk operations
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageUpdate {
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    pub host_id: String,
    #[serde(default)]
    pub current_digest: String,
    #[serde(default)]
    pub latest_digest: Option<String>,
    #[serde(default)]
    pub current_tag: String,
    #[serde(default)]
    pub latest_tag: Option<String>,
    pub has_update: bool,
    #[serde(default)]
    pub checked_at: i64,
}

/// Server acknowledgement for a single container update trigger.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateAck {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpdateItem {
    pub container_id: String,
    pub container_name: String,
    pub host_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated result of one bulk update. Invariants: `matched == results.len()`
/// when not a dry run, and `updated + failed == matched`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpdateReport {
    pub matched: usize,
    pub updated: usize,
    pub failed: usize,
    pub results: Vec<BulkUpdateItem>,
}

/// Lifecycle actions accepted by `POST /containers/{host}/{id}/{action}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
    Start,
    Stop,
    Restart,
}

impl ContainerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerAction::Start => "start",
            ContainerAction::Stop => "stop",
            ContainerAction::Restart => "restart",
        }
    }
}
