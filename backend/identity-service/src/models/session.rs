use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::user::Principal;

/// Session record stored in the expiring store under `session:{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: Uuid,
    pub email: String,
    pub role: String,
    pub security_clearance: String,
    /// Flattened `resource:action` snapshot taken at login
    pub permissions: Vec<String>,
    pub login_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub mfa_verified: bool,
}

impl SessionRecord {
    pub fn for_principal(
        session_id: String,
        principal: &Principal,
        permissions: Vec<String>,
        metadata: &RequestMetadata,
        mfa_verified: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            user_id: principal.id,
            email: principal.email.clone(),
            role: principal.role.to_string(),
            security_clearance: principal.security_clearance.to_string(),
            permissions,
            login_time: now,
            last_activity: now,
            ip_address: metadata.ip_address.clone(),
            user_agent: metadata.user_agent.clone(),
            mfa_verified,
        }
    }
}

/// Aggregate view over live sessions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub sessions_by_user: HashMap<Uuid, usize>,
}

/// Per-request facts threaded explicitly into session and audit calls
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub request_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestMetadata {
    pub fn new(
        request_id: impl Into<String>,
        ip_address: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            request_id: Some(request_id.into()),
            ip_address: Some(ip_address.into()),
            user_agent: Some(user_agent.into()),
        }
    }
}
