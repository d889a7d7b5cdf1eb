use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

/// Organizational role, the key into the role permission table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Analyst,
    Manager,
    Consultant,
    Viewer,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Admin,
        Role::Analyst,
        Role::Manager,
        Role::Consultant,
        Role::Viewer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Analyst => "analyst",
            Role::Manager => "manager",
            Role::Consultant => "consultant",
            Role::Viewer => "viewer",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "analyst" => Ok(Role::Analyst),
            "manager" => Ok(Role::Manager),
            "consultant" => Ok(Role::Consultant),
            "viewer" => Ok(Role::Viewer),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Security clearance, totally ordered from `Public` up to `TopSecret`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityClearance {
    Public,
    Internal,
    Confidential,
    Secret,
    TopSecret,
}

impl SecurityClearance {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityClearance::Public => "public",
            SecurityClearance::Internal => "internal",
            SecurityClearance::Confidential => "confidential",
            SecurityClearance::Secret => "secret",
            SecurityClearance::TopSecret => "top_secret",
        }
    }

    /// True when this level is at least `required`
    pub fn satisfies(&self, required: SecurityClearance) -> bool {
        *self >= required
    }
}

impl FromStr for SecurityClearance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "public" => Ok(SecurityClearance::Public),
            "internal" => Ok(SecurityClearance::Internal),
            "confidential" => Ok(SecurityClearance::Confidential),
            "secret" => Ok(SecurityClearance::Secret),
            "top_secret" | "topsecret" => Ok(SecurityClearance::TopSecret),
            other => Err(format!("unknown security clearance '{other}'")),
        }
    }
}

impl fmt::Display for SecurityClearance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protected resource families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Documents,
    Consultations,
    Users,
    Knowledge,
    Audit,
    System,
}

impl Resource {
    pub const ALL: [Resource; 6] = [
        Resource::Documents,
        Resource::Consultations,
        Resource::Users,
        Resource::Knowledge,
        Resource::Audit,
        Resource::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Documents => "documents",
            Resource::Consultations => "consultations",
            Resource::Users => "users",
            Resource::Knowledge => "knowledge",
            Resource::Audit => "audit",
            Resource::System => "system",
        }
    }
}

impl FromStr for Resource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resource::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown resource '{s}'"))
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Write,
    Delete,
    Admin,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::Read, Action::Write, Action::Delete, Action::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Delete => "delete",
            Action::Admin => "admin",
        }
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown action '{s}'"))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit per-principal permission override
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub resource: Resource,
    pub actions: BTreeSet<Action>,
}

impl PermissionGrant {
    pub fn new(resource: Resource, actions: impl IntoIterator<Item = Action>) -> Self {
        Self {
            resource,
            actions: actions.into_iter().collect(),
        }
    }

    pub fn allows(&self, resource: Resource, action: Action) -> bool {
        self.resource == resource && self.actions.contains(&action)
    }
}

/// Principal - the authenticated identity
///
/// Never physically deleted here; `is_active = false` is the terminal state.
#[derive(Clone, Serialize)]
pub struct Principal {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub department: String,
    pub role: Role,
    pub security_clearance: SecurityClearance,
    pub is_active: bool,
    #[serde(skip_serializing)]
    pub password_hash: String,
    #[serde(skip_serializing)]
    pub totp_secret: Option<String>,
    pub totp_enabled: bool,
    pub permissions: Vec<PermissionGrant>,
    #[serde(skip_serializing)]
    pub backup_code_hashes: Vec<String>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Principal")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("role", &self.role)
            .field("security_clearance", &self.security_clearance)
            .field("is_active", &self.is_active)
            .field("totp_enabled", &self.totp_enabled)
            .finish_non_exhaustive()
    }
}

impl Principal {
    /// Build a fresh, active principal from a validated registration
    pub fn new(registration: &NewPrincipal, password_hash: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email: normalize_email(&registration.email),
            name: registration.name.trim().to_string(),
            department: registration.department.trim().to_string(),
            role: registration.role,
            security_clearance: registration.security_clearance,
            is_active: true,
            password_hash,
            totp_secret: None,
            totp_enabled: false,
            permissions: registration.permissions.clone(),
            backup_code_hashes: Vec::new(),
            last_login_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Second factor is mandatory for this principal
    pub fn has_totp_enabled(&self) -> bool {
        self.totp_enabled && self.totp_secret.is_some()
    }

    /// True when an explicit override grants `action` on `resource`
    pub fn override_allows(&self, resource: Resource, action: Action) -> bool {
        self.permissions.iter().any(|g| g.allows(resource, action))
    }

    /// Advance `updated_at`, strictly and at microsecond resolution, so it
    /// can serve as the write guard
    pub fn touch(&mut self) {
        let next = self.updated_at + chrono::Duration::microseconds(1);
        self.updated_at = Utc::now().max(next);
    }
}

/// Registration input
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewPrincipal {
    #[validate(
        email,
        length(max = 254),
        custom(function = "crate::validators::validate_email_shape")
    )]
    pub email: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(min = 1, max = 255))]
    pub department: String,
    pub role: Role,
    pub security_clearance: SecurityClearance,
    #[serde(default)]
    pub permissions: Vec<PermissionGrant>,
}

/// Emails are unique case-insensitively
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
