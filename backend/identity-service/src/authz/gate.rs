/// Request gates
///
/// Transport-agnostic checks for request handlers. Each gate either allows
/// the request or returns a [`Denial`]; mapping denials onto a transport
/// (status codes, headers) is the caller's business.
use super::AuthorizationEngine;
use crate::error::IdentityError;
use crate::metrics;
use crate::models::{Action, Principal, Resource, Role, SecurityClearance, SessionRecord};
use crate::security::Claims;
use crate::services::IdentityService;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    MissingToken,
    InvalidToken,
    TokenExpired,
    TokenRevoked,
    UserInactive,
    InsufficientRole,
    InsufficientPermissions,
    InsufficientClearance,
    UnknownRole,
    StoreUnavailable,
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::MissingToken => "missing_token",
            DenyReason::InvalidToken => "invalid_token",
            DenyReason::TokenExpired => "token_expired",
            DenyReason::TokenRevoked => "token_revoked",
            DenyReason::UserInactive => "user_inactive",
            DenyReason::InsufficientRole => "insufficient_role",
            DenyReason::InsufficientPermissions => "insufficient_permissions",
            DenyReason::InsufficientClearance => "insufficient_clearance",
            DenyReason::UnknownRole => "unknown_role",
            DenyReason::StoreUnavailable => "store_unavailable",
        }
    }

    /// Who-is-calling failures (401-class) as opposed to what-may-they-do
    /// failures (403-class)
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            DenyReason::MissingToken
                | DenyReason::InvalidToken
                | DenyReason::TokenExpired
                | DenyReason::TokenRevoked
                | DenyReason::UserInactive
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub reason: DenyReason,
    pub message: String,
}

impl Denial {
    fn new(reason: DenyReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        self.reason.code()
    }

    pub fn is_authentication_failure(&self) -> bool {
        self.reason.is_authentication_failure()
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason.code(), self.message)
    }
}

impl std::error::Error for Denial {}

impl From<IdentityError> for Denial {
    fn from(err: IdentityError) -> Self {
        let reason = match &err {
            IdentityError::TokenExpired => DenyReason::TokenExpired,
            IdentityError::TokenRevoked => DenyReason::TokenRevoked,
            IdentityError::UserInactive => DenyReason::UserInactive,
            IdentityError::InsufficientPermissions { .. } => DenyReason::InsufficientPermissions,
            IdentityError::InsufficientClearance { .. } => DenyReason::InsufficientClearance,
            IdentityError::UnknownRole(_) => DenyReason::UnknownRole,
            IdentityError::MissingPrincipal => DenyReason::MissingToken,
            IdentityError::Store(_) | IdentityError::Internal(_) => DenyReason::StoreUnavailable,
            _ => DenyReason::InvalidToken,
        };
        Denial::new(reason, err.to_string())
    }
}

/// Resolved caller for the rest of the request
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub principal: Principal,
    pub claims: Claims,
    /// Present when a live session owned by the principal was supplied
    pub session: Option<SessionRecord>,
}

/// Pull the token out of an `Authorization: Bearer <token>` value
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[derive(Clone)]
pub struct AccessGate {
    identity: Arc<IdentityService>,
    authz: Arc<AuthorizationEngine>,
}

impl AccessGate {
    pub fn new(identity: Arc<IdentityService>) -> Self {
        let authz = identity.authz().clone();
        Self { identity, authz }
    }

    /// Authenticate the caller
    ///
    /// `authorization` is the raw header value. A supplied session id gets a
    /// heartbeat; a missing or foreign session does not fail the request.
    pub async fn require_auth(
        &self,
        authorization: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<AuthContext, Denial> {
        let Some(token) = authorization.and_then(bearer_token) else {
            return Err(self.deny(Denial::new(
                DenyReason::MissingToken,
                "missing bearer token",
            )));
        };

        let (principal, claims) = self
            .identity
            .validate_access_token(token)
            .await
            .map_err(|e| self.deny(e.into()))?;

        let session = match session_id {
            Some(session_id) => self.heartbeat(&principal, session_id).await,
            None => None,
        };

        metrics::record_authz_decision("authenticated");
        Ok(AuthContext {
            principal,
            claims,
            session,
        })
    }

    /// Resolve the caller when a usable token is present
    ///
    /// Anonymous requests and unusable tokens yield `Ok(None)`. A store
    /// outage is still a denial, so an outage never downgrades an
    /// authenticated caller to anonymous silently.
    pub async fn optional_auth(
        &self,
        authorization: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<Option<AuthContext>, Denial> {
        if authorization.and_then(bearer_token).is_none() {
            return Ok(None);
        }

        match self.require_auth(authorization, session_id).await {
            Ok(ctx) => Ok(Some(ctx)),
            Err(denial) if denial.reason == DenyReason::StoreUnavailable => Err(denial),
            Err(denial) => {
                debug!(reason = denial.code(), "Continuing anonymously");
                Ok(None)
            }
        }
    }

    async fn heartbeat(&self, principal: &Principal, session_id: &str) -> Option<SessionRecord> {
        match self.identity.sessions().update_last_activity(session_id).await {
            Ok(record) if record.user_id == principal.id => Some(record),
            Ok(_) => {
                warn!(user_id = %principal.id, "Session belongs to another principal");
                None
            }
            Err(e) => {
                debug!(user_id = %principal.id, error = %e, "Session heartbeat skipped");
                None
            }
        }
    }

    pub fn require_role(&self, ctx: &AuthContext, allowed: &[Role]) -> Result<(), Denial> {
        if allowed.contains(&ctx.principal.role) {
            return self.allow();
        }
        Err(self.deny(Denial::new(
            DenyReason::InsufficientRole,
            format!("role {} is not permitted", ctx.principal.role),
        )))
    }

    pub fn require_permission(
        &self,
        ctx: &AuthContext,
        resource: Resource,
        action: Action,
    ) -> Result<(), Denial> {
        self.authz
            .require(Some(&ctx.principal), resource, action)
            .map_err(|e| self.deny(e.into()))?;
        self.allow()
    }

    pub fn require_clearance(
        &self,
        ctx: &AuthContext,
        required: SecurityClearance,
    ) -> Result<(), Denial> {
        if ctx.principal.security_clearance.satisfies(required) {
            return self.allow();
        }
        Err(self.deny(
            IdentityError::InsufficientClearance {
                required: required.to_string(),
                actual: ctx.principal.security_clearance.to_string(),
            }
            .into(),
        ))
    }

    /// Permission first, then clearance
    pub fn require_permission_with_clearance(
        &self,
        ctx: &AuthContext,
        resource: Resource,
        action: Action,
        required: SecurityClearance,
    ) -> Result<(), Denial> {
        match self
            .authz
            .authorize_with_clearance(Some(&ctx.principal), resource, action, Some(required))
        {
            Ok(true) => self.allow(),
            Ok(false) => Err(self.deny(
                IdentityError::InsufficientPermissions {
                    resource: resource.to_string(),
                    action: action.to_string(),
                }
                .into(),
            )),
            Err(e) => Err(self.deny(e.into())),
        }
    }

    fn allow(&self) -> Result<(), Denial> {
        metrics::record_authz_decision("allow");
        Ok(())
    }

    fn deny(&self, denial: Denial) -> Denial {
        metrics::record_authz_decision(denial.code());
        if denial.reason == DenyReason::UnknownRole {
            warn!(message = %denial.message, "Role missing from permission table");
        } else {
            debug!(reason = denial.code(), "Request denied");
        }
        denial
    }
}
