//! Shared fixtures: a fully wired identity service over the in-memory stores
#![allow(dead_code)]

use identity_service::authz::{AccessGate, AuthorizationEngine};
use identity_service::db::{InMemoryUserStore, UserStore};
use identity_service::models::{NewPrincipal, PermissionGrant, RequestMetadata, Role, SecurityClearance};
use identity_service::security::password::{CredentialHasher, HashAlgorithm};
use identity_service::security::{JwtConfig, JwtService};
use identity_service::services::session::{DEFAULT_BLACKLIST_TTL, DEFAULT_SESSION_TTL};
use identity_service::services::{AuditReceiver, AuditSink, Backpressure, IdentityService, SessionStore};
use identity_service::store::InMemoryExpiringStore;
use std::sync::Arc;

pub const PASSWORD: &str = "Abc123!@";

pub struct TestHarness {
    pub identity: Arc<IdentityService>,
    pub gate: AccessGate,
    pub audit: AuditReceiver,
}

pub fn harness() -> TestHarness {
    harness_with_users(Arc::new(InMemoryUserStore::new()))
}

pub fn harness_with_users(users: Arc<dyn UserStore>) -> TestHarness {
    let tokens = JwtService::new(JwtConfig::new(
        "integration-access-secret-0123456789abcdef",
        "integration-refresh-secret-0123456789abcdef",
    ))
    .expect("valid token config");

    let sessions = SessionStore::new(
        Arc::new(InMemoryExpiringStore::new()),
        DEFAULT_SESSION_TTL,
        DEFAULT_BLACKLIST_TTL,
    );
    let (sink, audit) = AuditSink::channel(256, Backpressure::DropOldest);

    let identity = Arc::new(
        IdentityService::new(
            users,
            sessions,
            Arc::new(tokens),
            Arc::new(AuthorizationEngine::default()),
        )
        // Minimum bcrypt cost keeps the suite fast
        .with_hasher(CredentialHasher::new(HashAlgorithm::Bcrypt { cost: 4 }).expect("valid cost"))
        .with_backup_code_count(4)
        .with_audit(sink),
    );

    TestHarness {
        gate: AccessGate::new(identity.clone()),
        identity,
        audit,
    }
}

pub fn registration(email: &str, role: Role, clearance: SecurityClearance) -> NewPrincipal {
    NewPrincipal {
        email: email.to_string(),
        name: "Test Principal".to_string(),
        department: "research".to_string(),
        role,
        security_clearance: clearance,
        permissions: Vec::<PermissionGrant>::new(),
    }
}

pub fn metadata() -> RequestMetadata {
    RequestMetadata::new("req-integration", "192.0.2.10", "integration-tests/1.0")
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}
