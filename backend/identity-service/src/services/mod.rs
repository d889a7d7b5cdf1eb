/// Service layer for identity-service
///
/// - Identity orchestration (registration, login, refresh, logout, MFA)
/// - Session records and token revocation over the expiring store
/// - Authentication event channel for the audit collaborator
pub mod audit;
pub mod identity;
pub mod session;

pub use audit::{AuditReceiver, AuditSink, AuthEvent, AuthEventKind, Backpressure};
pub use identity::{AuthOutcome, AuthenticatedSession, IdentityService, MfaSetup, SecondFactor};
pub use session::SessionStore;
