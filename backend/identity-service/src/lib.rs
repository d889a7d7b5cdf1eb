/// Identity & Access Control Core
///
/// Proves who a caller is, issues and revokes credentials, enforces a second
/// factor, and decides what an authenticated principal may do.
///
/// ## Modules
///
/// - `authz`: Authorization engine and request gates
/// - `config`: Environment-driven settings
/// - `db`: Principal store (PostgreSQL and in-memory)
/// - `error`: Error types
/// - `metrics`: Prometheus counters
/// - `models`: Principals, roles, clearances, sessions
/// - `security`: Password hashing, TOTP, JWT
/// - `services`: Identity orchestration, sessions, audit events
/// - `store`: Expiring key-value store (Redis and in-memory)
/// - `validators`: Input validation
pub mod authz;
pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod models;
pub mod security;
pub mod services;
pub mod store;
pub mod validators;

// Re-export commonly used types
pub use authz::{AccessGate, AuthorizationEngine, Denial, DenyReason};
pub use error::{IdentityError, Result};
pub use services::{AuthOutcome, IdentityService};
