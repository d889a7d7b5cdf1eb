/// Authorization
///
/// - `engine`: role defaults, per-principal overrides and clearance checks
/// - `gate`: request-level checks built on the engine and the identity service
pub mod engine;
pub mod gate;

pub use engine::{resource_from_id, AccessRule, AuthorizationEngine, RolePermissionTable};
pub use gate::{bearer_token, AccessGate, AuthContext, Denial, DenyReason};
