/// Data models for identity and authorization
pub mod session;
pub mod user;

pub use session::{RequestMetadata, SessionRecord, SessionStats};
pub use user::{
    normalize_email, Action, NewPrincipal, PermissionGrant, Principal, Resource, Role,
    SecurityClearance,
};
