use crypto_core::jwt::JwtError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IdentityError>;

/// Failure of an external collaborator (user store or expiring store)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out")]
    Timeout,

    #[error("store write conflict: {0}")]
    Conflict(String),

    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
}

/// Which password composition rule was violated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PasswordPolicyViolation {
    #[error("password must be at least {min} characters")]
    TooShort { min: usize },

    #[error("password must be at most {max} characters")]
    TooLong { max: usize },

    #[error("password must contain at least one uppercase letter")]
    MissingUppercase,

    #[error("password must contain at least one lowercase letter")]
    MissingLowercase,

    #[error("password must contain at least one digit")]
    MissingDigit,

    #[error("password must contain at least one symbol")]
    MissingSymbol,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    // Input validation
    #[error("Password too weak: {0}")]
    WeakPassword(#[from] PasswordPolicyViolation),

    #[error("Invalid code length: expected {expected} digits, got {actual}")]
    InvalidCodeLength { expected: usize, actual: usize },

    #[error("Validation error: {0}")]
    Validation(String),

    // Credentials
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("User is inactive")]
    UserInactive,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token revoked")]
    TokenRevoked,

    #[error("Invalid two FA code")]
    InvalidTwoFACode,

    #[error("Two FA not enabled")]
    TwoFANotEnabled,

    #[error("Email already exists")]
    EmailAlreadyExists,

    #[error("User not found")]
    UserNotFound,

    #[error("Session not found")]
    SessionNotFound,

    // Authorization
    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Insufficient permissions: {action} on {resource}")]
    InsufficientPermissions { resource: String, action: String },

    #[error("Insufficient clearance: requires {required}, has {actual}")]
    InsufficientClearance { required: String, actual: String },

    #[error("No authenticated principal")]
    MissingPrincipal,

    // Collaborators
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IdentityError {
    /// Errors that indicate broken configuration rather than a bad request
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, IdentityError::UnknownRole(_))
    }

    /// Credential-class failures (who is calling), as opposed to what they may do
    pub fn is_credential_error(&self) -> bool {
        matches!(
            self,
            IdentityError::InvalidCredentials
                | IdentityError::UserInactive
                | IdentityError::InvalidToken
                | IdentityError::TokenExpired
                | IdentityError::TokenRevoked
                | IdentityError::InvalidTwoFACode
                | IdentityError::MissingPrincipal
                | IdentityError::SessionNotFound
        )
    }

    pub fn is_store_error(&self) -> bool {
        matches!(self, IdentityError::Store(_))
    }

    /// A guarded write lost against a concurrent change; retrying may succeed
    pub fn is_conflict(&self) -> bool {
        matches!(self, IdentityError::Store(StoreError::Conflict(_)))
    }

    /// Stable snake_case label for metrics and audit events
    pub fn code(&self) -> &'static str {
        match self {
            IdentityError::WeakPassword(_) => "weak_password",
            IdentityError::InvalidCodeLength { .. } => "invalid_code_length",
            IdentityError::Validation(_) => "validation",
            IdentityError::InvalidCredentials => "invalid_credentials",
            IdentityError::UserInactive => "user_inactive",
            IdentityError::InvalidToken => "invalid_token",
            IdentityError::TokenExpired => "token_expired",
            IdentityError::TokenRevoked => "token_revoked",
            IdentityError::InvalidTwoFACode => "invalid_second_factor",
            IdentityError::TwoFANotEnabled => "second_factor_not_enabled",
            IdentityError::EmailAlreadyExists => "email_already_exists",
            IdentityError::UserNotFound => "user_not_found",
            IdentityError::SessionNotFound => "session_not_found",
            IdentityError::UnknownRole(_) => "unknown_role",
            IdentityError::InsufficientPermissions { .. } => "insufficient_permissions",
            IdentityError::InsufficientClearance { .. } => "insufficient_clearance",
            IdentityError::MissingPrincipal => "missing_principal",
            IdentityError::Store(StoreError::Timeout) => "store_timeout",
            IdentityError::Store(StoreError::Conflict(_)) => "store_conflict",
            IdentityError::Store(_) => "store_unavailable",
            IdentityError::Internal(_) => "internal",
        }
    }
}

// Conversions from external error types
impl From<sqlx::Error> for IdentityError {
    fn from(err: sqlx::Error) -> Self {
        let store = match &err {
            sqlx::Error::PoolTimedOut => StoreError::Timeout,
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(err.to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        };
        tracing::error!(error = %err, "Database error");
        IdentityError::Store(store)
    }
}

impl From<redis::RedisError> for IdentityError {
    fn from(err: redis::RedisError) -> Self {
        let store = if err.is_timeout() {
            StoreError::Timeout
        } else if err.kind() == redis::ErrorKind::TypeError {
            StoreError::Corrupt(err.to_string())
        } else {
            StoreError::Unavailable(err.to_string())
        };
        tracing::error!(error = %err, "Redis error");
        IdentityError::Store(store)
    }
}

impl From<JwtError> for IdentityError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::Expired => IdentityError::TokenExpired,
            JwtError::NotYetValid
            | JwtError::IssuedInFuture
            | JwtError::WrongKind { .. }
            | JwtError::Invalid(_) => IdentityError::InvalidToken,
            JwtError::Signing(msg) | JwtError::Config(msg) => {
                tracing::error!(error = %msg, "JWT error");
                IdentityError::Internal(msg)
            }
        }
    }
}

impl From<serde_json::Error> for IdentityError {
    fn from(err: serde_json::Error) -> Self {
        IdentityError::Store(StoreError::Corrupt(err.to_string()))
    }
}

impl From<validator::ValidationErrors> for IdentityError {
    fn from(err: validator::ValidationErrors) -> Self {
        IdentityError::Validation(err.to_string())
    }
}
