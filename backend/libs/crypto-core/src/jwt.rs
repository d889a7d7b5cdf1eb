/// Shared JWT module for the identity core
///
/// Issues and validates the access/refresh token pair handed out on every
/// successful authentication and refresh.
///
/// ## Security Design
///
/// - **Split secrets**: access and refresh tokens are signed with different
///   HS256 secrets, so a refresh token never verifies where an access token is
///   expected (and vice versa), even when both are well-formed and unexpired
/// - **Kind discriminator**: the decoded `token_type` must also match the
///   secret that verified it
/// - **Strict timestamps**: `exp`, `nbf` and `iat` are all enforced
/// - **Unique ids**: every token carries a `jti` drawn from the OS CSPRNG so it
///   can be revoked individually
///
/// ## Usage
///
/// ```rust,no_run
/// use crypto_core::jwt::{JwtConfig, JwtService, TokenSubject};
/// use uuid::Uuid;
///
/// let service = JwtService::new(JwtConfig::new(
///     std::env::var("JWT_ACCESS_SECRET").unwrap(),
///     std::env::var("JWT_REFRESH_SECRET").unwrap(),
/// ))
/// .expect("invalid JWT configuration");
///
/// let subject = TokenSubject {
///     user_id: Uuid::new_v4(),
///     email: "analyst@agency.gov".to_string(),
///     role: "analyst".to_string(),
///     security_clearance: "secret".to_string(),
///     permissions: vec!["documents:read".to_string()],
/// };
/// let pair = service.generate_token_pair(&subject).unwrap();
/// let claims = service.validate_access_token(&pair.access_token).unwrap();
/// assert_eq!(claims.sub, subject.user_id.to_string());
/// ```
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

pub const DEFAULT_ACCESS_TOKEN_TTL_SECS: i64 = 15 * 60;
pub const DEFAULT_REFRESH_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;
pub const DEFAULT_ISSUER: &str = "identity-core";

/// Minimum signing secret length (256 bits)
pub const MIN_SECRET_LENGTH: usize = 32;

const JWT_ALGORITHM: Algorithm = Algorithm::HS256;
const JTI_BYTES: usize = 16;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("token expired")]
    Expired,

    #[error("token not yet valid")]
    NotYetValid,

    #[error("token issued in the future")]
    IssuedInFuture,

    #[error("wrong token kind: expected {expected}, got {actual}")]
    WrongKind { expected: TokenKind, actual: TokenKind },

    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("failed to sign token: {0}")]
    Signing(String),

    #[error("invalid JWT configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, JwtError>;

// ============================================================================
// Data Structures
// ============================================================================

/// Token kind discriminator embedded in every token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JWT claims - registered claims plus identity/authorization facts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (principal ID as UUID string)
    pub sub: String,
    pub email: String,
    pub role: String,
    pub security_clearance: String,
    /// Flattened `resource:action` permission strings
    pub permissions: Vec<String>,
    /// Token type: "access" or "refresh"
    pub token_type: TokenKind,
    /// Unique token identifier (revocation key)
    pub jti: String,
    pub iss: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Not before (Unix timestamp)
    pub nbf: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

impl Claims {
    /// Parse the subject back into a principal ID
    pub fn user_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.sub)
            .map_err(|e| JwtError::Invalid(format!("invalid subject in token: {e}")))
    }

    /// Expiry as a timestamp, for sizing revocation markers
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

/// Identity facts a token pair is minted from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSubject {
    pub user_id: Uuid,
    pub email: String,
    pub role: String,
    pub security_clearance: String,
    pub permissions: Vec<String>,
}

impl TokenSubject {
    /// Re-derive the subject from previously validated claims
    pub fn from_claims(claims: &Claims) -> Result<Self> {
        Ok(Self {
            user_id: claims.user_id()?,
            email: claims.email.clone(),
            role: claims.role.clone(),
            security_clearance: claims.security_clearance.clone(),
            permissions: claims.permissions.clone(),
        })
    }
}

/// Token pair response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token expiry
    pub expires_at: DateTime<Utc>,
}

/// Token service configuration
#[derive(Clone)]
pub struct JwtConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub issuer: String,
    /// Clock skew tolerated on `exp`, `nbf` and `iat`, in seconds
    pub leeway_secs: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            access_secret: String::new(),
            refresh_secret: String::new(),
            access_ttl: Duration::seconds(DEFAULT_ACCESS_TOKEN_TTL_SECS),
            refresh_ttl: Duration::seconds(DEFAULT_REFRESH_TOKEN_TTL_SECS),
            issuer: DEFAULT_ISSUER.to_string(),
            leeway_secs: 5,
        }
    }
}

impl JwtConfig {
    /// Default TTLs and issuer with the given signing secrets
    pub fn new(access_secret: impl Into<String>, refresh_secret: impl Into<String>) -> Self {
        Self {
            access_secret: access_secret.into(),
            refresh_secret: refresh_secret.into(),
            ..Self::default()
        }
    }
}

impl fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtConfig")
            .field("access_secret", &"<redacted>")
            .field("refresh_secret", &"<redacted>")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .field("issuer", &self.issuer)
            .field("leeway_secs", &self.leeway_secs)
            .finish()
    }
}

// ============================================================================
// Key Storage
// ============================================================================

struct KeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl KeyPair {
    fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

/// Token service
///
/// Keys are derived once at construction and immutable thereafter, so a single
/// instance can be shared across request tasks behind an `Arc`.
pub struct JwtService {
    access_keys: KeyPair,
    refresh_keys: KeyPair,
    access_ttl: Duration,
    refresh_ttl: Duration,
    issuer: String,
    leeway_secs: u64,
}

impl fmt::Debug for JwtService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtService")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Initialization
// ============================================================================

impl JwtService {
    /// Build the service from configuration
    ///
    /// ## Errors
    ///
    /// Returns `JwtError::Config` if:
    /// - Either secret is shorter than 32 bytes
    /// - Access and refresh secrets are identical
    /// - A TTL is not positive
    pub fn new(config: JwtConfig) -> Result<Self> {
        for (name, secret) in [
            ("access", &config.access_secret),
            ("refresh", &config.refresh_secret),
        ] {
            if secret.len() < MIN_SECRET_LENGTH {
                return Err(JwtError::Config(format!(
                    "{name} secret must be at least {MIN_SECRET_LENGTH} bytes"
                )));
            }
        }

        if config.access_secret == config.refresh_secret {
            return Err(JwtError::Config(
                "access and refresh secrets must differ".to_string(),
            ));
        }

        if config.access_ttl <= Duration::zero() || config.refresh_ttl <= Duration::zero() {
            return Err(JwtError::Config("token TTLs must be positive".to_string()));
        }

        Ok(Self {
            access_keys: KeyPair::from_secret(&config.access_secret),
            refresh_keys: KeyPair::from_secret(&config.refresh_secret),
            access_ttl: config.access_ttl,
            refresh_ttl: config.refresh_ttl,
            issuer: config.issuer,
            leeway_secs: config.leeway_secs,
        })
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    fn keys(&self, kind: TokenKind) -> &KeyPair {
        match kind {
            TokenKind::Access => &self.access_keys,
            TokenKind::Refresh => &self.refresh_keys,
        }
    }

    fn ttl(&self, kind: TokenKind) -> Duration {
        match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        }
    }

    // ========================================================================
    // Token Generation
    // ========================================================================

    /// Generate both access and refresh tokens for a subject
    pub fn generate_token_pair(&self, subject: &TokenSubject) -> Result<TokenPair> {
        let now = Utc::now();
        let access_token = self.generate_token(subject, TokenKind::Access, now)?;
        let refresh_token = self.generate_token(subject, TokenKind::Refresh, now)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_at: now + self.access_ttl,
        })
    }

    fn generate_token(
        &self,
        subject: &TokenSubject,
        kind: TokenKind,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let claims = Claims {
            sub: subject.user_id.to_string(),
            email: subject.email.clone(),
            role: subject.role.clone(),
            security_clearance: subject.security_clearance.clone(),
            permissions: subject.permissions.clone(),
            token_type: kind,
            jti: generate_jti(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + self.ttl(kind)).timestamp(),
        };

        self.sign(&claims, kind)
    }

    fn sign(&self, claims: &Claims, kind: TokenKind) -> Result<String> {
        encode(&Header::new(JWT_ALGORITHM), claims, &self.keys(kind).encoding)
            .map_err(|e| JwtError::Signing(format!("failed to generate {kind} token: {e}")))
    }

    // ========================================================================
    // Token Validation
    // ========================================================================

    /// Validate an access token and return its claims
    pub fn validate_access_token(&self, token: &str) -> Result<Claims> {
        self.validate_token(token, TokenKind::Access)
    }

    /// Validate a refresh token and return its claims
    pub fn validate_refresh_token(&self, token: &str) -> Result<Claims> {
        self.validate_token(token, TokenKind::Refresh)
    }

    /// Validate and decode a token of the expected kind
    ///
    /// ## Security Guarantees
    ///
    /// - Verifies the HS256 signature with the secret for `expected`
    /// - Checks `exp` and `nbf` (with leeway) and rejects `iat` in the future
    /// - Checks issuer
    /// - Rejects a decoded kind that differs from `expected`
    pub fn validate_token(&self, token: &str, expected: TokenKind) -> Result<Claims> {
        let mut validation = Validation::new(JWT_ALGORITHM);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = self.leeway_secs;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "nbf", "iss", "sub"]);

        let data = decode::<Claims>(token, &self.keys(expected).decoding, &validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => JwtError::Expired,
                ErrorKind::ImmatureSignature => JwtError::NotYetValid,
                _ => JwtError::Invalid(e.to_string()),
            },
        )?;

        let claims = data.claims;
        if claims.token_type != expected {
            return Err(JwtError::WrongKind {
                expected,
                actual: claims.token_type,
            });
        }

        let latest_issue = Utc::now().timestamp() + self.leeway_secs as i64;
        if claims.iat > latest_issue {
            return Err(JwtError::IssuedInFuture);
        }

        Ok(claims)
    }

    /// Revalidate a refresh token and mint a brand-new pair from its claims
    ///
    /// Revoking the presented token's `jti` is the caller's responsibility.
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = self.validate_refresh_token(refresh_token)?;
        let subject = TokenSubject::from_claims(&claims)?;
        self.generate_token_pair(&subject)
    }
}

/// Generate a unique token ID from the OS CSPRNG
pub fn generate_jti() -> String {
    let mut bytes = [0u8; JTI_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

// ============================================================================
// Tests
// ============================================================================
