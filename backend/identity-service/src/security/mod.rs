/// Security module for authentication primitives
///
/// Provides core security primitives for identity-service:
/// - Password hashing, verification and policy (Argon2id or bcrypt)
/// - JWT token generation and validation (HS256 via crypto-core)
/// - Two-factor authentication (TOTP) and backup codes
///
/// Token revocation markers live with sessions in `services::session`.
// Re-export JWT functionality from shared crypto-core library
pub use crypto_core::jwt;
pub use crypto_core::jwt::{Claims, JwtConfig, JwtService, TokenKind, TokenPair, TokenSubject};

pub mod password;
pub mod totp;

pub use password::{
    generate_secure_password, secure_compare, validate_password, Argon2Settings,
    CredentialHasher, HashAlgorithm,
};
pub use totp::TotpService;
