//! Shared cryptographic building blocks for the identity core.
//!
//! Currently hosts the token service ([`jwt`]); password hashing and one-time
//! codes live next to the identity service that owns their policy.

pub mod jwt;

pub use jwt::{Claims, JwtConfig, JwtError, JwtService, TokenKind, TokenPair, TokenSubject};
