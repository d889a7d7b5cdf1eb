/// Password hashing, verification and policy
///
/// Two strategies share one self-describing encoding so stored hashes keep
/// verifying after the configured strategy changes:
///
/// - **Argon2id**: PHC string (`$argon2id$v=19$m=..,t=..,p=..$salt$hash`)
/// - **bcrypt**: modular crypt string (`$2b$12$...`)
use crate::error::{IdentityError, PasswordPolicyViolation, Result};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::{rngs::OsRng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

pub const MIN_PASSWORD_LENGTH: usize = 8;
pub const MAX_PASSWORD_LENGTH: usize = 128;

/// Accepted symbol class for password composition
pub const PASSWORD_SYMBOLS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?";

pub const DEFAULT_BCRYPT_COST: u32 = 12;

const LOWERCASE: &str = "abcdefghijklmnopqrstuvwxyz";
const UPPERCASE: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &str = "0123456789";

const MAX_GENERATION_ATTEMPTS: usize = 32;

/// Argon2id tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Argon2Settings {
    pub time_cost: u32,
    pub memory_kib: u32,
    pub parallelism: u32,
    pub output_len: usize,
    pub salt_len: usize,
}

impl Default for Argon2Settings {
    fn default() -> Self {
        Self {
            time_cost: 1,
            memory_kib: 64 * 1024,
            parallelism: 4,
            output_len: 32,
            salt_len: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Argon2id(Argon2Settings),
    Bcrypt { cost: u32 },
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::Argon2id(Argon2Settings::default())
    }
}

/// Credential hasher
///
/// `hash` applies no password policy; call [`validate_password`] first for
/// user-chosen passwords.
#[derive(Debug, Clone)]
pub struct CredentialHasher {
    algorithm: HashAlgorithm,
}

impl Default for CredentialHasher {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::default(),
        }
    }
}

impl CredentialHasher {
    /// Build a hasher, rejecting parameter sets the primitives would refuse
    pub fn new(algorithm: HashAlgorithm) -> Result<Self> {
        match algorithm {
            HashAlgorithm::Argon2id(settings) => {
                argon2_params(&settings)?;
                // SaltString holds at most 64 base64 chars
                if !(8..=48).contains(&settings.salt_len) {
                    return Err(IdentityError::Validation(format!(
                        "argon2 salt length must be within 8..=48 bytes, got {}",
                        settings.salt_len
                    )));
                }
            }
            HashAlgorithm::Bcrypt { cost } => {
                if !(4..=31).contains(&cost) {
                    return Err(IdentityError::Validation(format!(
                        "bcrypt cost must be within 4..=31, got {cost}"
                    )));
                }
            }
        }
        Ok(Self { algorithm })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hash a plaintext with a fresh random salt
    pub fn hash(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Err(IdentityError::Validation(
                "cannot hash an empty credential".to_string(),
            ));
        }

        match self.algorithm {
            HashAlgorithm::Argon2id(settings) => {
                let argon2 = Argon2::new(
                    Algorithm::Argon2id,
                    Version::V0x13,
                    argon2_params(&settings)?,
                );
                let salt = SaltString::encode_b64(&generate_salt(settings.salt_len))
                    .map_err(|e| IdentityError::Internal(format!("Salt encoding failed: {e}")))?;

                argon2
                    .hash_password(plaintext.as_bytes(), &salt)
                    .map(|hash| hash.to_string())
                    .map_err(|e| IdentityError::Internal(format!("Password hashing failed: {e}")))
            }
            HashAlgorithm::Bcrypt { cost } => bcrypt::hash(plaintext, cost)
                .map_err(|e| IdentityError::Internal(format!("Password hashing failed: {e}"))),
        }
    }

    /// Verify a plaintext against any supported encoded hash
    ///
    /// The algorithm is taken from the encoded string, not from this hasher's
    /// configuration. Digest comparison is constant time in both primitives.
    pub fn verify(&self, plaintext: &str, encoded: &str) -> Result<bool> {
        if is_bcrypt_hash(encoded) {
            return bcrypt::verify(plaintext, encoded).map_err(|e| {
                IdentityError::Internal(format!("Invalid password hash format: {e}"))
            });
        }

        let parsed_hash = PasswordHash::new(encoded)
            .map_err(|e| IdentityError::Internal(format!("Invalid password hash format: {e}")))?;

        match Argon2::default().verify_password(plaintext.as_bytes(), &parsed_hash) {
            Ok(_) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(IdentityError::Internal(format!(
                "Password verification failed: {e}"
            ))),
        }
    }

    /// True when `encoded` was produced with different settings than ours
    pub fn needs_rehash(&self, encoded: &str) -> bool {
        match self.algorithm {
            HashAlgorithm::Bcrypt { cost } => {
                !is_bcrypt_hash(encoded) || bcrypt_cost(encoded) != Some(cost)
            }
            HashAlgorithm::Argon2id(settings) => match PasswordHash::new(encoded) {
                Ok(hash) => match Params::try_from(&hash) {
                    Ok(params) => {
                        hash.algorithm.as_str() != "argon2id"
                            || params.m_cost() != settings.memory_kib
                            || params.t_cost() != settings.time_cost
                            || params.p_cost() != settings.parallelism
                    }
                    Err(_) => true,
                },
                Err(_) => true,
            },
        }
    }
}

fn argon2_params(settings: &Argon2Settings) -> Result<Params> {
    Params::new(
        settings.memory_kib,
        settings.time_cost,
        settings.parallelism,
        Some(settings.output_len),
    )
    .map_err(|e| IdentityError::Validation(format!("invalid argon2 parameters: {e}")))
}

fn is_bcrypt_hash(encoded: &str) -> bool {
    ["$2a$", "$2b$", "$2x$", "$2y$"]
        .iter()
        .any(|prefix| encoded.starts_with(prefix))
}

fn bcrypt_cost(encoded: &str) -> Option<u32> {
    encoded.get(4..6).and_then(|cost| cost.parse().ok())
}

/// Validate password composition
///
/// ## Requirements
///
/// - Between 8 and 128 characters
/// - At least one uppercase letter
/// - At least one lowercase letter
/// - At least one digit
/// - At least one symbol from [`PASSWORD_SYMBOLS`]
pub fn validate_password(password: &str) -> Result<()> {
    let length = password.chars().count();
    if length < MIN_PASSWORD_LENGTH {
        return Err(PasswordPolicyViolation::TooShort {
            min: MIN_PASSWORD_LENGTH,
        }
        .into());
    }
    if length > MAX_PASSWORD_LENGTH {
        return Err(PasswordPolicyViolation::TooLong {
            max: MAX_PASSWORD_LENGTH,
        }
        .into());
    }

    if !password.chars().any(|c| c.is_uppercase()) {
        return Err(PasswordPolicyViolation::MissingUppercase.into());
    }
    if !password.chars().any(|c| c.is_lowercase()) {
        return Err(PasswordPolicyViolation::MissingLowercase.into());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(PasswordPolicyViolation::MissingDigit.into());
    }
    if !password.chars().any(|c| PASSWORD_SYMBOLS.contains(c)) {
        return Err(PasswordPolicyViolation::MissingSymbol.into());
    }

    Ok(())
}

/// Generate a random password that satisfies [`validate_password`]
///
/// `length` is clamped to the policy bounds.
pub fn generate_secure_password(length: usize) -> Result<String> {
    let length = length.clamp(MIN_PASSWORD_LENGTH, MAX_PASSWORD_LENGTH);
    let alphabet: Vec<char> = [UPPERCASE, LOWERCASE, DIGITS, PASSWORD_SYMBOLS]
        .concat()
        .chars()
        .collect();

    for _ in 0..MAX_GENERATION_ATTEMPTS {
        let candidate: String = (0..length)
            .map(|_| alphabet[OsRng.gen_range(0..alphabet.len())])
            .collect();

        if validate_password(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    Err(IdentityError::Internal(format!(
        "failed to generate a compliant password in {MAX_GENERATION_ATTEMPTS} attempts"
    )))
}

/// Random salt bytes from the OS CSPRNG
pub fn generate_salt(length: usize) -> Vec<u8> {
    let mut salt = vec![0u8; length];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Uniform random integer in `0..max`
pub fn secure_random_int(max: u64) -> Result<u64> {
    if max == 0 {
        return Err(IdentityError::Validation(
            "random bound must be positive".to_string(),
        ));
    }
    Ok(OsRng.gen_range(0..max))
}

/// Constant-time string equality
pub fn secure_compare(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
