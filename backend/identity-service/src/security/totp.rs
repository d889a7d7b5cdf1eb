/// Two-Factor Authentication (2FA) using TOTP (Time-based One-Time Password)
///
/// RFC 6238 with HMAC-SHA1, 30 second steps and 6 digit codes; secrets are
/// 20 random bytes in unpadded RFC 4648 base32.
use crate::error::{IdentityError, Result};
use crate::security::password::CredentialHasher;
use base32::Alphabet;
use rand::{rngs::OsRng, RngCore};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;
use totp_lite::{totp_custom, Sha1};

pub const TOTP_DIGITS: usize = 6;
pub const TOTP_STEP_SECS: u64 = 30;
pub const TOTP_SECRET_BYTES: usize = 20;
pub const DEFAULT_BACKUP_CODE_COUNT: usize = 10;
pub const DEFAULT_MFA_ISSUER: &str = "Identity Core";

/// Windows accepted on either side of the current one
const SKEW_STEPS: i64 = 1;

const SECRET_ALPHABET: Alphabet = Alphabet::Rfc4648 { padding: false };

#[derive(Debug, Clone)]
pub struct TotpService {
    issuer: String,
}

impl TotpService {
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Generate a new base32 enrollment secret
    pub fn generate_secret(&self) -> String {
        let mut secret_bytes = [0u8; TOTP_SECRET_BYTES];
        OsRng.fill_bytes(&mut secret_bytes);
        base32::encode(SECRET_ALPHABET, &secret_bytes)
    }

    /// Build the `otpauth://` provisioning URI for QR enrollment
    ///
    /// Format: `otpauth://totp/Issuer:Account?secret=SECRET&issuer=Issuer&...`
    pub fn enrollment_uri(&self, secret: &str, account_label: &str) -> String {
        let issuer = urlencoding::encode(&self.issuer);
        format!(
            "otpauth://totp/{issuer}:{label}?secret={secret}&issuer={issuer}&algorithm=SHA1&digits={TOTP_DIGITS}&period={TOTP_STEP_SECS}",
            label = urlencoding::encode(account_label),
        )
    }

    /// Code for the window containing `unix_time`
    pub fn generate_code_at(&self, secret: &str, unix_time: u64) -> Result<String> {
        let key = decode_secret(secret)?;
        Ok(code_for(&key, unix_time))
    }

    /// Verify a code against the current time
    pub fn validate_code(&self, secret: &str, code: &str) -> Result<bool> {
        self.validate_code_at(secret, code, unix_now()?)
    }

    /// Verify a code at `unix_time`, accepting the previous and next window
    ///
    /// ## Errors
    ///
    /// - `InvalidCodeLength` when `code` is not exactly 6 characters; raised
    ///   before the secret is decoded or any HMAC is computed
    /// - `InvalidTwoFACode` when the stored secret is not valid base32
    pub fn validate_code_at(&self, secret: &str, code: &str, unix_time: u64) -> Result<bool> {
        let length = code.chars().count();
        if length != TOTP_DIGITS {
            return Err(IdentityError::InvalidCodeLength {
                expected: TOTP_DIGITS,
                actual: length,
            });
        }
        if !code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(false);
        }

        let key = decode_secret(secret)?;
        let step = TOTP_STEP_SECS as i64;

        let mut matched = subtle::Choice::from(0u8);
        for offset in -SKEW_STEPS..=SKEW_STEPS {
            let Some(time) = (unix_time as i64).checked_add(offset * step) else {
                continue;
            };
            if time < 0 {
                continue;
            }
            let expected = code_for(&key, time as u64);
            matched |= expected.as_bytes().ct_eq(code.as_bytes());
        }

        Ok(matched.into())
    }

    /// Generate `count` unique backup codes formatted `XXXX-XXXX`
    pub fn generate_backup_codes(&self, count: usize) -> Vec<String> {
        let mut seen = HashSet::with_capacity(count);
        let mut codes = Vec::with_capacity(count);

        while codes.len() < count {
            let code = random_backup_code();
            if seen.insert(code.clone()) {
                codes.push(code);
            }
        }

        codes
    }
}

/// Canonical form of a backup code: uppercase, no dashes or whitespace
pub fn normalize_backup_code(code: &str) -> String {
    code.chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

fn is_backup_code_shape(normalized: &str) -> bool {
    normalized.len() == 8 && normalized.chars().all(|c| c.is_ascii_hexdigit())
}

/// Hash a backup code for storage with the password primitive
pub fn hash_backup_code(hasher: &CredentialHasher, code: &str) -> Result<String> {
    let normalized = normalize_backup_code(code);
    if !is_backup_code_shape(&normalized) {
        return Err(IdentityError::Validation(
            "backup code must be 8 hex digits".to_string(),
        ));
    }
    hasher.hash(&normalized)
}

/// Find which stored hash (if any) a provided backup code matches
///
/// Returns the index so the caller can consume the code.
pub fn verify_backup_code(
    hasher: &CredentialHasher,
    code: &str,
    stored_hashes: &[String],
) -> Result<Option<usize>> {
    let normalized = normalize_backup_code(code);
    if !is_backup_code_shape(&normalized) {
        return Ok(None);
    }

    for (index, stored) in stored_hashes.iter().enumerate() {
        if hasher.verify(&normalized, stored)? {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

fn random_backup_code() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    let high = u16::from_be_bytes([bytes[0], bytes[1]]) ^ u16::from_be_bytes([bytes[4], bytes[5]]);
    let low = u16::from_be_bytes([bytes[2], bytes[3]]) ^ u16::from_be_bytes([bytes[6], bytes[7]]);
    format!("{high:04X}-{low:04X}")
}

fn decode_secret(secret: &str) -> Result<Vec<u8>> {
    let cleaned: String = secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .collect::<String>()
        .to_uppercase();

    base32::decode(SECRET_ALPHABET, &cleaned)
        .filter(|bytes| !bytes.is_empty())
        .ok_or(IdentityError::InvalidTwoFACode)
}

fn code_for(key: &[u8], unix_time: u64) -> String {
    totp_custom::<Sha1>(TOTP_STEP_SECS, TOTP_DIGITS as u32, key, unix_time)
}

fn unix_now() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| IdentityError::Internal("system clock before unix epoch".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::password::{Argon2Settings, HashAlgorithm};

    // RFC 6238 appendix B secret ("12345678901234567890")
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    fn service() -> TotpService {
        TotpService::new("Identity Core")
    }

    fn hasher() -> CredentialHasher {
        CredentialHasher::new(HashAlgorithm::Argon2id(Argon2Settings {
            memory_kib: 8 * 1024,
            ..Argon2Settings::default()
        }))
        .unwrap()
    }

    #[test]
    fn test_rfc6238_vectors() {
        let service = service();
        assert_eq!(service.generate_code_at(RFC_SECRET, 59).unwrap(), "287082");
        assert_eq!(
            service.generate_code_at(RFC_SECRET, 1_111_111_109).unwrap(),
            "081804"
        );
        assert_eq!(
            service.generate_code_at(RFC_SECRET, 1_234_567_890).unwrap(),
            "005924"
        );
    }

    #[test]
    fn test_generate_secret() {
        let service = service();
        let secret = service.generate_secret();
        assert_eq!(secret.len(), 32);
        assert!(secret.chars().all(|c| c.is_ascii_uppercase() || ('2'..='7').contains(&c)));
        assert_ne!(secret, service.generate_secret());
        assert_eq!(decode_secret(&secret).unwrap().len(), TOTP_SECRET_BYTES);
    }

    #[test]
    fn test_enrollment_uri() {
        let uri = service().enrollment_uri(RFC_SECRET, "test@example.com");
        assert!(uri.starts_with("otpauth://totp/Identity%20Core:test%40example.com?"));
        assert!(uri.contains(&format!("secret={RFC_SECRET}")));
        assert!(uri.contains("issuer=Identity%20Core"));
        assert!(uri.contains("digits=6"));
        assert!(uri.contains("period=30"));
    }

    #[test]
    fn test_skew_window() {
        let service = service();
        let secret = service.generate_secret();
        let t = 1_700_000_000;
        let code = service.generate_code_at(&secret, t).unwrap();

        assert!(service.validate_code_at(&secret, &code, t).unwrap());
        assert!(service.validate_code_at(&secret, &code, t + 30).unwrap());
        assert!(service.validate_code_at(&secret, &code, t - 30).unwrap());
        assert!(!service.validate_code_at(&secret, &code, t + 90).unwrap());
        assert!(!service.validate_code_at(&secret, &code, t - 90).unwrap());
    }

    #[test]
    fn test_wrong_length_rejected_before_secret_is_touched() {
        let service = service();
        // The secret is garbage: only the length check can produce this error
        for code in ["", "12345", "1234567", "12345678"] {
            assert!(matches!(
                service.validate_code_at("!!not base32!!", code, 59),
                Err(IdentityError::InvalidCodeLength { expected: 6, .. })
            ));
        }
    }

    #[test]
    fn test_invalid_secret_and_non_numeric_code() {
        let service = service();
        assert!(matches!(
            service.validate_code_at("!!not base32!!", "123456", 59),
            Err(IdentityError::InvalidTwoFACode)
        ));
        assert!(!service.validate_code_at(RFC_SECRET, "28708a", 59).unwrap());
    }

    #[test]
    fn test_early_epoch_does_not_underflow() {
        let service = service();
        let code = service.generate_code_at(RFC_SECRET, 0).unwrap();
        assert!(service.validate_code_at(RFC_SECRET, &code, 0).unwrap());
    }

    #[test]
    fn test_generate_backup_codes() {
        let codes = service().generate_backup_codes(DEFAULT_BACKUP_CODE_COUNT);
        assert_eq!(codes.len(), 10);
        let unique: HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), 10);
        for code in &codes {
            assert_eq!(code.len(), 9);
            assert_eq!(&code[4..5], "-");
            assert!(code
                .chars()
                .filter(|c| *c != '-')
                .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
        }
    }

    #[test]
    fn test_backup_code_hash_and_verify() {
        let hasher = hasher();
        let codes = service().generate_backup_codes(3);
        let stored: Vec<String> = codes
            .iter()
            .map(|c| hash_backup_code(&hasher, c).unwrap())
            .collect();

        assert!(!stored.contains(&codes[0]));

        // Lowercase, missing dash, stray whitespace all normalize
        let typed = format!(" {} ", codes[1].to_lowercase().replace('-', ""));
        assert_eq!(verify_backup_code(&hasher, &typed, &stored).unwrap(), Some(1));
        assert_eq!(
            verify_backup_code(&hasher, "0000-0000", &stored).unwrap(),
            None
        );
        assert_eq!(verify_backup_code(&hasher, "nonsense", &stored).unwrap(), None);
    }

    #[test]
    fn test_normalize_backup_code() {
        assert_eq!(normalize_backup_code("ab12-cd34"), "AB12CD34");
        assert_eq!(normalize_backup_code(" AB12 CD34\n"), "AB12CD34");
    }
}
