/// Identity service - the authentication orchestrator
///
/// The only component that touches the user store. Every other collaborator
/// (hasher, one-time codes, tokens, sessions, authorization) is a leaf.
///
/// ## Authentication
///
/// 1. Look up the principal by normalized email
/// 2. Reject inactive principals
/// 3. Verify the password (unknown email and wrong password both surface as
///    `InvalidCredentials`)
/// 4. With MFA enabled and no second factor supplied, stop with
///    [`AuthOutcome::SecondFactorRequired`]
/// 5. Validate the supplied TOTP or backup code
/// 6. Create the session, mint the token pair, stamp the last login
use crate::authz::AuthorizationEngine;
use crate::db::UserStore;
use crate::error::{IdentityError, Result};
use crate::metrics;
use crate::models::{normalize_email, NewPrincipal, Principal, RequestMetadata, SessionRecord};
use crate::security::password::{generate_secure_password, validate_password, CredentialHasher};
use crate::security::totp::{
    hash_backup_code, verify_backup_code, TotpService, DEFAULT_BACKUP_CODE_COUNT,
    DEFAULT_MFA_ISSUER,
};
use crate::security::{Claims, JwtService, TokenPair, TokenSubject};
use crate::services::audit::{AuditSink, AuthEvent, AuthEventKind};
use crate::services::session::{generate_session_id, SessionStore};
use chrono::Utc;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

/// Length of passwords generated for system principals
pub const SYSTEM_PASSWORD_LENGTH: usize = 24;

/// Verified against when the email is unknown so both paths cost one hash
const TIMING_DECOY: &str = "timing-decoy-credential";

/// Second factor supplied alongside the password
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecondFactor {
    Totp(String),
    BackupCode(String),
}

impl SecondFactor {
    /// Classify free-form user input: six characters is a TOTP code,
    /// anything else is treated as a backup code
    pub fn from_input(input: &str) -> Self {
        let trimmed = input.trim();
        if trimmed.chars().count() == crate::security::totp::TOTP_DIGITS {
            SecondFactor::Totp(trimmed.to_string())
        } else {
            SecondFactor::BackupCode(trimmed.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    pub principal: Principal,
    pub tokens: TokenPair,
    pub session_id: String,
}

#[derive(Debug, Clone)]
pub enum AuthOutcome {
    Authenticated(AuthenticatedSession),
    /// Password accepted; a second factor must be supplied on retry
    SecondFactorRequired { user_id: Uuid },
}

/// Returned once at enrollment; the backup codes are never shown again
#[derive(Debug, Clone)]
pub struct MfaSetup {
    pub secret: String,
    pub enrollment_uri: String,
    pub backup_codes: Vec<String>,
}

pub struct IdentityService {
    users: Arc<dyn UserStore>,
    sessions: SessionStore,
    tokens: Arc<JwtService>,
    authz: Arc<AuthorizationEngine>,
    hasher: CredentialHasher,
    totp: TotpService,
    audit: AuditSink,
    backup_code_count: usize,
    timing_decoy_hash: OnceCell<String>,
}

impl IdentityService {
    pub fn new(
        users: Arc<dyn UserStore>,
        sessions: SessionStore,
        tokens: Arc<JwtService>,
        authz: Arc<AuthorizationEngine>,
    ) -> Self {
        Self {
            users,
            sessions,
            tokens,
            authz,
            hasher: CredentialHasher::default(),
            totp: TotpService::new(DEFAULT_MFA_ISSUER),
            audit: AuditSink::disabled(),
            backup_code_count: DEFAULT_BACKUP_CODE_COUNT,
            timing_decoy_hash: OnceCell::new(),
        }
    }

    pub fn with_hasher(mut self, hasher: CredentialHasher) -> Self {
        self.hasher = hasher;
        self.timing_decoy_hash = OnceCell::new();
        self
    }

    pub fn with_totp(mut self, totp: TotpService) -> Self {
        self.totp = totp;
        self
    }

    pub fn with_audit(mut self, audit: AuditSink) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_backup_code_count(mut self, count: usize) -> Self {
        self.backup_code_count = count.max(1);
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn authz(&self) -> &Arc<AuthorizationEngine> {
        &self.authz
    }

    pub fn tokens(&self) -> &Arc<JwtService> {
        &self.tokens
    }

    pub fn totp(&self) -> &TotpService {
        &self.totp
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a principal with a user-chosen password
    pub async fn register(
        &self,
        registration: NewPrincipal,
        password: &str,
        metadata: &RequestMetadata,
    ) -> Result<Principal> {
        validate_password(password)?;
        let principal = self.create_principal(registration, password).await?;

        info!(user_id = %principal.id, role = %principal.role, "Principal registered");
        self.audit
            .emit(
                AuthEvent::new(AuthEventKind::PrincipalRegistered, metadata)
                    .user(principal.id)
                    .email(principal.email.clone()),
            )
            .await;
        Ok(principal)
    }

    /// Register a principal with a generated password, bypassing the policy
    ///
    /// Returns the plaintext password; it is not retrievable afterwards.
    pub async fn register_system_principal(
        &self,
        registration: NewPrincipal,
    ) -> Result<(Principal, String)> {
        let password = generate_secure_password(SYSTEM_PASSWORD_LENGTH)?;
        let principal = self.create_principal(registration, &password).await?;

        info!(user_id = %principal.id, role = %principal.role, "System principal registered");
        self.audit
            .emit(
                AuthEvent::new(AuthEventKind::PrincipalRegistered, &RequestMetadata::default())
                    .user(principal.id)
                    .email(principal.email.clone())
                    .reason("system"),
            )
            .await;
        Ok((principal, password))
    }

    async fn create_principal(&self, registration: NewPrincipal, password: &str) -> Result<Principal> {
        registration.validate()?;

        let email = normalize_email(&registration.email);
        if self.users.find_by_email(&email).await?.is_some() {
            return Err(IdentityError::EmailAlreadyExists);
        }

        let password_hash = self.hash_credential(password.to_string()).await?;
        let principal = Principal::new(&registration, password_hash);
        self.users.insert(&principal).await?;
        Ok(principal)
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    pub async fn authenticate(
        &self,
        email: &str,
        password: &str,
        second_factor: Option<SecondFactor>,
        metadata: &RequestMetadata,
    ) -> Result<AuthOutcome> {
        let email = normalize_email(email);

        match self
            .authenticate_inner(&email, password, second_factor, metadata)
            .await
        {
            Ok(AuthOutcome::Authenticated(session)) => {
                metrics::record_login("success");
                info!(
                    user_id = %session.principal.id,
                    request_id = ?metadata.request_id,
                    "Login succeeded"
                );
                self.audit
                    .emit(
                        AuthEvent::new(AuthEventKind::LoginSucceeded, metadata)
                            .user(session.principal.id)
                            .email(email),
                    )
                    .await;
                Ok(AuthOutcome::Authenticated(session))
            }
            Ok(AuthOutcome::SecondFactorRequired { user_id }) => {
                metrics::record_login("second_factor_required");
                self.audit
                    .emit(
                        AuthEvent::new(AuthEventKind::SecondFactorRequired, metadata)
                            .user(user_id)
                            .email(email),
                    )
                    .await;
                Ok(AuthOutcome::SecondFactorRequired { user_id })
            }
            Err(err) => {
                metrics::record_login(err.code());
                warn!(
                    reason = err.code(),
                    request_id = ?metadata.request_id,
                    "Login failed"
                );
                self.audit
                    .emit(
                        AuthEvent::new(AuthEventKind::LoginFailed, metadata)
                            .email(email)
                            .reason(err.code()),
                    )
                    .await;
                Err(err)
            }
        }
    }

    async fn authenticate_inner(
        &self,
        email: &str,
        password: &str,
        second_factor: Option<SecondFactor>,
        metadata: &RequestMetadata,
    ) -> Result<AuthOutcome> {
        let Some(mut principal) = self.users.find_by_email(email).await? else {
            let decoy = self.timing_decoy_hash()?.to_string();
            self.verify_credential(password.to_string(), decoy).await?;
            return Err(IdentityError::InvalidCredentials);
        };

        if !principal.is_active {
            return Err(IdentityError::UserInactive);
        }

        if !self
            .verify_credential(password.to_string(), principal.password_hash.clone())
            .await?
        {
            return Err(IdentityError::InvalidCredentials);
        }

        let mut mfa_verified = false;
        if principal.has_totp_enabled() {
            let Some(factor) = second_factor else {
                return Ok(AuthOutcome::SecondFactorRequired {
                    user_id: principal.id,
                });
            };
            self.verify_second_factor(&mut principal, factor, metadata)
                .await?;
            mfa_verified = true;
        }

        let permissions = self.authz.flattened_permissions(Some(&principal))?;

        let session_id = generate_session_id();
        let record = SessionRecord::for_principal(
            session_id.clone(),
            &principal,
            permissions.clone(),
            metadata,
            mfa_verified,
        );
        self.sessions.create_session(&session_id, &record).await?;

        let tokens = self
            .tokens
            .generate_token_pair(&token_subject(&principal, permissions))?;

        self.stamp_login(&mut principal, password).await;

        Ok(AuthOutcome::Authenticated(AuthenticatedSession {
            principal,
            tokens,
            session_id,
        }))
    }

    /// Any failure here is `InvalidTwoFACode`. A backup code is claimed at the
    /// store before the login completes; of concurrent logins presenting the
    /// same code only the one whose claim lands succeeds.
    async fn verify_second_factor(
        &self,
        principal: &mut Principal,
        factor: SecondFactor,
        metadata: &RequestMetadata,
    ) -> Result<()> {
        match factor {
            SecondFactor::Totp(code) => {
                let secret = principal
                    .totp_secret
                    .as_deref()
                    .ok_or(IdentityError::InvalidTwoFACode)?;
                match self.totp.validate_code(secret, &code) {
                    Ok(true) => Ok(()),
                    Ok(false) | Err(_) => Err(IdentityError::InvalidTwoFACode),
                }
            }
            SecondFactor::BackupCode(code) => {
                let hasher = self.hasher.clone();
                let candidates = principal.backup_code_hashes.clone();
                let matched = tokio::task::spawn_blocking(move || {
                    verify_backup_code(&hasher, &code, &candidates)
                })
                .await
                .map_err(|e| IdentityError::Internal(format!("backup code check failed: {e}")))?;

                let code_hash = match matched {
                    Ok(Some(index)) => principal
                        .backup_code_hashes
                        .get(index)
                        .cloned()
                        .ok_or(IdentityError::InvalidTwoFACode)?,
                    Ok(None) | Err(_) => return Err(IdentityError::InvalidTwoFACode),
                };

                if !self
                    .users
                    .consume_backup_code(principal.id, &code_hash)
                    .await?
                {
                    debug!(user_id = %principal.id, "Backup code already consumed");
                    return Err(IdentityError::InvalidTwoFACode);
                }
                principal.backup_code_hashes.retain(|h| *h != code_hash);

                info!(
                    user_id = %principal.id,
                    remaining = principal.backup_code_hashes.len(),
                    "Backup code consumed"
                );
                self.audit
                    .emit(AuthEvent::new(AuthEventKind::BackupCodeUsed, metadata).user(principal.id))
                    .await;
                Ok(())
            }
        }
    }

    /// Record the login time and upgrade outdated hashes; failures only log
    ///
    /// Both writes are column-scoped, so a deactivation or credential change
    /// that lands while the login is in flight is never reverted.
    async fn stamp_login(&self, principal: &mut Principal, password: &str) {
        let now = Utc::now();
        match self.users.record_login(principal.id, now).await {
            Ok(()) => principal.last_login_at = Some(now),
            Err(e) => warn!(user_id = %principal.id, error = %e, "Failed to record last login"),
        }

        if !self.hasher.needs_rehash(&principal.password_hash) {
            return;
        }
        let upgraded = match self.hash_credential(password.to_string()).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(user_id = %principal.id, error = %e, "Password rehash failed");
                return;
            }
        };
        match self
            .users
            .upgrade_password_hash(principal.id, &principal.password_hash, &upgraded)
            .await
        {
            Ok(true) => {
                debug!(user_id = %principal.id, "Password hash upgraded");
                principal.password_hash = upgraded;
            }
            Ok(false) => debug!(user_id = %principal.id, "Password changed before hash upgrade"),
            Err(e) => warn!(user_id = %principal.id, error = %e, "Failed to store upgraded hash"),
        }
    }

    // ========================================================================
    // Tokens
    // ========================================================================

    /// Exchange a refresh token for a new pair
    ///
    /// The old refresh token's id is claimed atomically, so of two concurrent
    /// refreshes with the same token exactly one succeeds.
    pub async fn refresh_token(
        &self,
        refresh_token: &str,
        metadata: &RequestMetadata,
    ) -> Result<TokenPair> {
        match self.refresh_inner(refresh_token).await {
            Ok((user_id, pair)) => {
                metrics::record_refresh("success");
                self.audit
                    .emit(AuthEvent::new(AuthEventKind::TokenRefreshed, metadata).user(user_id))
                    .await;
                Ok(pair)
            }
            Err(err) => {
                metrics::record_refresh(err.code());
                warn!(reason = err.code(), "Token refresh rejected");
                self.audit
                    .emit(AuthEvent::new(AuthEventKind::RefreshRejected, metadata).reason(err.code()))
                    .await;
                Err(err)
            }
        }
    }

    async fn refresh_inner(&self, refresh_token: &str) -> Result<(Uuid, TokenPair)> {
        let claims = self.tokens.validate_refresh_token(refresh_token)?;

        if !self.sessions.claim_token(&claims.jti).await? {
            return Err(IdentityError::TokenRevoked);
        }

        let principal = self
            .users
            .find_by_id(claims.user_id()?)
            .await?
            .ok_or(IdentityError::InvalidToken)?;
        if !principal.is_active {
            return Err(IdentityError::UserInactive);
        }

        let permissions = self.authz.flattened_permissions(Some(&principal))?;
        let pair = self
            .tokens
            .generate_token_pair(&token_subject(&principal, permissions))?;
        Ok((principal.id, pair))
    }

    /// Validate an access token and resolve its principal
    ///
    /// Rejects revoked token ids, unknown principals and inactive principals.
    pub async fn validate_access_token(&self, token: &str) -> Result<(Principal, Claims)> {
        let claims = self.tokens.validate_access_token(token)?;

        if self.sessions.is_blacklisted(&claims.jti).await? {
            return Err(IdentityError::TokenRevoked);
        }

        let principal = self
            .users
            .find_by_id(claims.user_id()?)
            .await?
            .ok_or(IdentityError::InvalidToken)?;
        if !principal.is_active {
            return Err(IdentityError::UserInactive);
        }

        Ok((principal, claims))
    }

    /// Best-effort logout
    ///
    /// The session is deleted even when the tokens do not validate. A valid
    /// access token has its id revoked and a valid refresh token is claimed,
    /// so neither half of the pair outlives the logout. Store failures are
    /// reported after every step has been attempted.
    pub async fn logout(
        &self,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
        session_id: Option<&str>,
        metadata: &RequestMetadata,
    ) -> Result<()> {
        let mut first_error: Option<IdentityError> = None;

        if let Some(session_id) = session_id {
            if let Err(e) = self.sessions.delete_session(session_id).await {
                warn!(error = %e, "Failed to delete session on logout");
                first_error.get_or_insert(e);
            }
        }

        let mut user_id = None;
        if let Some(token) = access_token {
            match self.tokens.validate_access_token(token) {
                Ok(claims) => {
                    user_id = claims.user_id().ok();
                    if let Err(e) = self.sessions.blacklist_token(&claims.jti).await {
                        warn!(error = %e, "Failed to revoke token on logout");
                        first_error.get_or_insert(e);
                    }
                }
                Err(e) => debug!(error = %e, "Logout with unusable token"),
            }
        }

        if let Some(token) = refresh_token {
            match self.tokens.validate_refresh_token(token) {
                Ok(claims) => {
                    user_id = user_id.or_else(|| claims.user_id().ok());
                    // Already claimed means already unusable
                    if let Err(e) = self.sessions.claim_token(&claims.jti).await {
                        warn!(error = %e, "Failed to revoke refresh token on logout");
                        first_error.get_or_insert(e);
                    }
                }
                Err(e) => debug!(error = %e, "Logout with unusable refresh token"),
            }
        }

        let mut event = AuthEvent::new(AuthEventKind::Logout, metadata);
        if let Some(user_id) = user_id {
            event = event.user(user_id);
        }
        self.audit.emit(event).await;

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Second factor lifecycle
    // ========================================================================

    /// Start TOTP enrollment
    ///
    /// Reuses a pending secret if one exists. Backup codes are replaced on
    /// every call and stored hashed.
    pub async fn setup_mfa(&self, user_id: Uuid, metadata: &RequestMetadata) -> Result<MfaSetup> {
        let mut principal = self.load_principal(user_id).await?;
        let read_at = principal.updated_at;
        if principal.has_totp_enabled() {
            return Err(IdentityError::Validation(
                "second factor is already enabled".to_string(),
            ));
        }

        let secret = match &principal.totp_secret {
            Some(secret) => secret.clone(),
            None => self.totp.generate_secret(),
        };
        let enrollment_uri = self.totp.enrollment_uri(&secret, &principal.email);
        let backup_codes = self.totp.generate_backup_codes(self.backup_code_count);

        principal.totp_secret = Some(secret.clone());
        principal.backup_code_hashes = self.hash_backup_codes(backup_codes.clone()).await?;
        principal.touch();
        self.users.update(&principal, read_at).await?;

        info!(user_id = %user_id, "MFA enrollment started");
        self.audit
            .emit(AuthEvent::new(AuthEventKind::MfaEnrollmentStarted, metadata).user(user_id))
            .await;

        Ok(MfaSetup {
            secret,
            enrollment_uri,
            backup_codes,
        })
    }

    /// Confirm enrollment with a code from the authenticator
    ///
    /// Existing sessions are invalidated so every device re-authenticates
    /// with the second factor.
    pub async fn enable_mfa(&self, user_id: Uuid, code: &str, metadata: &RequestMetadata) -> Result<()> {
        let mut principal = self.load_principal(user_id).await?;
        let read_at = principal.updated_at;
        let secret = principal
            .totp_secret
            .clone()
            .ok_or(IdentityError::TwoFANotEnabled)?;

        if !self.totp.validate_code(&secret, code)? {
            return Err(IdentityError::InvalidTwoFACode);
        }

        principal.totp_enabled = true;
        principal.touch();
        self.users.update(&principal, read_at).await?;
        self.sessions
            .invalidate_all_sessions_for_principal(user_id)
            .await?;

        info!(user_id = %user_id, "MFA enabled");
        self.audit
            .emit(AuthEvent::new(AuthEventKind::MfaEnabled, metadata).user(user_id))
            .await;
        Ok(())
    }

    /// Tear down TOTP; requires the current password
    pub async fn disable_mfa(&self, user_id: Uuid, password: &str, metadata: &RequestMetadata) -> Result<()> {
        let mut principal = self.load_principal(user_id).await?;
        let read_at = principal.updated_at;
        if !principal.has_totp_enabled() {
            return Err(IdentityError::TwoFANotEnabled);
        }

        if !self
            .verify_credential(password.to_string(), principal.password_hash.clone())
            .await?
        {
            return Err(IdentityError::InvalidCredentials);
        }

        principal.totp_enabled = false;
        principal.totp_secret = None;
        principal.backup_code_hashes.clear();
        principal.touch();
        self.users.update(&principal, read_at).await?;
        self.sessions
            .invalidate_all_sessions_for_principal(user_id)
            .await?;

        info!(user_id = %user_id, "MFA disabled");
        self.audit
            .emit(AuthEvent::new(AuthEventKind::MfaDisabled, metadata).user(user_id))
            .await;
        Ok(())
    }

    // ========================================================================
    // Account maintenance
    // ========================================================================

    /// Change the password and sign out every session
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
        metadata: &RequestMetadata,
    ) -> Result<()> {
        let mut principal = self.load_principal(user_id).await?;
        let read_at = principal.updated_at;

        if !self
            .verify_credential(current_password.to_string(), principal.password_hash.clone())
            .await?
        {
            return Err(IdentityError::InvalidCredentials);
        }
        validate_password(new_password)?;

        principal.password_hash = self.hash_credential(new_password.to_string()).await?;
        principal.touch();
        self.users.update(&principal, read_at).await?;
        let removed = self
            .sessions
            .invalidate_all_sessions_for_principal(user_id)
            .await?;

        info!(user_id = %user_id, sessions_removed = removed, "Password changed");
        self.audit
            .emit(AuthEvent::new(AuthEventKind::PasswordChanged, metadata).user(user_id))
            .await;
        Ok(())
    }

    /// Deactivate a principal, returning how many sessions were removed
    ///
    /// Outstanding tokens stop validating because validation checks the
    /// active flag.
    pub async fn deactivate_principal(&self, user_id: Uuid, metadata: &RequestMetadata) -> Result<usize> {
        let mut principal = self.load_principal(user_id).await?;
        let read_at = principal.updated_at;
        principal.is_active = false;
        principal.touch();
        self.users.update(&principal, read_at).await?;

        let removed = self
            .sessions
            .invalidate_all_sessions_for_principal(user_id)
            .await?;

        info!(user_id = %user_id, sessions_removed = removed, "Principal deactivated");
        self.audit
            .emit(AuthEvent::new(AuthEventKind::PrincipalDeactivated, metadata).user(user_id))
            .await;
        Ok(removed)
    }

    pub async fn find_principal(&self, user_id: Uuid) -> Result<Option<Principal>> {
        self.users.find_by_id(user_id).await
    }

    pub async fn find_principal_by_email(&self, email: &str) -> Result<Option<Principal>> {
        self.users.find_by_email(&normalize_email(email)).await
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn load_principal(&self, user_id: Uuid) -> Result<Principal> {
        self.users
            .find_by_id(user_id)
            .await?
            .ok_or(IdentityError::UserNotFound)
    }

    fn timing_decoy_hash(&self) -> Result<&str> {
        self.timing_decoy_hash
            .get_or_try_init(|| self.hasher.hash(TIMING_DECOY))
            .map(String::as_str)
    }

    // Hashing is CPU bound; keep it off the async workers
    async fn hash_credential(&self, plaintext: String) -> Result<String> {
        let hasher = self.hasher.clone();
        tokio::task::spawn_blocking(move || hasher.hash(&plaintext))
            .await
            .map_err(|e| IdentityError::Internal(format!("hashing task failed: {e}")))?
    }

    async fn verify_credential(&self, plaintext: String, encoded: String) -> Result<bool> {
        let hasher = self.hasher.clone();
        tokio::task::spawn_blocking(move || hasher.verify(&plaintext, &encoded))
            .await
            .map_err(|e| IdentityError::Internal(format!("verification task failed: {e}")))?
    }

    async fn hash_backup_codes(&self, codes: Vec<String>) -> Result<Vec<String>> {
        let hasher = self.hasher.clone();
        tokio::task::spawn_blocking(move || {
            codes
                .iter()
                .map(|code| hash_backup_code(&hasher, code))
                .collect::<Result<Vec<_>>>()
        })
        .await
        .map_err(|e| IdentityError::Internal(format!("hashing task failed: {e}")))?
    }
}

fn token_subject(principal: &Principal, permissions: Vec<String>) -> TokenSubject {
    TokenSubject {
        user_id: principal.id,
        email: principal.email.clone(),
        role: principal.role.to_string(),
        security_clearance: principal.security_clearance.to_string(),
        permissions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InMemoryUserStore, MockUserStore};
    use crate::error::StoreError;
    use crate::models::{Role, SecurityClearance};
    use crate::security::password::HashAlgorithm;
    use crate::security::JwtConfig;
    use crate::services::audit::Backpressure;
    use crate::services::session::{DEFAULT_BLACKLIST_TTL, DEFAULT_SESSION_TTL};
    use crate::store::InMemoryExpiringStore;

    const PASSWORD: &str = "Abc123!@";

    fn jwt() -> Arc<JwtService> {
        Arc::new(
            JwtService::new(JwtConfig::new(
                "access-secret-for-identity-unit-tests-0001",
                "refresh-secret-for-identity-unit-tests-0002",
            ))
            .unwrap(),
        )
    }

    fn sessions() -> SessionStore {
        SessionStore::new(
            Arc::new(InMemoryExpiringStore::new()),
            DEFAULT_SESSION_TTL,
            DEFAULT_BLACKLIST_TTL,
        )
    }

    fn service_with(users: Arc<dyn UserStore>) -> IdentityService {
        IdentityService::new(
            users,
            sessions(),
            jwt(),
            Arc::new(AuthorizationEngine::default()),
        )
        .with_hasher(CredentialHasher::new(HashAlgorithm::Bcrypt { cost: 4 }).unwrap())
        .with_backup_code_count(3)
    }

    fn service() -> IdentityService {
        service_with(Arc::new(InMemoryUserStore::new()))
    }

    fn registration(email: &str) -> NewPrincipal {
        NewPrincipal {
            email: email.to_string(),
            name: "Ada Analyst".to_string(),
            department: "research".to_string(),
            role: Role::Analyst,
            security_clearance: SecurityClearance::Confidential,
            permissions: Vec::new(),
        }
    }

    fn meta() -> RequestMetadata {
        RequestMetadata::new("req-1", "10.0.0.1", "unit-test")
    }

    #[tokio::test]
    async fn test_register_rejects_weak_password_and_duplicates() {
        let svc = service();
        assert!(matches!(
            svc.register(registration("a@example.com"), "short", &meta()).await,
            Err(IdentityError::WeakPassword(_))
        ));

        svc.register(registration("a@example.com"), PASSWORD, &meta())
            .await
            .unwrap();
        assert!(matches!(
            svc.register(registration("A@Example.com "), PASSWORD, &meta()).await,
            Err(IdentityError::EmailAlreadyExists)
        ));
    }

    #[tokio::test]
    async fn test_register_rejects_malformed_email() {
        let svc = service();
        assert!(matches!(
            svc.register(registration("not-an-email"), PASSWORD, &meta()).await,
            Err(IdentityError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_email_and_wrong_password_are_indistinguishable() {
        let svc = service();
        svc.register(registration("a@example.com"), PASSWORD, &meta())
            .await
            .unwrap();

        let unknown = svc
            .authenticate("b@example.com", PASSWORD, None, &meta())
            .await;
        let wrong = svc
            .authenticate("a@example.com", "Wrong123!@", None, &meta())
            .await;
        assert!(matches!(unknown, Err(IdentityError::InvalidCredentials)));
        assert!(matches!(wrong, Err(IdentityError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn test_authenticate_creates_session_and_tokens() {
        let svc = service();
        svc.register(registration("a@example.com"), PASSWORD, &meta())
            .await
            .unwrap();

        let AuthOutcome::Authenticated(session) = svc
            .authenticate("A@example.com", PASSWORD, None, &meta())
            .await
            .unwrap()
        else {
            panic!("expected authenticated outcome");
        };

        let record = svc.sessions().get_session(&session.session_id).await.unwrap();
        assert_eq!(record.user_id, session.principal.id);
        assert_eq!(record.ip_address.as_deref(), Some("10.0.0.1"));
        assert!(!record.mfa_verified);
        assert!(record.permissions.contains(&"documents:read".to_string()));

        let (principal, claims) = svc
            .validate_access_token(&session.tokens.access_token)
            .await
            .unwrap();
        assert_eq!(principal.id, session.principal.id);
        assert_eq!(claims.role, "analyst");
        assert!(principal.last_login_at.is_some());
    }

    #[tokio::test]
    async fn test_inactive_principal_rejected_before_password_check() {
        let svc = service();
        let principal = svc
            .register(registration("a@example.com"), PASSWORD, &meta())
            .await
            .unwrap();
        svc.deactivate_principal(principal.id, &meta()).await.unwrap();

        assert!(matches!(
            svc.authenticate("a@example.com", "anything", None, &meta()).await,
            Err(IdentityError::UserInactive)
        ));
    }

    #[tokio::test]
    async fn test_backup_code_is_single_use() {
        let svc = service();
        let principal = svc
            .register(registration("a@example.com"), PASSWORD, &meta())
            .await
            .unwrap();
        let setup = svc.setup_mfa(principal.id, &meta()).await.unwrap();
        assert_eq!(setup.backup_codes.len(), 3);

        let code = svc
            .totp()
            .generate_code_at(&setup.secret, Utc::now().timestamp() as u64)
            .unwrap();
        svc.enable_mfa(principal.id, &code, &meta()).await.unwrap();

        let backup = SecondFactor::from_input(&setup.backup_codes[0].to_lowercase());
        let outcome = svc
            .authenticate("a@example.com", PASSWORD, Some(backup.clone()), &meta())
            .await
            .unwrap();
        assert!(matches!(outcome, AuthOutcome::Authenticated(_)));

        assert!(matches!(
            svc.authenticate("a@example.com", PASSWORD, Some(backup), &meta()).await,
            Err(IdentityError::InvalidTwoFACode)
        ));
        let stored = svc.find_principal(principal.id).await.unwrap().unwrap();
        assert_eq!(stored.backup_code_hashes.len(), 2);
    }

    #[tokio::test]
    async fn test_login_upgrades_outdated_hash() {
        let users = Arc::new(InMemoryUserStore::new());
        let principal = service_with(users.clone())
            .register(registration("a@example.com"), PASSWORD, &meta())
            .await
            .unwrap();

        let stronger = service_with(users.clone())
            .with_hasher(CredentialHasher::new(HashAlgorithm::Bcrypt { cost: 5 }).unwrap());
        stronger
            .authenticate("a@example.com", PASSWORD, None, &meta())
            .await
            .unwrap();

        let stored = users.find_by_id(principal.id).await.unwrap().unwrap();
        assert_ne!(stored.password_hash, principal.password_hash);
        assert!(stored.password_hash.starts_with("$2b$05$"));
        assert!(stored.last_login_at.is_some());
    }

    #[tokio::test]
    async fn test_mfa_change_from_stale_read_is_a_conflict() {
        let users = Arc::new(InMemoryUserStore::new());
        let svc = service_with(users.clone());
        let principal = svc
            .register(registration("a@example.com"), PASSWORD, &meta())
            .await
            .unwrap();
        let setup = svc.setup_mfa(principal.id, &meta()).await.unwrap();

        // Another writer moved the row on after this snapshot was taken
        let stale = users.find_by_id(principal.id).await.unwrap().unwrap();
        svc.deactivate_principal(principal.id, &meta()).await.unwrap();

        let mut enabled = stale.clone();
        enabled.totp_enabled = true;
        enabled.touch();
        let err = users.update(&enabled, stale.updated_at).await.unwrap_err();
        assert!(err.is_conflict());

        let stored = users.find_by_id(principal.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert!(!stored.totp_enabled);
        assert_eq!(stored.totp_secret.as_deref(), Some(setup.secret.as_str()));
    }

    #[tokio::test]
    async fn test_enable_mfa_checks_code_length() {
        let svc = service();
        let principal = svc
            .register(registration("a@example.com"), PASSWORD, &meta())
            .await
            .unwrap();
        assert!(matches!(
            svc.enable_mfa(principal.id, "123456", &meta()).await,
            Err(IdentityError::TwoFANotEnabled)
        ));

        svc.setup_mfa(principal.id, &meta()).await.unwrap();
        assert!(matches!(
            svc.enable_mfa(principal.id, "12345", &meta()).await,
            Err(IdentityError::InvalidCodeLength {
                expected: 6,
                actual: 5
            })
        ));
    }

    #[tokio::test]
    async fn test_disable_mfa_requires_password() {
        let svc = service();
        let principal = svc
            .register(registration("a@example.com"), PASSWORD, &meta())
            .await
            .unwrap();
        assert!(matches!(
            svc.disable_mfa(principal.id, PASSWORD, &meta()).await,
            Err(IdentityError::TwoFANotEnabled)
        ));

        let setup = svc.setup_mfa(principal.id, &meta()).await.unwrap();
        let code = svc
            .totp()
            .generate_code_at(&setup.secret, Utc::now().timestamp() as u64)
            .unwrap();
        svc.enable_mfa(principal.id, &code, &meta()).await.unwrap();

        assert!(matches!(
            svc.disable_mfa(principal.id, "Wrong123!@", &meta()).await,
            Err(IdentityError::InvalidCredentials)
        ));
        svc.disable_mfa(principal.id, PASSWORD, &meta()).await.unwrap();

        let outcome = svc
            .authenticate("a@example.com", PASSWORD, None, &meta())
            .await
            .unwrap();
        assert!(matches!(outcome, AuthOutcome::Authenticated(_)));
    }

    #[tokio::test]
    async fn test_change_password_signs_out_sessions() {
        let svc = service();
        let principal = svc
            .register(registration("a@example.com"), PASSWORD, &meta())
            .await
            .unwrap();
        let AuthOutcome::Authenticated(session) = svc
            .authenticate("a@example.com", PASSWORD, None, &meta())
            .await
            .unwrap()
        else {
            panic!("expected authenticated outcome");
        };

        assert!(matches!(
            svc.change_password(principal.id, PASSWORD, "weak", &meta()).await,
            Err(IdentityError::WeakPassword(_))
        ));
        svc.change_password(principal.id, PASSWORD, "Xyz789#$", &meta())
            .await
            .unwrap();

        assert!(matches!(
            svc.sessions().get_session(&session.session_id).await,
            Err(IdentityError::SessionNotFound)
        ));
        assert!(svc
            .authenticate("a@example.com", "Xyz789#$", None, &meta())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_system_principal_gets_usable_generated_password() {
        let svc = service();
        let mut admin = registration("root@example.com");
        admin.role = Role::Admin;
        admin.security_clearance = SecurityClearance::TopSecret;

        let (principal, password) = svc.register_system_principal(admin).await.unwrap();
        assert_eq!(password.len(), SYSTEM_PASSWORD_LENGTH);
        assert_eq!(principal.role, Role::Admin);
        assert!(svc
            .authenticate("root@example.com", &password, None, &meta())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_user_store_failure_surfaces_as_store_error() {
        let mut users = MockUserStore::new();
        users
            .expect_find_by_email()
            .returning(|_| Err(IdentityError::Store(StoreError::Timeout)));

        let svc = service_with(Arc::new(users));
        assert!(matches!(
            svc.authenticate("a@example.com", PASSWORD, None, &meta()).await,
            Err(IdentityError::Store(StoreError::Timeout))
        ));
    }

    #[tokio::test]
    async fn test_failed_login_is_audited() {
        let (sink, mut rx) = crate::services::audit::AuditSink::channel(8, Backpressure::Block);
        let svc = service().with_audit(sink);

        let _ = svc
            .authenticate("ghost@example.com", PASSWORD, None, &meta())
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, AuthEventKind::LoginFailed);
        assert_eq!(event.reason.as_deref(), Some("invalid_credentials"));
        assert_eq!(event.metadata.request_id.as_deref(), Some("req-1"));
    }

    #[test]
    fn test_second_factor_classification() {
        assert_eq!(
            SecondFactor::from_input(" 123456 "),
            SecondFactor::Totp("123456".to_string())
        );
        assert_eq!(
            SecondFactor::from_input("ABCD-1234"),
            SecondFactor::BackupCode("ABCD-1234".to_string())
        );
    }
}
