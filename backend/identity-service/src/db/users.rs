/// PostgreSQL principal store
use super::UserStore;
use crate::error::{IdentityError, Result, StoreError};
use crate::models::{PermissionGrant, Principal};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

const SELECT_PRINCIPAL: &str = r#"
    SELECT id, email, name, department, role, security_clearance, is_active,
           password_hash, totp_secret, totp_enabled, permissions, backup_code_hashes,
           last_login_at, created_at, updated_at
    FROM principals
"#;

/// Raw row; enum columns are TEXT and parsed on the way out
#[derive(Debug, sqlx::FromRow)]
struct PrincipalRow {
    id: Uuid,
    email: String,
    name: String,
    department: String,
    role: String,
    security_clearance: String,
    is_active: bool,
    password_hash: String,
    totp_secret: Option<String>,
    totp_enabled: bool,
    permissions: Json<Vec<PermissionGrant>>,
    backup_code_hashes: Vec<String>,
    last_login_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PrincipalRow> for Principal {
    type Error = IdentityError;

    fn try_from(row: PrincipalRow) -> Result<Self> {
        let role = row.role.parse().map_err(|e: String| {
            tracing::error!(user_id = %row.id, error = %e, "Stored role is not recognised");
            IdentityError::Store(StoreError::Corrupt(e))
        })?;
        let security_clearance = row
            .security_clearance
            .parse()
            .map_err(|e: String| IdentityError::Store(StoreError::Corrupt(e)))?;

        Ok(Principal {
            id: row.id,
            email: row.email,
            name: row.name,
            department: row.department,
            role,
            security_clearance,
            is_active: row.is_active,
            password_hash: row.password_hash,
            totp_secret: row.totp_secret,
            totp_enabled: row.totp_enabled,
            permissions: row.permissions.0,
            backup_code_hashes: row.backup_code_hashes,
            last_login_at: row.last_login_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn map_write_error(err: sqlx::Error) -> IdentityError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => IdentityError::EmailAlreadyExists,
        _ => err.into(),
    }
}

#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>> {
        let row = sqlx::query_as::<_, PrincipalRow>(&format!("{SELECT_PRINCIPAL} WHERE email = $1"))
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Principal::try_from).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Principal>> {
        let row = sqlx::query_as::<_, PrincipalRow>(&format!("{SELECT_PRINCIPAL} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Principal::try_from).transpose()
    }

    async fn insert(&self, principal: &Principal) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO principals (
                id, email, name, department, role, security_clearance, is_active,
                password_hash, totp_secret, totp_enabled, permissions, backup_code_hashes,
                last_login_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(principal.id)
        .bind(&principal.email)
        .bind(&principal.name)
        .bind(&principal.department)
        .bind(principal.role.as_str())
        .bind(principal.security_clearance.as_str())
        .bind(principal.is_active)
        .bind(&principal.password_hash)
        .bind(&principal.totp_secret)
        .bind(principal.totp_enabled)
        .bind(Json(&principal.permissions))
        .bind(&principal.backup_code_hashes)
        .bind(principal.last_login_at)
        .bind(principal.created_at)
        .bind(principal.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_write_error)?;

        Ok(())
    }

    async fn update(&self, principal: &Principal, expected_updated_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE principals
            SET email = $2, name = $3, department = $4, role = $5, security_clearance = $6,
                is_active = $7, password_hash = $8, totp_secret = $9, totp_enabled = $10,
                permissions = $11, backup_code_hashes = $12, last_login_at = $13,
                updated_at = $14
            WHERE id = $1 AND updated_at = $15
            "#,
        )
        .bind(principal.id)
        .bind(&principal.email)
        .bind(&principal.name)
        .bind(&principal.department)
        .bind(principal.role.as_str())
        .bind(principal.security_clearance.as_str())
        .bind(principal.is_active)
        .bind(&principal.password_hash)
        .bind(&principal.totp_secret)
        .bind(principal.totp_enabled)
        .bind(Json(&principal.permissions))
        .bind(&principal.backup_code_hashes)
        .bind(principal.last_login_at)
        .bind(principal.updated_at)
        .bind(expected_updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_write_error)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM principals WHERE id = $1)")
            .bind(principal.id)
            .fetch_one(&self.pool)
            .await?;
        if exists {
            Err(IdentityError::Store(StoreError::Conflict(format!(
                "principal {} changed since it was read",
                principal.id
            ))))
        } else {
            Err(IdentityError::UserNotFound)
        }
    }

    async fn record_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE principals SET last_login_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(IdentityError::UserNotFound);
        }
        Ok(())
    }

    async fn upgrade_password_hash(&self, id: Uuid, current_hash: &str, new_hash: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE principals
            SET password_hash = $3, updated_at = NOW()
            WHERE id = $1 AND password_hash = $2
            "#,
        )
        .bind(id)
        .bind(current_hash)
        .bind(new_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn consume_backup_code(&self, id: Uuid, code_hash: &str) -> Result<bool> {
        // Row lock on UPDATE makes the membership test and the removal one step
        let result = sqlx::query(
            r#"
            UPDATE principals
            SET backup_code_hashes = array_remove(backup_code_hashes, $2), updated_at = NOW()
            WHERE id = $1 AND $2 = ANY(backup_code_hashes)
            "#,
        )
        .bind(id)
        .bind(code_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
