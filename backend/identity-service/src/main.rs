/// Identity bootstrap
///
/// Prepares the backing stores and seeds the first administrator:
/// - PostgreSQL connection pool and schema migrations
/// - Redis connection manager
/// - Administrator from `BOOTSTRAP_ADMIN_EMAIL`, created once with a
///   generated password printed to stdout
use anyhow::{Context, Result};
use identity_service::{
    authz::AuthorizationEngine,
    config::Settings,
    db::{PgUserStore, MIGRATOR},
    models::{NewPrincipal, Role, SecurityClearance},
    security::{password::CredentialHasher, totp::TotpService, JwtService},
    services::{IdentityService, SessionStore},
    store::RedisExpiringStore,
};
use redis_utils::RedisPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "identity_service=info,info".into()),
        )
        .with_target(false)
        .json()
        .init();

    info!("Starting identity bootstrap");

    let settings = Settings::load().context("Failed to load configuration")?;
    info!("Configuration loaded successfully");

    let db = PgPoolOptions::new()
        .max_connections(settings.database.max_connections)
        .min_connections(settings.database.min_connections)
        .acquire_timeout(Duration::from_secs(settings.database.acquire_timeout))
        .connect(&settings.database.url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    MIGRATOR
        .run(&db)
        .await
        .context("Failed to run database migrations")?;
    info!("Database migrations applied");

    let redis = RedisPool::connect(&settings.redis.url, Some(settings.redis.command_timeout()))
        .await
        .context("Failed to connect to Redis")?;

    let tokens = Arc::new(
        JwtService::new(settings.jwt.jwt_config()).context("Invalid token configuration")?,
    );
    let hasher = CredentialHasher::new(settings.password.hash_algorithm()?)
        .context("Invalid password hashing configuration")?;
    let sessions = SessionStore::new(
        Arc::new(RedisExpiringStore::from_pool(&redis)),
        settings.session.session_ttl(),
        settings.session.blacklist_ttl(),
    );

    let identity = IdentityService::new(
        Arc::new(PgUserStore::new(db)),
        sessions,
        tokens,
        Arc::new(AuthorizationEngine::default()),
    )
    .with_hasher(hasher)
    .with_totp(TotpService::new(settings.mfa.issuer.clone()))
    .with_backup_code_count(settings.mfa.backup_code_count);

    let Some(email) = settings.bootstrap.admin_email.as_deref() else {
        info!("BOOTSTRAP_ADMIN_EMAIL not set; nothing to seed");
        return Ok(());
    };

    if identity
        .find_principal_by_email(email)
        .await
        .context("Failed to look up bootstrap administrator")?
        .is_some()
    {
        info!("Bootstrap administrator already exists");
        return Ok(());
    }

    let (admin, password) = identity
        .register_system_principal(NewPrincipal {
            email: email.to_string(),
            name: settings.bootstrap.admin_name.clone(),
            department: settings.bootstrap.admin_department.clone(),
            role: Role::Admin,
            security_clearance: SecurityClearance::TopSecret,
            permissions: Vec::new(),
        })
        .await
        .context("Failed to create bootstrap administrator")?;

    info!(user_id = %admin.id, "Bootstrap administrator created");
    // Shown exactly once; never logged
    println!("Bootstrap administrator: {}", admin.email);
    println!("Temporary password: {password}");

    Ok(())
}
