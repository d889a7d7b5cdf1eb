use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo, RedisError};
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::info;

/// Shared Redis connection manager guarded by a Tokio mutex.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

/// Upper bound applied by [`with_timeout`] to a single Redis round trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Redis connection pool.
///
/// Wraps a multiplexed [`ConnectionManager`]; callers clone the inner manager
/// per command (`pool.manager().lock().await.clone()`), which is cheap.
pub struct RedisPool {
    manager: SharedConnectionManager,
    command_timeout: Duration,
}

impl RedisPool {
    pub async fn connect(redis_url: &str, command_timeout: Option<Duration>) -> Result<Self> {
        let info = redis_url
            .into_connection_info()
            .context("failed to parse REDIS_URL connection string")?;
        let client = Client::open(info).context("failed to construct Redis client")?;
        let connection_manager = ConnectionManager::new(client)
            .await
            .context("failed to initialize Redis connection manager")?;

        info!("Redis connection manager initialized");

        Ok(Self {
            manager: Arc::new(Mutex::new(connection_manager)),
            command_timeout: command_timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT),
        })
    }

    pub fn manager(&self) -> SharedConnectionManager {
        self.manager.clone()
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }
}

/// Run a Redis future with [`DEFAULT_COMMAND_TIMEOUT`].
pub async fn with_timeout<T, F>(fut: F) -> std::result::Result<T, RedisError>
where
    F: Future<Output = std::result::Result<T, RedisError>>,
{
    with_timeout_of(DEFAULT_COMMAND_TIMEOUT, fut).await
}

/// Run a Redis future with an explicit deadline.
///
/// An elapsed deadline surfaces as a `RedisError` for which
/// [`RedisError::is_timeout`] is true, so callers can tell it apart from a
/// broken connection.
pub async fn with_timeout_of<T, F>(limit: Duration, fut: F) -> std::result::Result<T, RedisError>
where
    F: Future<Output = std::result::Result<T, RedisError>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RedisError::from(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("redis command exceeded {}ms", limit.as_millis()),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn elapsed_deadline_is_reported_as_timeout() {
        let result: std::result::Result<(), RedisError> =
            with_timeout_of(Duration::from_millis(50), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn completed_future_passes_through() {
        let value = with_timeout(async { Ok::<_, RedisError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn inner_error_is_preserved() {
        let err = with_timeout(async {
            Err::<(), _>(RedisError::from((redis::ErrorKind::TypeError, "bad type")))
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), redis::ErrorKind::TypeError);
        assert!(!err.is_timeout());
    }
}
