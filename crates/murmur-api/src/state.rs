use std::sync::Arc;

use murmur_auth::{TokenError, TokenService};
use murmur_db::Database;
use murmur_gateway::{Gateway, GatewayError};

use crate::error::ApiError;
use crate::rate_limit::RateLimiter;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub gateway: Gateway,
    pub tokens: TokenService,
    pub history_max_limit: u32,
    /// Register and login requests per client address.
    pub auth_limiter: RateLimiter,
    /// Failed logins per username.
    pub login_failures: RateLimiter,
}

impl AppStateInner {
    /// Store call on the blocking pool, bounded like the live path's calls.
    pub async fn db<F, T>(&self, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.gateway.store(f).await?)
    }
}

/// Token service calls touch the store, so they run on the blocking pool
/// under the same store timeout.
pub async fn with_tokens<F, T>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&TokenService) -> Result<T, TokenError> + Send + 'static,
    T: Send + 'static,
{
    let timeout = state.gateway.store_timeout();
    let state = state.clone();
    let task = tokio::task::spawn_blocking(move || f(&state.tokens));

    let joined = tokio::time::timeout(timeout, task)
        .await
        .map_err(|_| GatewayError::Timeout(timeout))?;
    let result = joined.map_err(|e| ApiError::Internal(e.into()))?;
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use murmur_gateway::Registry;
    use uuid::Uuid;

    fn state(db: Arc<Database>, store_timeout: Duration) -> AppState {
        let tokens = TokenService::new(
            "state-test-secret-0123456789abcdef",
            "murmur",
            chrono::Duration::minutes(15),
            chrono::Duration::days(14),
            db.clone(),
        );
        Arc::new(AppStateInner {
            gateway: Gateway::new(db, Registry::new(), store_timeout),
            tokens,
            history_max_limit: 50,
            auth_limiter: RateLimiter::new(50, Duration::from_secs(10)),
            login_failures: RateLimiter::new(5, Duration::from_secs(900)),
        })
    }

    #[tokio::test]
    async fn token_calls_are_bounded_by_store_timeout() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let user = Uuid::new_v4();
        db.create_user(user, "dana", "hash", None).unwrap();
        let state = state(db.clone(), Duration::from_millis(100));

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let stall = std::thread::spawn(move || {
            db.with_conn(|_| {
                locked_tx.send(()).ok();
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .unwrap();
        });
        locked_rx.recv().unwrap();

        let result = with_tokens(&state, move |tokens| tokens.issue_pair(user)).await;
        stall.join().unwrap();
        assert!(matches!(result, Err(ApiError::Internal(_))), "{:?}", result.map(|_| ()));

        let pair = with_tokens(&state, move |tokens| tokens.issue_pair(user)).await.unwrap();
        assert_eq!(pair.user_id, user);
    }
}
