use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use murmur_db::{Database, time};

/// Background task that prunes expired refresh records.
///
/// The first sweep runs at startup, then once per `interval`.
pub async fn run_cleanup_loop(db: Arc<Database>, interval: Duration) {
    let mut interval = tokio::time::interval(interval);

    loop {
        interval.tick().await;

        match prune_expired(db.clone()).await {
            Ok(count) => {
                if count > 0 {
                    info!("Cleanup: pruned {} expired refresh tokens", count);
                }
            }
            Err(e) => {
                warn!("Cleanup error: {}", e);
            }
        }
    }
}

async fn prune_expired(db: Arc<Database>) -> anyhow::Result<usize> {
    tokio::task::spawn_blocking(move || db.prune_refresh_tokens(time::now())).await?
}
