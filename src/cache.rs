// =============================================================================
// CATALOG CACHE
// =============================================================================
// Optional Redis read-through cache for single catalog products.
//
// - Entries expire after 5 minutes
// - Every stock change deletes the product's entry
// - Cache failures never fail a request: reads fall through to the store,
//   writes and deletes are best effort
// =============================================================================

use std::time::Instant;

use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::metrics;
use crate::models::Product;

const TTL_SECS: u64 = 300;

#[derive(Clone, Default)]
pub struct CatalogCache {
    conn: Option<ConnectionManager>,
}

fn key(product_id: Uuid) -> String {
    format!("product:{}", product_id)
}

impl CatalogCache {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn: Some(conn) })
    }

    /// A cache that never holds anything.
    pub fn disabled() -> Self {
        Self { conn: None }
    }

    pub async fn get(&self, product_id: Uuid) -> Option<Product> {
        let mut conn = self.conn.clone()?;
        let start = Instant::now();
        let cached: Option<String> = redis::cmd("GET")
            .arg(key(product_id))
            .query_async(&mut conn)
            .await
            .ok()
            .flatten();
        metrics::record_redis_operation("get", start.elapsed().as_secs_f64());

        serde_json::from_str(&cached?).ok()
    }

    pub async fn put(&self, product: &Product) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        let Ok(json) = serde_json::to_string(product) else {
            return;
        };
        let start = Instant::now();
        let result: Result<(), _> = redis::cmd("SETEX")
            .arg(key(product.id))
            .arg(TTL_SECS)
            .arg(json)
            .query_async(&mut conn)
            .await;
        metrics::record_redis_operation("set", start.elapsed().as_secs_f64());
        if let Err(err) = result {
            tracing::debug!(error = %err, product_id = %product.id, "Cache write failed");
        }
    }

    pub async fn invalidate(&self, product_id: Uuid) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        let start = Instant::now();
        let result: Result<(), _> = redis::cmd("DEL")
            .arg(key(product_id))
            .query_async(&mut conn)
            .await;
        metrics::record_redis_operation("delete", start.elapsed().as_secs_f64());
        if let Err(err) = result {
            tracing::warn!(error = %err, %product_id, "Cache invalidation failed");
        }
    }

    /// `None` when no cache is configured.
    pub async fn ping(&self) -> Option<bool> {
        let mut conn = self.conn.clone()?;
        Some(
            redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
                .is_ok(),
        )
    }
}
