//! Shared per-batch completion counters.
//!
//! Workers finish messages concurrently and each bumps its batch's counter once. The returned
//! post-increment value is what the fan-in check compares against the batch size, so increments
//! must be linearizable: no two callers may observe the same value.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;

use crate::errors::Result;
use crate::types::BatchId;

pub trait AtomicCounter: Send + Sync {
    /// Increment the batch's counter and return the new value. Counters start at zero.
    fn increment_and_get(&self, batch_id: BatchId) -> impl Future<Output = Result<u64>> + Send;

    /// Current value without incrementing.
    fn get(&self, batch_id: BatchId) -> impl Future<Output = Result<u64>> + Send;

    /// Drop the counter once its batch no longer needs it.
    fn remove(&self, batch_id: BatchId) -> impl Future<Output = Result<()>> + Send;
}

/// Process-local counter. Only linearizable within one process.
#[derive(Clone, Default)]
pub struct InMemoryCounter {
    counts: Arc<DashMap<BatchId, u64>>,
}

impl InMemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AtomicCounter for InMemoryCounter {
    async fn increment_and_get(&self, batch_id: BatchId) -> Result<u64> {
        // The entry guard holds the shard lock for the whole read-modify-write
        let mut count = self.counts.entry(batch_id).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn get(&self, batch_id: BatchId) -> Result<u64> {
        Ok(self.counts.get(&batch_id).map(|c| *c).unwrap_or(0))
    }

    async fn remove(&self, batch_id: BatchId) -> Result<()> {
        self.counts.remove(&batch_id);
        Ok(())
    }
}

#[cfg(feature = "postgres")]
pub use postgres::PostgresCounter;

#[cfg(feature = "postgres")]
mod postgres {
    use sqlx::PgPool;

    use super::AtomicCounter;
    use crate::errors::Result;
    use crate::types::BatchId;

    /// Counter shared by every worker process through one Postgres table.
    ///
    /// The upsert runs as a single statement, so concurrent increments serialize on the row lock.
    #[derive(Clone)]
    pub struct PostgresCounter {
        pool: PgPool,
    }

    impl PostgresCounter {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        pub fn migrator() -> sqlx::migrate::Migrator {
            sqlx::migrate!("./migrations")
        }
    }

    impl AtomicCounter for PostgresCounter {
        async fn increment_and_get(&self, batch_id: BatchId) -> Result<u64> {
            let count: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO batch_counters (batch_id, count)
                VALUES ($1, 1)
                ON CONFLICT (batch_id)
                DO UPDATE SET count = batch_counters.count + 1, updated_at = NOW()
                RETURNING count
                "#,
            )
            .bind(*batch_id)
            .fetch_one(&self.pool)
            .await?;
            Ok(count.max(0) as u64)
        }

        async fn get(&self, batch_id: BatchId) -> Result<u64> {
            let count: Option<i64> = sqlx::query_scalar("SELECT count FROM batch_counters WHERE batch_id = $1")
                .bind(*batch_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(count.unwrap_or(0).max(0) as u64)
        }

        async fn remove(&self, batch_id: BatchId) -> Result<()> {
            sqlx::query("DELETE FROM batch_counters WHERE batch_id = $1")
                .bind(*batch_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }
    }

}
