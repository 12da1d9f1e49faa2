// Dedup guard: at most one admission per (key, scheduled instant)
//
// The backing store is the only state shared between scheduler instances.
// Records are admit-once and keyed, never updated in place; `release` exists
// solely as the rollback path for a dispatch that failed after admission.

use crate::errors::DedupError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Outcome of a dispatch-attempt admission
///
/// `Duplicate` is an expected, frequent, non-error outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Duplicate,
}

/// Shared record store guaranteeing exactly-once admission per fire
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically record the fire; exactly one caller per
    /// `(key, scheduled_at)` pair receives `Admitted`.
    async fn try_admit(
        &self,
        key: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Admission, DedupError>;

    /// Roll back an admission whose dispatch failed, so a later attempt for
    /// the same instant is possible again.
    async fn release(&self, key: &str, scheduled_at: DateTime<Utc>) -> Result<(), DedupError>;
}

fn record_key(key: &str, scheduled_at: DateTime<Utc>) -> String {
    format!("fire:{}:{}", key, scheduled_at.timestamp())
}

/// Redis-backed store for deployments running more than one scheduler
/// instance against the same schedule table
pub struct RedisDedupStore {
    pool: crate::store::RedisPool,
    record_ttl: Duration,
    /// Written as the record value, so release only deletes records this
    /// instance admitted
    instance_id: String,
}

impl RedisDedupStore {
    /// Default record TTL. A given instant is only ever attempted around its
    /// fire time, so records just need to outlive the widest plausible skew
    /// between instances.
    pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(3600);

    pub fn new(pool: crate::store::RedisPool) -> Self {
        Self {
            pool,
            record_ttl: Self::DEFAULT_RECORD_TTL,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_record_ttl(mut self, record_ttl: Duration) -> Self {
        self.record_ttl = record_ttl;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    /// SET NX EX: the insert-if-absent either creates the record (admitted)
    /// or observes the existing one (duplicate), atomically.
    #[instrument(skip(self), fields(task_key = %key, scheduled_at = %scheduled_at))]
    async fn try_admit(
        &self,
        key: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Admission, DedupError> {
        let mut conn = self.pool.get_connection();
        let record = record_key(key, scheduled_at);

        let result: Option<String> = redis::cmd("SET")
            .arg(&record)
            .arg(&self.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(self.record_ttl.as_secs())
            .query_async(&mut conn)
            .await?;

        if result.is_some() {
            debug!(record = %record, "Fire admitted");
            Ok(Admission::Admitted)
        } else {
            debug!(record = %record, "Duplicate fire rejected");
            Ok(Admission::Duplicate)
        }
    }

    /// Check-and-delete so an instance can only roll back records it
    /// admitted itself; a record owned by another instance stays put.
    #[instrument(skip(self), fields(task_key = %key, scheduled_at = %scheduled_at))]
    async fn release(&self, key: &str, scheduled_at: DateTime<Utc>) -> Result<(), DedupError> {
        let mut conn = self.pool.get_connection();
        let record = record_key(key, scheduled_at);

        let script = r#"
            if redis.call("get", KEYS[1]) == ARGV[1] then
                return redis.call("del", KEYS[1])
            else
                return 0
            end
        "#;

        let deleted: i32 = redis::Script::new(script)
            .key(&record)
            .arg(&self.instance_id)
            .invoke_async(&mut conn)
            .await?;

        if deleted == 1 {
            debug!(record = %record, "Fire record released");
        } else {
            warn!(record = %record, "Fire record was not owned or already expired");
        }

        Ok(())
    }
}

/// In-process store. Valid only when the deployment guarantees a single
/// scheduler instance; a second instance with its own store would defeat the
/// exactly-once guarantee.
#[derive(Default)]
pub struct MemoryDedupStore {
    admitted: Mutex<HashSet<String>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn try_admit(
        &self,
        key: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Admission, DedupError> {
        let mut admitted = self
            .admitted
            .lock()
            .map_err(|_| DedupError::StoreUnavailable("dedup set poisoned".to_string()))?;

        if admitted.insert(record_key(key, scheduled_at)) {
            Ok(Admission::Admitted)
        } else {
            Ok(Admission::Duplicate)
        }
    }

    async fn release(&self, key: &str, scheduled_at: DateTime<Utc>) -> Result<(), DedupError> {
        let mut admitted = self
            .admitted
            .lock()
            .map_err(|_| DedupError::StoreUnavailable("dedup set poisoned".to_string()))?;

        admitted.remove(&record_key(key, scheduled_at));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 10, 0).unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_admits_once_per_fire() {
        let store = MemoryDedupStore::new();

        assert_eq!(store.try_admit("a", instant()).await.unwrap(), Admission::Admitted);
        assert_eq!(store.try_admit("a", instant()).await.unwrap(), Admission::Duplicate);
    }

    #[tokio::test]
    async fn test_memory_store_distinct_instants_are_independent() {
        let store = MemoryDedupStore::new();
        let later = instant() + chrono::Duration::minutes(10);

        assert_eq!(store.try_admit("a", instant()).await.unwrap(), Admission::Admitted);
        assert_eq!(store.try_admit("a", later).await.unwrap(), Admission::Admitted);
    }

    #[tokio::test]
    async fn test_memory_store_distinct_keys_are_independent() {
        let store = MemoryDedupStore::new();

        assert_eq!(store.try_admit("a", instant()).await.unwrap(), Admission::Admitted);
        assert_eq!(store.try_admit("b", instant()).await.unwrap(), Admission::Admitted);
    }

    #[tokio::test]
    async fn test_release_makes_the_instant_admissible_again() {
        let store = MemoryDedupStore::new();

        assert_eq!(store.try_admit("a", instant()).await.unwrap(), Admission::Admitted);
        store.release("a", instant()).await.unwrap();
        assert_eq!(store.try_admit("a", instant()).await.unwrap(), Admission::Admitted);
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_redis_store_admits_once_per_fire() {
        let config = crate::config::RedisConfig {
            url: "redis://localhost:6379".to_string(),
        };
        let pool = crate::store::RedisPool::new(&config).await.unwrap();
        let store = RedisDedupStore::new(pool).with_record_ttl(Duration::from_secs(5));

        let at = Utc::now();
        assert_eq!(store.try_admit("redis_test", at).await.unwrap(), Admission::Admitted);
        assert_eq!(store.try_admit("redis_test", at).await.unwrap(), Admission::Duplicate);

        store.release("redis_test", at).await.unwrap();
        assert_eq!(store.try_admit("redis_test", at).await.unwrap(), Admission::Admitted);
    }
}
