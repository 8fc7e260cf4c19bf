//! Key-value store used for rate limit counters and IP block records.
//!
//! Only plain commands are used (GET, SET with TTL, INCR, EXPIRE, TTL, DEL);
//! there are no transactions or scripts, so correctness relies on INCR being
//! atomic. Every call is bounded by the configured KV timeout.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tollgate_core::clock::SharedClock;
use tracing::{debug, info};

/// KV store failures. Callers treat all of them as "store unavailable".
#[derive(Debug, Error)]
pub enum KvError {
    #[error("KV operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("KV store error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("KV store unavailable: {0}")]
    Unavailable(String),

    #[error("Value at {0} is not an integer")]
    NotAnInteger(String),
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    /// Key exists without an expiry.
    Persistent,
    Expires(u64),
}

impl KeyTtl {
    /// Map the Redis `TTL` reply (-2 missing, -1 no expiry).
    fn from_redis(reply: i64) -> Self {
        match reply {
            -2 => KeyTtl::Missing,
            r if r < 0 => KeyTtl::Persistent,
            r => KeyTtl::Expires(r as u64),
        }
    }
}

/// Shared KV store handle.
pub type SharedKv = Arc<dyn KvStore>;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// SET, with `EX ttl_secs` when given.
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), KvError>;

    /// Atomic INCR; a missing key counts from 0.
    async fn incr(&self, key: &str) -> Result<i64, KvError>;

    /// Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, KvError>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl, KvError>;

    /// Returns true when a key was removed.
    async fn del(&self, key: &str) -> Result<bool, KvError>;

    async fn ping(&self) -> Result<(), KvError>;

    fn backend_name(&self) -> &'static str;
}

/// Redis-backed store over a multiplexed [`ConnectionManager`].
///
/// The connection is established lazily so that the gateway starts (and
/// fails open) while Redis is down.
pub struct RedisStore {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    timeout: Duration,
}

impl RedisStore {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, KvError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            timeout,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, KvError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let conn = ConnectionManager::new(self.client.clone()).await?;
                info!("Connected to Redis");
                Ok::<_, KvError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, KvError>
    where
        F: Future<Output = Result<T, KvError>>,
    {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(KvError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.bounded(async {
            let mut conn = self.connection().await?;
            Ok(conn.get(key).await?)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), KvError> {
        self.bounded(async {
            let mut conn = self.connection().await?;
            match ttl_secs {
                Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl).await?,
                None => conn.set::<_, _, ()>(key, value).await?,
            }
            Ok(())
        })
        .await
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        self.bounded(async {
            let mut conn = self.connection().await?;
            Ok(conn.incr(key, 1i64).await?)
        })
        .await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, KvError> {
        self.bounded(async {
            let mut conn = self.connection().await?;
            Ok(conn.expire(key, ttl_secs as i64).await?)
        })
        .await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, KvError> {
        self.bounded(async {
            let mut conn = self.connection().await?;
            let reply: i64 = conn.ttl(key).await?;
            Ok(KeyTtl::from_redis(reply))
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        self.bounded(async {
            let mut conn = self.connection().await?;
            let removed: i64 = conn.del(key).await?;
            Ok(removed > 0)
        })
        .await
    }

    async fn ping(&self) -> Result<(), KvError> {
        self.bounded(async {
            let mut conn = self.connection().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    /// Absolute expiry in clock milliseconds.
    expires_at: Option<u64>,
}

impl Entry {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process store driven by an injectable clock.
///
/// Used for tests and single-instance deployments without Redis. Can be
/// switched offline to exercise fail-open paths.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: SharedClock,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            offline: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail with [`KvError::Unavailable`].
    #[cfg(test)]
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    fn check_online(&self) -> Result<u64, KvError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(KvError::Unavailable("memory store offline".to_string()));
        }
        Ok(self.clock.now_millis())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now = self.check_online()?;
        Ok(self
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), KvError> {
        let now = self.check_online()?;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl_secs.map(|ttl| now + ttl * 1000),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let now = self.check_online()?;
        let mut entry = self.entries.entry(key.to_string()).or_insert(Entry {
            value: "0".to_string(),
            expires_at: None,
        });

        if !entry.is_live(now) {
            entry.value = "0".to_string();
            entry.expires_at = None;
        }

        let current: i64 = entry
            .value
            .parse()
            .map_err(|_| KvError::NotAnInteger(key.to_string()))?;
        let next = current + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, KvError> {
        let now = self.check_online()?;
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                entry.expires_at = Some(now + ttl_secs * 1000);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, KvError> {
        let now = self.check_online()?;
        Ok(match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => match entry.expires_at {
                None => KeyTtl::Persistent,
                Some(at) => KeyTtl::Expires((at - now).div_ceil(1000)),
            },
            _ => KeyTtl::Missing,
        })
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let now = self.check_online()?;
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, e)| e.is_live(now)))
    }

    async fn ping(&self) -> Result<(), KvError> {
        self.check_online()?;
        debug!("Memory store ping");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_core::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = MemoryStore::new(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_incr_and_expiry() {
        let (clock, store) = store();

        assert_eq!(store.incr("a").await.unwrap(), 1);
        assert_eq!(store.incr("a").await.unwrap(), 2);
        assert_eq!(store.ttl("a").await.unwrap(), KeyTtl::Persistent);

        assert!(store.expire("a", 10).await.unwrap());
        assert_eq!(store.ttl("a").await.unwrap(), KeyTtl::Expires(10));

        clock.advance(Duration::from_millis(9_500));
        assert_eq!(store.ttl("a").await.unwrap(), KeyTtl::Expires(1));
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("2"));

        clock.advance(Duration::from_millis(500));
        assert_eq!(store.ttl("a").await.unwrap(), KeyTtl::Missing);
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.incr("a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_set_get_del() {
        let (clock, store) = store();

        store.set("k", "v", Some(5)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.del("k").await.unwrap());
        assert!(!store.del("k").await.unwrap());

        store.set("k", "v", Some(1)).await.unwrap();
        clock.advance(Duration::from_secs(2));
        assert!(!store.expire("k", 10).await.unwrap());
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.purge_expired(), 0);
    }

    #[tokio::test]
    async fn test_incr_non_integer() {
        let (_clock, store) = store();
        store.set("k", "abc", None).await.unwrap();
        assert!(matches!(
            store.incr("k").await,
            Err(KvError::NotAnInteger(_))
        ));
    }

    #[tokio::test]
    async fn test_offline() {
        let (_clock, store) = store();
        store.set_offline(true);
        assert!(store.ping().await.is_err());
        assert!(matches!(
            store.incr("a").await,
            Err(KvError::Unavailable(_))
        ));
        store.set_offline(false);
        assert!(store.ping().await.is_ok());
    }

    #[test]
    fn test_redis_ttl_reply() {
        assert_eq!(KeyTtl::from_redis(-2), KeyTtl::Missing);
        assert_eq!(KeyTtl::from_redis(-1), KeyTtl::Persistent);
        assert_eq!(KeyTtl::from_redis(42), KeyTtl::Expires(42));
    }

    #[tokio::test]
    async fn test_redis_store_times_out_when_unreachable() {
        // Nothing listens on port 1; the call must fail rather than hang.
        let store = RedisStore::new("redis://127.0.0.1:1/0", Duration::from_millis(200)).unwrap();
        assert!(store.ping().await.is_err());
    }
}
