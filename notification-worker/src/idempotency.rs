//! Idempotency store.
//!
//! Exposed behind a small async trait so the processing pipeline can be
//! unit-tested against an in-memory fake without a live Redis instance,
//! injected explicitly rather than reached via a global singleton.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

/// TTL for a presence record: 24 hours, in seconds.
pub const IDEMPOTENCY_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum IdempotencyError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),
}

fn record_key(user_id: &str, idempotency_key: &str) -> String {
    format!("processed:{}:{}", user_id, idempotency_key)
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Returns true if `(user_id, idempotency_key)` has already been
    /// delivered. Strongly consistent read against a single shared store.
    async fn seen(&self, user_id: &str, idempotency_key: &str) -> Result<bool, IdempotencyError>;

    /// Record `(user_id, idempotency_key)` as delivered, TTL 24h. Idempotent.
    async fn mark(&self, user_id: &str, idempotency_key: &str) -> Result<(), IdempotencyError>;
}

#[derive(Clone)]
pub struct RedisIdempotencyStore {
    conn: ConnectionManager,
}

impl RedisIdempotencyStore {
    pub async fn connect(redis_url: &str) -> Result<Self, IdempotencyError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn seen(&self, user_id: &str, idempotency_key: &str) -> Result<bool, IdempotencyError> {
        let key = record_key(user_id, idempotency_key);
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(&key).await?;
        Ok(exists)
    }

    async fn mark(&self, user_id: &str, idempotency_key: &str) -> Result<(), IdempotencyError> {
        let key = record_key(user_id, idempotency_key);
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(&key, "1", IDEMPOTENCY_TTL_SECS).await?;
        Ok(())
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// In-memory fake for pipeline tests.
    #[derive(Default)]
    pub struct FakeIdempotencyStore {
        records: Mutex<HashSet<String>>,
        fail_seen: bool,
        fail_mark: bool,
    }

    impl FakeIdempotencyStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn pre_populate(self, user_id: &str, idempotency_key: &str) -> Self {
            self.records
                .lock()
                .unwrap()
                .insert(record_key(user_id, idempotency_key));
            self
        }

        pub fn failing_seen() -> Self {
            Self {
                fail_seen: true,
                ..Default::default()
            }
        }

        pub fn failing_mark() -> Self {
            Self {
                fail_mark: true,
                ..Default::default()
            }
        }

        pub fn contains(&self, user_id: &str, idempotency_key: &str) -> bool {
            self.records
                .lock()
                .unwrap()
                .contains(&record_key(user_id, idempotency_key))
        }
    }

    #[async_trait]
    impl IdempotencyStore for FakeIdempotencyStore {
        async fn seen(
            &self,
            user_id: &str,
            idempotency_key: &str,
        ) -> Result<bool, IdempotencyError> {
            if self.fail_seen {
                return Err(IdempotencyError::Unavailable(
                    redis::RedisError::from(std::io::Error::other("fake seen failure")),
                ));
            }
            Ok(self
                .records
                .lock()
                .unwrap()
                .contains(&record_key(user_id, idempotency_key)))
        }

        async fn mark(&self, user_id: &str, idempotency_key: &str) -> Result<(), IdempotencyError> {
            if self.fail_mark {
                return Err(IdempotencyError::Unavailable(
                    redis::RedisError::from(std::io::Error::other("fake mark failure")),
                ));
            }
            self.records
                .lock()
                .unwrap()
                .insert(record_key(user_id, idempotency_key));
            Ok(())
        }
    }

    #[tokio::test]
    async fn fake_store_round_trips() {
        let store = FakeIdempotencyStore::new();
        assert!(!store.seen("u1", "k1").await.unwrap());
        store.mark("u1", "k1").await.unwrap();
        assert!(store.seen("u1", "k1").await.unwrap());
    }

    #[tokio::test]
    async fn fake_store_can_be_pre_populated() {
        let store = FakeIdempotencyStore::new().pre_populate("u1", "k1");
        assert!(store.seen("u1", "k1").await.unwrap());
    }
}
