//! Session cache collaborator interface.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::error::CacheResult;
use crate::metadata::ConnectionMetadata;

/// Cache of previously-negotiated connection metadata.
///
/// `get` distinguishes a miss (`Ok(None)`) from a backing-store error
/// (`Err`): a miss silently falls through to the live-fetch path, an error is
/// logged but treated identically to a miss. Implementations must be safe
/// under concurrent calls; last-write-wins under concurrent `set` is
/// acceptable since the metadata is advisory.
#[async_trait]
pub trait SessionCache: Send + Sync {
    /// Returns the cached metadata, or `None` on a miss.
    async fn get(&self) -> CacheResult<Option<ConnectionMetadata>>;

    /// Stores metadata with the given time-to-live.
    async fn set(&self, metadata: ConnectionMetadata, ttl: Duration) -> CacheResult<()>;
}

/// In-process session cache with TTL expiry.
#[derive(Default)]
pub struct MemorySessionCache {
    entry: RwLock<Option<Entry>>,
}

struct Entry {
    metadata: ConnectionMetadata,
    expires_at: Instant,
}

impl MemorySessionCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionCache for MemorySessionCache {
    async fn get(&self) -> CacheResult<Option<ConnectionMetadata>> {
        let entry = self.entry.read();
        Ok(entry
            .as_ref()
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.metadata.clone()))
    }

    async fn set(&self, metadata: ConnectionMetadata, ttl: Duration) -> CacheResult<()> {
        *self.entry.write() = Some(Entry {
            metadata,
            expires_at: Instant::now() + ttl,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_cache_is_a_miss_not_an_error() {
        let cache = MemorySessionCache::new();
        assert_eq!(cache.get().await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = MemorySessionCache::new();
        let meta = ConnectionMetadata::single_shard("wss://gateway.example");
        cache
            .set(meta.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get().await.unwrap(), Some(meta));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = MemorySessionCache::new();
        let meta = ConnectionMetadata::single_shard("wss://gateway.example");
        cache
            .set(meta.clone(), Duration::from_secs(30))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cache.get().await.unwrap(), Some(meta));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get().await.unwrap(), None);
    }

    #[tokio::test]
    async fn last_write_wins() {
        let cache = MemorySessionCache::new();
        let first = ConnectionMetadata::single_shard("wss://a.example");
        let second = ConnectionMetadata::single_shard("wss://b.example");
        cache.set(first, Duration::from_secs(60)).await.unwrap();
        cache
            .set(second.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get().await.unwrap(), Some(second));
    }
}
