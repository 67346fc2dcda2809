use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::RegionError;
use crate::region::{RegionKey, REGION_CELLS};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable key-value store holding region content.
#[async_trait]
pub trait RegionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Fetch several keys at once. Keys with no value are left out of the
    /// result. Backends with a native multi-get should override this.
    async fn batch_get(&self, keys: &[String]) -> Result<HashMap<String, String>, StoreError> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

pub type SharedRegionStore = Arc<dyn RegionStore>;

#[derive(Clone)]
pub struct RedisRegionStore {
    redis: ConnectionManager,
}

impl RedisRegionStore {
    pub async fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }
}

#[async_trait]
impl RegionStore for RedisRegionStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn batch_get(&self, keys: &[String]) -> Result<HashMap<String, String>, StoreError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.redis.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(keys
            .iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|value| (key.clone(), value)))
            .collect())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

/// In-memory store for tests and local development.
#[derive(Default)]
pub struct MemoryRegionStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryRegionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Write a value without any validation.
    pub async fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.lock().await.insert(key.into(), value.into());
    }

    pub async fn len(&self) -> usize {
        self.values.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.values.lock().await.is_empty()
    }
}

#[async_trait]
impl RegionStore for MemoryRegionStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.values.lock().await.remove(key);
        Ok(())
    }
}

/// Region content access for one room, enforcing the fixed-size contract.
#[derive(Clone)]
pub struct RegionBridge {
    store: SharedRegionStore,
    room: String,
}

impl RegionBridge {
    pub fn new(store: SharedRegionStore, room: impl Into<String>) -> Self {
        Self {
            store,
            room: room.into(),
        }
    }

    pub fn key_for(&self, region: &RegionKey) -> String {
        region_storage_key(&self.room, region)
    }

    /// Fetch content for every requested region. Missing regions and
    /// regions whose stored value has the wrong size both come back as
    /// `None`; the latter is logged.
    pub async fn load(
        &self,
        regions: &[RegionKey],
    ) -> Result<BTreeMap<RegionKey, Option<String>>, RegionError> {
        let keys: Vec<String> = regions.iter().map(|region| self.key_for(region)).collect();
        let found = self.store.batch_get(&keys).await?;

        let mut loaded = BTreeMap::new();
        for (region, key) in regions.iter().zip(keys) {
            let content = found.get(&key).cloned().and_then(|content| {
                let cells = content.chars().count();
                if cells == REGION_CELLS {
                    Some(content)
                } else {
                    warn!(
                        room = %self.room,
                        region = %region,
                        cells,
                        expected = REGION_CELLS,
                        "discarding stored region with wrong size"
                    );
                    None
                }
            });
            loaded.insert(*region, content);
        }
        Ok(loaded)
    }

    /// Persist region content. Blank content deletes the key.
    pub async fn save(&self, region: &RegionKey, content: &str) -> Result<(), RegionError> {
        let key = self.key_for(region);
        if content.trim().is_empty() {
            debug!(room = %self.room, region = %region, "deleting blank region");
            self.store.delete(&key).await?;
            return Ok(());
        }

        let cells = content.chars().count();
        if cells != REGION_CELLS {
            return Err(RegionError::SizeInvariantViolated {
                region: *region,
                found: cells,
                expected: REGION_CELLS,
            });
        }
        self.store.put(&key, content.to_string()).await?;
        Ok(())
    }
}

pub fn region_storage_key(room: &str, region: &RegionKey) -> String {
    format!("canvas:{}:region:{}", room, region)
}
