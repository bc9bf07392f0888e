//! Persistence layer: narrow async-trait ports plus three interchangeable
//! backends. Nothing above this crate ever matches on which backend is
//! live — it only sees [`Stores`].

pub mod backends;
pub mod error;
pub mod ports;

pub use error::{StoreError, StoreResult};
pub use ports::{HistoryStore, MappingStore, PendingQueueStore, SettingsStore, Stores, WorkerStore};

use backends::memory::{
    MemoryHistoryStore, MemoryMappingStore, MemoryPendingQueueStore, MemorySettingsStore,
    MemoryWorkerStore,
};
use backends::postgres::PostgresStores;
use backends::redis::{
    RedisHandle, RedisHistoryStore, RedisMappingStore, RedisPendingQueueStore, RedisSettingsStore,
    RedisWorkerStore,
};
use tracing::info;

/// Where persisted state lives, in precedence order: relational database,
/// else remote cache, else in-process only.
#[derive(Debug, Clone, Default)]
pub struct PersistenceConfig {
    pub database_url: Option<String>,
    pub cache_url: Option<String>,
}

/// Build the [`Stores`] bundle implied by `config`, trying each backend
/// in precedence order. The cache backend never fails here — its own
/// calls fall back to in-process internally — so this only returns an
/// error for a relational database that is configured but unreachable
/// at start-up.
pub async fn connect(config: &PersistenceConfig) -> StoreResult<Stores> {
    if let Some(database_url) = &config.database_url {
        info!("persistence backend: relational (postgres)");
        let pg = PostgresStores::connect(database_url).await?;
        return Ok(Stores {
            workers: Box::new(pg.workers()),
            mappings: Box::new(pg.mappings()),
            pending_queue: Box::new(pg.pending_queue()),
            history: Box::new(pg.history()),
            settings: Box::new(pg.settings()),
        });
    }

    if let Some(cache_url) = &config.cache_url {
        info!("persistence backend: cache (redis), falling back to in-process on error");
        let redis = RedisHandle::new(cache_url)?;
        return Ok(Stores {
            workers: Box::new(RedisWorkerStore::new(redis.clone())),
            mappings: Box::new(RedisMappingStore::new(redis.clone())),
            pending_queue: Box::new(RedisPendingQueueStore::new(redis.clone())),
            history: Box::new(RedisHistoryStore::new(redis.clone())),
            settings: Box::new(RedisSettingsStore::new(redis)),
        });
    }

    info!("persistence backend: in-process only");
    Ok(Stores {
        workers: Box::new(MemoryWorkerStore::default()),
        mappings: Box::new(MemoryMappingStore::default()),
        pending_queue: Box::new(MemoryPendingQueueStore::default()),
        history: Box::new(MemoryHistoryStore::default()),
        settings: Box::new(MemorySettingsStore::default()),
    })
}
