mod journal;
mod memory;

pub use journal::{spawn_journal_thread, JournalStore};
pub use memory::MemoryStore;

use crate::config::{Config, StoreBackend};
use crate::scale::Measurement;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Durable home for accepted measurements and the active keg selection.
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    async fn save_measurement(&self, measurement: &Measurement) -> Result<()>;

    /// Retained measurements ordered oldest to newest.
    async fn load_recent_measurements(&self) -> Result<Vec<Measurement>>;

    async fn save_active_keg(&self, keg: i64) -> Result<()>;

    async fn load_active_keg(&self) -> Result<Option<i64>>;
}

pub fn open_store(config: &Config) -> Result<Arc<dyn MeasurementStore>> {
    let store: Arc<dyn MeasurementStore> = match config.store {
        StoreBackend::Journal => {
            Arc::new(spawn_journal_thread(&config.data_dir, config.store_retention)?)
        }
        StoreBackend::Memory => Arc::new(MemoryStore::new(config.store_retention)),
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::scale::Scale;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn journal_backed_scale_restores_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.store = StoreBackend::Journal;

        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        {
            let scale = Scale::new(&config, open_store(&config).unwrap());
            for weight in [30_000.0, 29_000.0, 28_000.0, 27_000.0] {
                scale.add_measurement_at(weight, at).await;
            }
            scale.set_active_keg(50).await.unwrap();
        }

        let scale = Scale::new(&config, open_store(&config).unwrap());
        scale.restore_from_store().await;
        assert_eq!(scale.valid_count(), 3);
        assert_eq!(scale.last_measurement().map(|m| m.weight), Some(27_000.0));
        assert_eq!(scale.measurement(2).map(|m| m.seq), Some(2));
        assert_eq!(scale.active_keg(), 50);
    }

    #[tokio::test]
    async fn memory_backend_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&test_config(dir.path())).unwrap();
        assert!(store.load_recent_measurements().await.unwrap().is_empty());
        assert_eq!(store.load_active_keg().await.unwrap(), None);
    }
}
