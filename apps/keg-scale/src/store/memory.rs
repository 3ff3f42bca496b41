use super::MeasurementStore;
use crate::scale::Measurement;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Non-durable store for tests and throwaway runs. Writes can be made to fail on demand.
#[derive(Debug)]
pub struct MemoryStore {
    retention: usize,
    measurements: Mutex<VecDeque<Measurement>>,
    active_keg: Mutex<Option<i64>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            measurements: Mutex::new(VecDeque::new()),
            active_keg: Mutex::new(None),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn with_measurements<I>(retention: usize, measurements: I) -> Self
    where
        I: IntoIterator<Item = Measurement>,
    {
        let store = Self::new(retention);
        if let Ok(mut guard) = store.measurements.lock() {
            for measurement in measurements {
                push_bounded(&mut guard, measurement, store.retention);
            }
        }
        store
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.measurements.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            bail!("memory store configured to fail writes");
        }
        Ok(())
    }
}

fn push_bounded(queue: &mut VecDeque<Measurement>, measurement: Measurement, retention: usize) {
    queue.push_back(measurement);
    while queue.len() > retention {
        queue.pop_front();
    }
}

#[async_trait]
impl MeasurementStore for MemoryStore {
    async fn save_measurement(&self, measurement: &Measurement) -> Result<()> {
        self.check_writable()?;
        let mut guard = self
            .measurements
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        push_bounded(&mut guard, *measurement, self.retention);
        Ok(())
    }

    async fn load_recent_measurements(&self) -> Result<Vec<Measurement>> {
        let guard = self
            .measurements
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        Ok(guard.iter().copied().collect())
    }

    async fn save_active_keg(&self, keg: i64) -> Result<()> {
        self.check_writable()?;
        let mut guard = self
            .active_keg
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        *guard = Some(keg);
        Ok(())
    }

    async fn load_active_keg(&self) -> Result<Option<i64>> {
        let guard = self
            .active_keg
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        Ok(*guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn measurement(seq: u64) -> Measurement {
        Measurement {
            seq,
            slot_index: 0,
            weight: 20_000.0 + seq as f64,
            recorded_at: Utc.timestamp_opt(1_700_000_000 + seq as i64, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn keeps_only_the_retention_window() {
        let store = MemoryStore::new(3);
        for seq in 1..=5 {
            store.save_measurement(&measurement(seq)).await.unwrap();
        }
        let seqs: Vec<u64> = store
            .load_recent_measurements()
            .await
            .unwrap()
            .iter()
            .map(|m| m.seq)
            .collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn failing_writes_leave_contents_untouched() {
        let store = MemoryStore::with_measurements(10, [measurement(1)]);
        store.set_fail_writes(true);
        assert!(store.save_measurement(&measurement(2)).await.is_err());
        assert!(store.save_active_keg(50).await.is_err());
        assert_eq!(store.len(), 1);
        assert_eq!(store.load_active_keg().await.unwrap(), None);
    }

    #[tokio::test]
    async fn active_keg_round_trips() {
        let store = MemoryStore::new(10);
        assert_eq!(store.load_active_keg().await.unwrap(), None);
        store.save_active_keg(30).await.unwrap();
        assert_eq!(store.load_active_keg().await.unwrap(), Some(30));
    }
}
