use super::Scale;
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Periodically re-evaluates the pub state so it closes even when nobody is reading it.
pub struct VenueMonitor {
    scale: Scale,
    interval: StdDuration,
}

impl VenueMonitor {
    pub fn new(scale: Scale, interval: StdDuration) -> Self {
        Self { scale, interval }
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        let scale = self.scale;
        let interval = self.interval.max(StdDuration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        scale.recheck();
                    }
                }
            }
            tracing::debug!("venue monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WeightBounds;
    use crate::store::MemoryStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;

    fn scale(threshold: StdDuration) -> Scale {
        Scale::with_limits(
            3,
            WeightBounds::default(),
            threshold,
            Arc::new(MemoryStore::new(10)),
        )
    }

    #[tokio::test]
    async fn closes_the_pub_without_any_reader() {
        let scale = scale(StdDuration::from_secs(60));
        scale.record_contact_at(Utc::now() - ChronoDuration::seconds(120), -70.0);
        assert!(scale.is_open());

        let cancel = CancellationToken::new();
        let handle = VenueMonitor::new(scale.clone(), StdDuration::from_millis(10))
            .start(cancel.clone());

        let deadline = tokio::time::Instant::now() + StdDuration::from_secs(2);
        while scale.is_open() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        assert!(!scale.is_open());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stops_on_cancel() {
        let cancel = CancellationToken::new();
        let handle =
            VenueMonitor::new(scale(StdDuration::from_secs(60)), StdDuration::from_secs(3600))
                .start(cancel.clone());
        cancel.cancel();
        tokio::time::timeout(StdDuration::from_secs(1), handle)
            .await
            .expect("monitor should stop promptly")
            .unwrap();
    }
}
