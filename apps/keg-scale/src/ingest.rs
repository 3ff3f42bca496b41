
use crate::error::ParseError;
use crate::message::{parse_scale_message, MessageKind};
use crate::scale::{AppendOutcome, Measurement, Scale, Transition};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub struct IngestStats {
    pub messages: AtomicU64,
    pub pushes: AtomicU64,
    pub pings: AtomicU64,
    pub parse_failures: AtomicU64,
    pub implausible: AtomicU64,
    pub persistence_failures: AtomicU64,
    pub last_message_unix_ms: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            messages: AtomicU64::new(0),
            pushes: AtomicU64::new(0),
            pings: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            implausible: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
            last_message_unix_ms: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn snapshot(&self) -> IngestStatsSnapshot {
        let last_message_ms = self.last_message_unix_ms.load(Ordering::Relaxed);
        IngestStatsSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            pushes: self.pushes.load(Ordering::Relaxed),
            pings: self.pings.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            implausible: self.implausible.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            last_message_at: (last_message_ms > 0)
                .then(|| DateTime::<Utc>::from_timestamp_millis(last_message_ms as i64))
                .flatten(),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestStatsSnapshot {
    pub messages: u64,
    pub pushes: u64,
    pub pings: u64,
    pub parse_failures: u64,
    pub implausible: u64,
    pub persistence_failures: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// What a single accepted message did to the scale.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEffect {
    /// Weight landed in the ledger; `persisted` is false when the store rejected it.
    Recorded {
        measurement: Measurement,
        persisted: bool,
    },
    /// Weight outside the plausible range; only liveness was refreshed.
    Implausible { weight: f64 },
    /// Non-push message; only liveness was refreshed.
    ContactOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub kind: MessageKind,
    pub message_id: i64,
    pub effect: IngestEffect,
    pub transition: Option<Transition>,
}

/// Turns raw telemetry lines into scale updates.
#[derive(Clone)]
pub struct Ingestor {
    scale: Scale,
    stats: Arc<IngestStats>,
}

impl Ingestor {
    pub fn new(scale: Scale) -> Self {
        Self {
            scale,
            stats: Arc::new(IngestStats::new()),
        }
    }

    pub fn scale(&self) -> &Scale {
        &self.scale
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub async fn handle_message(&self, raw: &str) -> Result<IngestOutcome, ParseError> {
        self.handle_message_at(raw, Utc::now()).await
    }

    pub async fn handle_message_at(
        &self,
        raw: &str,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, ParseError> {
        let message = match parse_scale_message(raw) {
            Ok(message) => message,
            Err(err) => {
                self.stats.parse_failures.fetch_add(1, Ordering::Relaxed);
                self.stats.set_error(err.to_string());
                tracing::warn!(error=%err, "rejected scale message");
                return Err(err);
            }
        };

        self.stats.messages.fetch_add(1, Ordering::Relaxed);
        self.stats
            .last_message_unix_ms
            .store(now.timestamp_millis().max(0) as u64, Ordering::Relaxed);

        let transition = self.scale.record_contact_at(now, message.rssi);

        let effect = match message.kind {
            MessageKind::Push => {
                self.stats.pushes.fetch_add(1, Ordering::Relaxed);
                match self.scale.add_measurement_at(message.value, now).await {
                    AppendOutcome::Recorded {
                        measurement,
                        persisted,
                    } => {
                        if !persisted {
                            self.stats
                                .persistence_failures
                                .fetch_add(1, Ordering::Relaxed);
                            self.stats.set_error(format!(
                                "measurement {} was not persisted",
                                measurement.seq
                            ));
                        }
                        tracing::debug!(
                            message_id = message.message_id,
                            seq = measurement.seq,
                            weight = measurement.weight,
                            "recorded measurement"
                        );
                        IngestEffect::Recorded {
                            measurement,
                            persisted,
                        }
                    }
                    AppendOutcome::Implausible { weight } => {
                        self.stats.implausible.fetch_add(1, Ordering::Relaxed);
                        IngestEffect::Implausible { weight }
                    }
                }
            }
            MessageKind::Ping => {
                self.stats.pings.fetch_add(1, Ordering::Relaxed);
                IngestEffect::ContactOnly
            }
            MessageKind::Other(ref token) => {
                tracing::debug!(
                    message_id = message.message_id,
                    kind = %token,
                    "contact-only message"
                );
                IngestEffect::ContactOnly
            }
        };

        Ok(IngestOutcome {
            kind: message.kind,
            message_id: message.message_id,
            effect,
            transition,
        })
    }
}
